//! Centralized tunable constants.
//!
//! This module consolidates the magic numbers used throughout the crate so the
//! dispatch, broadcast, and affinity layers stay consistent and the rationale
//! for each value is documented in one place.

// =============================================================================
// Dispatch Constants
// =============================================================================

/// Default deadline for a single command round trip to one node.
///
/// Applied around the transport unicast so an unresponsive peer surfaces as a
/// per-node delivery failure instead of wedging a whole cluster fan-out.
pub const DEFAULT_UNICAST_TIMEOUT_SECS: u64 = 10;

/// Default grace period when shutting down a dispatcher's background tasks.
///
/// Tasks that do not observe the shutdown signal within this window are
/// aborted and then awaited, so shutdown always terminates.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Capacity of the membership-event channel handed to group subscribers.
///
/// Listeners that fall further behind than this observe a lag notice and skip
/// ahead; they never block the membership provider.
pub const MEMBERSHIP_EVENT_CAPACITY: usize = 128;

// =============================================================================
// Affinity Constants
// =============================================================================

/// Virtual nodes placed on the consistent-hash ring per cluster member.
///
/// More virtual nodes give a smoother key distribution at the cost of a
/// larger ring. 150 keeps per-member load within a few percent of even for
/// realistic cluster sizes.
pub const VIRTUAL_NODES_PER_MEMBER: usize = 150;

/// Default number of pre-computed keys buffered per cluster member.
pub const DEFAULT_AFFINITY_BUFFER_SIZE: usize = 100;

/// Default pause between refill attempts while every member buffer is full.
pub const DEFAULT_AFFINITY_IDLE_BACKOFF_MS: u64 = 50;

/// Default pause after a key-generation failure before retrying.
pub const DEFAULT_AFFINITY_RETRY_BACKOFF_MS: u64 = 200;
