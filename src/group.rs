//! Membership view seam.
//!
//! The group (who is in the cluster, who is local, who coordinates) is
//! owned by an external membership provider. This crate only reads it:
//! snapshot accessors for dispatch-time decisions and an event subscription
//! for listeners that track churn. Implementations must keep the snapshot
//! reads cheap; `nodes()` is called once per cluster fan-out.

use tokio::sync::broadcast;

use crate::node::Node;

/// A membership change observed on the group.
///
/// Events are delivered in the order the provider observed them. Coordinator
/// changes are reported separately from the join or leave that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node joined the group.
    Joined(Node),
    /// A node left the group (gracefully or by failure detection).
    Left(Node),
    /// The coordinator role moved to the given node.
    CoordinatorChanged(Node),
}

/// Read-through view of the current cluster membership.
///
/// The view may change concurrently with any call; callers that need a
/// consistent member list for one operation must call [`Group::nodes`] once
/// and work from that snapshot.
pub trait Group: Send + Sync + 'static {
    /// The local member's identity.
    fn local_node(&self) -> Node;

    /// The current coordinator's identity.
    fn coordinator_node(&self) -> Node;

    /// Snapshot of all current members, in provider order.
    fn nodes(&self) -> Vec<Node>;

    /// True if the local member currently holds the coordinator role.
    fn is_coordinator(&self) -> bool {
        self.local_node() == self.coordinator_node()
    }

    /// Subscribe to membership changes.
    ///
    /// The receiver observes events from the moment of subscription; slow
    /// consumers may lag and skip ahead rather than block the provider.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Callback interface for dispatcher-scoped membership listeners.
///
/// Registered through the factory when a dispatcher is created; invoked in
/// delivery order on a dedicated task for as long as the dispatcher is open.
/// Implementations must not block; long work belongs on the listener's own
/// executor.
pub trait GroupListener: Send + Sync + 'static {
    /// Called for each membership change while the owning dispatcher is open.
    fn membership_changed(&self, event: &MembershipEvent);
}

impl<F> GroupListener for F
where
    F: Fn(&MembershipEvent) + Send + Sync + 'static,
{
    fn membership_changed(&self, event: &MembershipEvent) {
        self(event)
    }
}
