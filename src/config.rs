//! Configuration for the dispatch and affinity layers.
//!
//! Both config structs carry validated tunables with conservative defaults
//! and can be populated from the environment for deployments that configure
//! processes that way:
//!
//! - `CLUSTERCAST_UNICAST_TIMEOUT_MS`: per-node round-trip deadline
//! - `CLUSTERCAST_DUPLICATE_BINDING`: `reject` or `replace`
//! - `CLUSTERCAST_AFFINITY_BUFFER_SIZE`: pre-computed keys per member

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_AFFINITY_BUFFER_SIZE, DEFAULT_AFFINITY_IDLE_BACKOFF_MS,
    DEFAULT_AFFINITY_RETRY_BACKOFF_MS, DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_UNICAST_TIMEOUT_SECS,
};
use crate::error::{DispatchError, DispatchResult};

/// What happens when a service name that already has an active binding on
/// this node is bound again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateBindingPolicy {
    /// Fail the second `create_dispatcher` call synchronously. The first
    /// binding stays active.
    #[default]
    Reject,
    /// The new binding supersedes the old one; inbound commands route to the
    /// new context from that point on. The superseded dispatcher keeps
    /// serving outbound calls (including local executions against its own
    /// context) until it is closed.
    Replace,
}

impl FromStr for DuplicateBindingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(DuplicateBindingPolicy::Reject),
            "replace" => Ok(DuplicateBindingPolicy::Replace),
            _ => Err(format!(
                "Unknown duplicate-binding policy '{s}'. Valid policies: reject, replace"
            )),
        }
    }
}

/// Configuration for [`CommandDispatcherFactory`](crate::CommandDispatcherFactory).
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Policy for rebinding an already-bound service name.
    pub duplicate_binding: DuplicateBindingPolicy,
    /// Deadline for one command round trip to one node.
    pub unicast_timeout: Duration,
    /// Grace period for dispatcher background tasks on close.
    pub shutdown_grace: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            duplicate_binding: DuplicateBindingPolicy::default(),
            unicast_timeout: Duration::from_secs(DEFAULT_UNICAST_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl FactoryConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> DispatchResult<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("CLUSTERCAST_UNICAST_TIMEOUT_MS") {
            let millis: u64 = value.parse().map_err(|_| {
                DispatchError::Config(format!("invalid CLUSTERCAST_UNICAST_TIMEOUT_MS: {value:?}"))
            })?;
            config.unicast_timeout = Duration::from_millis(millis);
        }
        if let Ok(value) = std::env::var("CLUSTERCAST_DUPLICATE_BINDING") {
            config.duplicate_binding = value.parse().map_err(DispatchError::Config)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.unicast_timeout.is_zero() {
            return Err(DispatchError::Config(
                "unicast_timeout must be positive".into(),
            ));
        }
        if self.shutdown_grace.is_zero() {
            return Err(DispatchError::Config(
                "shutdown_grace must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`KeyAffinityServiceFactory`](crate::KeyAffinityServiceFactory).
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Pre-computed keys buffered per cluster member.
    pub buffer_size: usize,
    /// Pause after a key-generation failure before retrying.
    pub retry_backoff: Duration,
    /// Pause between refill attempts while every member buffer is full.
    pub idle_backoff: Duration,
    /// Grace period for the refill task on stop.
    pub shutdown_grace: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_AFFINITY_BUFFER_SIZE,
            retry_backoff: Duration::from_millis(DEFAULT_AFFINITY_RETRY_BACKOFF_MS),
            idle_backoff: Duration::from_millis(DEFAULT_AFFINITY_IDLE_BACKOFF_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl AffinityConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> DispatchResult<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("CLUSTERCAST_AFFINITY_BUFFER_SIZE") {
            config.buffer_size = value.parse().map_err(|_| {
                DispatchError::Config(format!(
                    "invalid CLUSTERCAST_AFFINITY_BUFFER_SIZE: {value:?}"
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.buffer_size == 0 {
            return Err(DispatchError::Config(
                "buffer_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        FactoryConfig::default().validate().unwrap();
        AffinityConfig::default().validate().unwrap();
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "reject".parse::<DuplicateBindingPolicy>().unwrap(),
            DuplicateBindingPolicy::Reject
        );
        assert_eq!(
            "Replace".parse::<DuplicateBindingPolicy>().unwrap(),
            DuplicateBindingPolicy::Replace
        );
        assert!("shadow".parse::<DuplicateBindingPolicy>().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = FactoryConfig {
            unicast_timeout: Duration::ZERO,
            ..FactoryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DispatchError::Config(_))
        ));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = AffinityConfig {
            buffer_size: 0,
            ..AffinityConfig::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::Config(_))));
    }
}
