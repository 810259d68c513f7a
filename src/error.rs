//! Error types for the dispatch layer.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used, chosen by where the failure belongs:
//!
//! ## Per-node capture
//!
//! Failures that concern one target of a fan-out (the node was unreachable,
//! it left the group before replying, or the command itself raised) are
//! captured in that node's [`CommandResponse`](crate::command::CommandResponse)
//! slot. A failing node never aborts the rest of an in-progress fan-out.
//!
//! ## Immediate propagation
//!
//! Failures that concern the dispatcher or endpoint as a whole (it is
//! closed, the service name is already bound, the configuration is invalid)
//! propagate synchronously to the caller so "this channel is gone" is never
//! confused with "that one node failed".
//!
//! The [`DispatchError::is_illegal_state`] / [`DispatchError::is_delivery`] /
//! [`DispatchError::is_retriable`] helpers classify errors for callers that
//! own a retry policy; the dispatch layer itself never retries.

use thiserror::Error;

use crate::command::CommandError;
use crate::node::Node;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors produced by the dispatch, factory, and broadcast layers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher has been closed; no further commands are accepted.
    #[error("command dispatcher is closed")]
    DispatcherClosed,

    /// The broadcast endpoint has been closed.
    #[error("broadcast endpoint is closed")]
    EndpointClosed,

    /// The target node is not a member of the current group view.
    #[error("node {node} is not a member of the group")]
    NodeNotMember { node: Node },

    /// The target node left the group before replying.
    #[error("node {node} left the group before replying")]
    NodeLeft { node: Node },

    /// Delivery to the target node failed (unreachable, timed out, no
    /// handler registered).
    #[error("delivery to {node} failed: {reason}")]
    Delivery { node: Node, reason: String },

    /// The command executed on the target node and raised.
    #[error("command execution failed: {0}")]
    Execution(#[from] CommandError),

    /// Encoding or decoding a command or reply envelope failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The service name already has an active binding on this node.
    #[error("service {service:?} already has an active binding on this node")]
    DuplicateBinding { service: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// True if the error means the dispatcher or endpoint as a whole is gone,
    /// as opposed to one node failing.
    #[inline]
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            DispatchError::DispatcherClosed | DispatchError::EndpointClosed
        )
    }

    /// True if the error is a delivery failure localized to one target node.
    #[inline]
    pub fn is_delivery(&self) -> bool {
        matches!(
            self,
            DispatchError::NodeNotMember { .. }
                | DispatchError::NodeLeft { .. }
                | DispatchError::Delivery { .. }
        )
    }

    /// True if the remote command itself raised.
    #[inline]
    pub fn is_execution(&self) -> bool {
        matches!(self, DispatchError::Execution(_))
    }

    /// True if the failure may clear once the membership view settles.
    ///
    /// Node churn and transient delivery failures are retriable from the
    /// caller's side; closed channels, duplicate bindings, and codec or
    /// configuration errors need caller action first.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DispatchError::NodeLeft { .. } | DispatchError::Delivery { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new("a", "127.0.0.1", 7600)
    }

    #[test]
    fn test_display_includes_node() {
        let err = DispatchError::NodeLeft { node: node() };
        assert!(err.to_string().contains("a@127.0.0.1:7600"));

        let err = DispatchError::Delivery {
            node: node(),
            reason: "connection refused".into(),
        };
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_is_illegal_state() {
        assert!(DispatchError::DispatcherClosed.is_illegal_state());
        assert!(DispatchError::EndpointClosed.is_illegal_state());
        assert!(!DispatchError::NodeLeft { node: node() }.is_illegal_state());
    }

    #[test]
    fn test_is_delivery() {
        assert!(DispatchError::NodeNotMember { node: node() }.is_delivery());
        assert!(DispatchError::NodeLeft { node: node() }.is_delivery());
        assert!(
            DispatchError::Delivery {
                node: node(),
                reason: "x".into()
            }
            .is_delivery()
        );
        assert!(!DispatchError::DispatcherClosed.is_delivery());
        assert!(!DispatchError::Codec("bad".into()).is_delivery());
    }

    #[test]
    fn test_is_execution() {
        let err = DispatchError::Execution(CommandError::new("boom"));
        assert!(err.is_execution());
        assert!(!err.is_delivery());
        assert!(!DispatchError::DispatcherClosed.is_execution());
    }

    #[test]
    fn test_is_retriable() {
        assert!(DispatchError::NodeLeft { node: node() }.is_retriable());
        assert!(
            DispatchError::Delivery {
                node: node(),
                reason: "timeout".into()
            }
            .is_retriable()
        );
        assert!(!DispatchError::NodeNotMember { node: node() }.is_retriable());
        assert!(!DispatchError::DispatcherClosed.is_retriable());
        assert!(!DispatchError::DuplicateBinding { service: "s".into() }.is_retriable());
        assert!(!DispatchError::Execution(CommandError::new("boom")).is_retriable());
    }

    #[test]
    fn test_execution_from_command_error() {
        let err: DispatchError = CommandError::new("boom").into();
        assert!(err.to_string().contains("boom"));
    }
}
