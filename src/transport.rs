//! Transport seam between dispatchers and the wire.
//!
//! The transport delivers encoded commands to peers and hands inbound
//! payloads to the handler registered for the service name on the local
//! node. It knows nothing about command types; both directions carry
//! opaque [`Bytes`] produced by [`codec`](crate::command::codec).
//!
//! Each transport handle is bound to one local node; a process embedding
//! several members (see [`memory`](crate::memory)) holds one handle per
//! member.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::node::Node;

/// Future returned by an inbound handler: the encoded reply envelope.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Bytes> + Send>>;

/// Handler invoked for each inbound command payload on the local node.
///
/// All command-level failures (decode errors, execution failures) are
/// encoded inside the returned envelope; only the transport reports
/// delivery failures.
pub type InboundHandler = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

/// Reasons a delivery can fail before the command runs on the target.
#[derive(Debug, Clone, Error)]
pub enum DeliveryFailure {
    /// No route to the target node.
    #[error("no route to {node}")]
    Unreachable { node: Node },

    /// The target node has no handler registered for the service.
    #[error("no handler for service {service:?} on {node}")]
    NoSuchService { service: String, node: Node },

    /// The round trip exceeded the transport deadline.
    #[error("delivery timed out after {after:?}")]
    TimedOut { after: Duration },

    /// Any other transport-level failure.
    #[error("{0}")]
    Other(String),
}

/// Delivers encoded commands between cluster members.
///
/// Inbound delivery is concurrent: the transport may invoke the registered
/// handler from many tasks at once, so handlers share state through their
/// context, not through the transport.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    /// Deliver `payload` to `target`'s handler for `service` and return the
    /// encoded reply envelope.
    async fn unicast(
        &self,
        service: &str,
        target: &Node,
        payload: Bytes,
    ) -> Result<Bytes, DeliveryFailure>;

    /// Register the local inbound handler for `service`, replacing any
    /// previous registration. Binding policy (reject vs. replace) is
    /// enforced above the transport by the dispatcher factory.
    fn register(&self, service: &str, handler: InboundHandler);

    /// Remove the local registration for `service`, if any.
    fn unregister(&self, service: &str);
}
