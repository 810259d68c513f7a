//! Commands, responses, and the wire codec seam.
//!
//! A [`Command`] is a pure serializable value executed against the receiving
//! node's own context object, never the sender's. Its output travels back in
//! a serialized `Result` envelope, so a remote execution failure is rethrown
//! at the caller from [`CommandResponse::get`] rather than being swallowed.
//!
//! Commands cross the wire through [`codec`]: values are encoded once per
//! dispatch and decoded on every receiving node, including the local one, so
//! local and remote targets observe identical command values.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{DispatchError, DispatchResult};
use crate::node::Node;

/// Failure raised by a command's own execution, serializable so it can
/// travel back from the node that ran the command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    /// Create a command error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A serializable unit of work executed on cluster members.
///
/// The context type is chosen by whoever creates the dispatcher; every node
/// that binds a dispatcher under the same service name registers its own
/// context value, and inbound commands run against that local registration.
///
/// Commands are usually enums when a service supports several operations:
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use clustercast::{Command, CommandError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// enum RegistryCommand {
///     Put { key: String, value: String },
///     Get { key: String },
/// }
///
/// struct Registry {
///     entries: tokio::sync::Mutex<std::collections::HashMap<String, String>>,
/// }
///
/// #[async_trait]
/// impl Command for RegistryCommand {
///     type Context = Registry;
///     type Output = Option<String>;
///
///     async fn execute(&self, registry: &Registry) -> Result<Option<String>, CommandError> {
///         let mut entries = registry.entries.lock().await;
///         Ok(match self {
///             RegistryCommand::Put { key, value } => entries.insert(key.clone(), value.clone()),
///             RegistryCommand::Get { key } => entries.get(key).cloned(),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The per-dispatcher context the command executes against.
    type Context: Send + Sync + 'static;

    /// The command's result type.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Execute the command against the receiving node's context.
    async fn execute(&self, context: &Self::Context) -> Result<Self::Output, CommandError>;
}

/// Outcome of one command on one target node.
///
/// Exactly one of these exists per (command, target) pair in a fan-out
/// result map; a failed node occupies its slot with the failure rather than
/// disappearing from the map.
#[derive(Debug)]
pub struct CommandResponse<R> {
    node: Node,
    outcome: Result<R, DispatchError>,
}

impl<R> CommandResponse<R> {
    pub(crate) fn success(node: Node, value: R) -> Self {
        Self {
            node,
            outcome: Ok(value),
        }
    }

    pub(crate) fn failure(node: Node, error: DispatchError) -> Self {
        Self {
            node,
            outcome: Err(error),
        }
    }

    /// The node this response came from (or failed against).
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// True if the command executed and replied successfully.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The command's result, raising the captured failure if there was one.
    pub fn get(&self) -> Result<&R, &DispatchError> {
        self.outcome.as_ref()
    }

    /// Consume the response, yielding the result or the captured failure.
    pub fn into_result(self) -> DispatchResult<R> {
        self.outcome
    }
}

/// Handle for a command submitted to one node without blocking the caller.
///
/// Dropping the handle detaches the in-flight command; it still executes,
/// but the response is discarded.
#[derive(Debug)]
pub struct SubmittedCommand<R> {
    node: Node,
    handle: JoinHandle<CommandResponse<R>>,
}

impl<R: Send + 'static> SubmittedCommand<R> {
    pub(crate) fn new(node: Node, handle: JoinHandle<CommandResponse<R>>) -> Self {
        Self { node, handle }
    }

    /// The target node.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Await the command's response.
    pub async fn join(self) -> CommandResponse<R> {
        let Self { node, handle } = self;
        match handle.await {
            Ok(response) => response,
            Err(e) => CommandResponse::failure(
                node.clone(),
                DispatchError::Delivery {
                    node,
                    reason: format!("dispatch task failed: {e}"),
                },
            ),
        }
    }
}

/// Handle for a command fanned out to many nodes without blocking the caller.
#[derive(Debug)]
pub struct ClusterSubmission<R> {
    pending: Vec<SubmittedCommand<R>>,
}

impl<R: Send + 'static> ClusterSubmission<R> {
    pub(crate) fn new(pending: Vec<SubmittedCommand<R>>) -> Self {
        Self { pending }
    }

    /// Number of targeted nodes.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if no node was targeted.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The targeted nodes, in submission order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.pending.iter().map(|p| p.node())
    }

    /// Await every targeted node's response.
    ///
    /// The commands run concurrently; this only harvests their outcomes. The
    /// returned map holds exactly one entry per targeted node.
    pub async fn join(self) -> BTreeMap<Node, CommandResponse<R>> {
        let mut responses = BTreeMap::new();
        for pending in self.pending {
            let response = pending.join().await;
            responses.insert(response.node().clone(), response);
        }
        responses
    }
}

/// The marshalling seam between commands and the transport.
///
/// Command and envelope values are serde-serialized; the byte format is
/// owned here so dispatchers and inbound handlers cannot drift apart.
pub mod codec {
    use bytes::Bytes;
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use crate::error::{DispatchError, DispatchResult};

    /// Encode a value for transmission.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> DispatchResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| DispatchError::Codec(e.to_string()))
    }

    /// Decode a received value.
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DispatchResult<T> {
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = CommandError::new("lookup failed");
        assert_eq!(err.to_string(), "lookup failed");
    }

    #[test]
    fn test_response_success() {
        let node = Node::new("a", "h", 1);
        let response = CommandResponse::success(node.clone(), 42);
        assert!(response.is_success());
        assert_eq!(response.node(), &node);
        assert_eq!(response.get().copied().unwrap(), 42);
        assert_eq!(response.into_result().unwrap(), 42);
    }

    #[test]
    fn test_response_failure_rethrows() {
        let node = Node::new("a", "h", 1);
        let response: CommandResponse<i32> =
            CommandResponse::failure(node, DispatchError::Execution(CommandError::new("boom")));
        assert!(!response.is_success());
        let err = response.into_result().unwrap_err();
        assert!(err.is_execution());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_codec_round_trip() {
        let value = vec!["a".to_string(), "b".to_string()];
        let bytes = codec::encode(&value).unwrap();
        let back: Vec<String> = codec::decode(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn test_codec_envelope_round_trip() {
        let envelope: Result<u64, CommandError> = Err(CommandError::new("remote raised"));
        let bytes = codec::encode(&envelope).unwrap();
        let back: Result<u64, CommandError> = codec::decode(&bytes).unwrap();
        assert_eq!(back.unwrap_err().to_string(), "remote raised");
    }

    #[test]
    fn test_codec_decode_garbage_is_codec_error() {
        let err = codec::decode::<u64>(b"not json").unwrap_err();
        assert!(matches!(err, DispatchError::Codec(_)));
    }
}
