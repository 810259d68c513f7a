//! Command dispatch to one node or the whole group.
//!
//! A dispatcher is bound to one service name and one context value for its
//! lifetime. Outbound commands are encoded once, then routed: the local node
//! executes directly against the bound context (after a codec round trip, so
//! local and remote targets see identical values), every remote node gets a
//! transport unicast with its own spawned task.
//!
//! # Failure capture
//!
//! A fan-out never aborts because one node failed. Each targeted node owns a
//! slot in the result map; unreachable nodes, nodes that left before
//! replying, and commands that raised all land in their slot as typed
//! failures. Only whole-channel problems (the dispatcher is closed, the
//! command cannot be encoded) propagate as top-level errors.
//!
//! # Membership snapshots
//!
//! `execute_on_cluster` reads the member list exactly once per call. Nodes
//! that join after the snapshot are not targeted; nodes that leave after the
//! snapshot show up as failed entries rather than disappearing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::command::{codec, ClusterSubmission, Command, CommandError, CommandResponse, SubmittedCommand};
use crate::error::{DispatchError, DispatchResult};
use crate::group::Group;
use crate::node::Node;
use crate::tasks::BackgroundTask;
use crate::transport::{CommandTransport, DeliveryFailure};

/// Whether a cluster fan-out also executes on the local node.
///
/// There is no default on purpose: call sites differ, so every fan-out states
/// its choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDelivery {
    /// Execute on the local node's context as well as on remote members.
    Execute,
    /// Target remote members only.
    Skip,
}

/// Targeting for one cluster fan-out: the local-delivery choice plus an
/// excluded-node set.
#[derive(Debug, Clone)]
pub struct ClusterRoute {
    local: LocalDelivery,
    excluded: BTreeSet<Node>,
}

impl ClusterRoute {
    /// A route targeting every current member, with the given local-delivery
    /// choice.
    pub fn new(local: LocalDelivery) -> Self {
        Self {
            local,
            excluded: BTreeSet::new(),
        }
    }

    /// Exclude one node from the fan-out.
    pub fn exclude(mut self, node: Node) -> Self {
        self.excluded.insert(node);
        self
    }

    /// Exclude several nodes from the fan-out.
    pub fn exclude_all(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.excluded.extend(nodes);
        self
    }

    /// The local-delivery choice.
    pub fn local_delivery(&self) -> LocalDelivery {
        self.local
    }

    /// True if the node is excluded from this route.
    pub fn is_excluded(&self, node: &Node) -> bool {
        self.excluded.contains(node)
    }
}

pub(crate) struct DispatcherShared<Cmd: Command> {
    pub(crate) service: String,
    pub(crate) context: Arc<Cmd::Context>,
    pub(crate) group: Arc<dyn Group>,
    pub(crate) transport: Arc<dyn CommandTransport>,
    pub(crate) unicast_timeout: Duration,
    pub(crate) shutdown_grace: Duration,
    pub(crate) closed: AtomicBool,
    pub(crate) listener_task: Mutex<Option<BackgroundTask>>,
    pub(crate) bindings: Arc<DashMap<String, u64>>,
    pub(crate) binding_id: u64,
}

impl<Cmd: Command> DispatcherShared<Cmd> {
    /// Map a transport failure onto the dispatch taxonomy: a target that is
    /// no longer in the view left before replying; anything else is a plain
    /// delivery failure against a live member.
    fn classify(&self, node: &Node, failure: &DeliveryFailure) -> DispatchError {
        if !self.group.nodes().contains(node) {
            DispatchError::NodeLeft { node: node.clone() }
        } else {
            DispatchError::Delivery {
                node: node.clone(),
                reason: failure.to_string(),
            }
        }
    }

    async fn dispatch_remote(&self, node: Node, payload: Bytes) -> CommandResponse<Cmd::Output> {
        let outcome = tokio::time::timeout(
            self.unicast_timeout,
            self.transport.unicast(&self.service, &node, payload),
        )
        .await;
        match outcome {
            Err(_) => {
                let failure = DeliveryFailure::TimedOut {
                    after: self.unicast_timeout,
                };
                let error = self.classify(&node, &failure);
                CommandResponse::failure(node, error)
            }
            Ok(Err(failure)) => {
                let error = self.classify(&node, &failure);
                CommandResponse::failure(node, error)
            }
            Ok(Ok(reply)) => match codec::decode::<Result<Cmd::Output, CommandError>>(&reply) {
                Ok(Ok(value)) => CommandResponse::success(node, value),
                Ok(Err(raised)) => {
                    CommandResponse::failure(node, DispatchError::Execution(raised))
                }
                Err(error) => CommandResponse::failure(node, error),
            },
        }
    }

    async fn execute_local(&self, payload: Bytes) -> CommandResponse<Cmd::Output> {
        let node = self.group.local_node();
        let command: Cmd = match codec::decode(&payload) {
            Ok(command) => command,
            Err(error) => return CommandResponse::failure(node, error),
        };
        match command.execute(&self.context).await {
            Ok(value) => CommandResponse::success(node, value),
            Err(raised) => CommandResponse::failure(node, DispatchError::Execution(raised)),
        }
    }
}

/// Routes commands to one node or the whole group under one service name.
///
/// Cheap to clone; all clones share the same binding and close together.
pub struct CommandDispatcher<Cmd: Command> {
    shared: Arc<DispatcherShared<Cmd>>,
}

impl<Cmd: Command> Clone for CommandDispatcher<Cmd> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Cmd: Command> std::fmt::Debug for CommandDispatcher<Cmd> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("service", &self.shared.service)
            .finish()
    }
}

impl<Cmd: Command> CommandDispatcher<Cmd> {
    pub(crate) fn new(shared: Arc<DispatcherShared<Cmd>>) -> Self {
        Self { shared }
    }

    /// The service name this dispatcher is bound to.
    pub fn service(&self) -> &str {
        &self.shared.service
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> DispatchResult<()> {
        if self.is_closed() {
            Err(DispatchError::DispatcherClosed)
        } else {
            Ok(())
        }
    }

    /// Execute a command on one member and wait for its reply.
    ///
    /// Fails fast, captured in the response without any transport attempt
    /// or retry, if `node` is not currently a member. Retry policy belongs
    /// to the caller.
    pub async fn execute_on_node(
        &self,
        command: &Cmd,
        node: &Node,
    ) -> DispatchResult<CommandResponse<Cmd::Output>> {
        Ok(self.submit_on_node(command, node)?.join().await)
    }

    /// Submit a command to one member without blocking the calling task.
    pub fn submit_on_node(
        &self,
        command: &Cmd,
        node: &Node,
    ) -> DispatchResult<SubmittedCommand<Cmd::Output>> {
        self.ensure_open()?;
        let payload = codec::encode(command)?;
        let target = node.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            if !shared.group.nodes().contains(&target) {
                let error = DispatchError::NodeNotMember {
                    node: target.clone(),
                };
                return CommandResponse::failure(target, error);
            }
            if target == shared.group.local_node() {
                shared.execute_local(payload).await
            } else {
                shared.dispatch_remote(target, payload).await
            }
        });
        Ok(SubmittedCommand::new(node.clone(), handle))
    }

    /// Execute a command on every current member selected by `route` and
    /// wait for all of them.
    ///
    /// The returned map holds one entry per targeted node, successes and
    /// per-node failures alike. Excluded nodes never appear.
    pub async fn execute_on_cluster(
        &self,
        command: &Cmd,
        route: &ClusterRoute,
    ) -> DispatchResult<BTreeMap<Node, CommandResponse<Cmd::Output>>> {
        Ok(self.submit_on_cluster(command, route)?.join().await)
    }

    /// Fan a command out to the group without blocking the calling task.
    pub fn submit_on_cluster(
        &self,
        command: &Cmd,
        route: &ClusterRoute,
    ) -> DispatchResult<ClusterSubmission<Cmd::Output>> {
        self.ensure_open()?;
        let payload = codec::encode(command)?;
        let local = self.shared.group.local_node();
        let snapshot = self.shared.group.nodes();
        let mut pending = Vec::with_capacity(snapshot.len());
        for target in snapshot {
            if route.is_excluded(&target) {
                continue;
            }
            let is_local = target == local;
            if is_local && route.local_delivery() == LocalDelivery::Skip {
                continue;
            }
            let shared = self.shared.clone();
            let payload = payload.clone();
            let node = target.clone();
            let handle = tokio::spawn(async move {
                if is_local {
                    shared.execute_local(payload).await
                } else {
                    shared.dispatch_remote(node, payload).await
                }
            });
            pending.push(SubmittedCommand::new(target, handle));
        }
        Ok(ClusterSubmission::new(pending))
    }

    /// Close the dispatcher.
    ///
    /// Idempotent and infallible: the first call releases the service
    /// binding and stops listener forwarding; later calls return without
    /// doing anything. In-flight commands run to completion or fail cleanly;
    /// new `execute*`/`submit*` calls fail with
    /// [`DispatchError::DispatcherClosed`].
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.shared.listener_task.lock().await.take() {
            task.shutdown(self.shared.shutdown_grace).await;
        }
        // Only tear down the transport registration if the binding is still
        // ours; under the replace policy a newer dispatcher may own it now.
        let owned = self
            .shared
            .bindings
            .remove_if(&self.shared.service, |_, id| *id == self.shared.binding_id)
            .is_some();
        if owned {
            self.shared.transport.unregister(&self.shared.service);
        }
        debug!(service = %self.shared.service, "command dispatcher closed");
    }
}
