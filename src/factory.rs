//! Creation of command dispatchers and group snapshot reads.
//!
//! The factory owns the process-local table of service-name bindings. A
//! service name is a namespace shared by every node in the group: each node
//! binds its own context under the name, and inbound commands always run
//! against the receiving node's registration. Within one process the
//! [`DuplicateBindingPolicy`](crate::config::DuplicateBindingPolicy) decides
//! whether a second binding of the same name is rejected or supersedes the
//! first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};

use crate::command::{codec, Command, CommandError};
use crate::config::{DuplicateBindingPolicy, FactoryConfig};
use crate::dispatcher::{CommandDispatcher, DispatcherShared};
use crate::error::{DispatchError, DispatchResult};
use crate::group::{Group, GroupListener};
use crate::node::Node;
use crate::tasks::BackgroundTask;
use crate::transport::{CommandTransport, HandlerFuture, InboundHandler};

/// Creates [`CommandDispatcher`]s bound to service names and exposes the
/// group view they dispatch over.
pub struct CommandDispatcherFactory {
    group: Arc<dyn Group>,
    transport: Arc<dyn CommandTransport>,
    config: FactoryConfig,
    bindings: Arc<DashMap<String, u64>>,
    next_binding: AtomicU64,
}

impl CommandDispatcherFactory {
    /// Create a factory over the given membership view and transport.
    pub fn new(
        group: Arc<dyn Group>,
        transport: Arc<dyn CommandTransport>,
        config: FactoryConfig,
    ) -> DispatchResult<Self> {
        config.validate()?;
        Ok(Self {
            group,
            transport,
            config,
            bindings: Arc::new(DashMap::new()),
            next_binding: AtomicU64::new(1),
        })
    }

    /// Create a dispatcher bound to `service` and `context`.
    ///
    /// Duplicate bindings of the same service name in this process are
    /// handled per the configured policy, synchronously: a rejected binding
    /// fails here, never later.
    pub fn create_dispatcher<Cmd: Command>(
        &self,
        service: impl Into<String>,
        context: Cmd::Context,
    ) -> DispatchResult<CommandDispatcher<Cmd>> {
        self.create_internal(service.into(), context, None)
    }

    /// As [`Self::create_dispatcher`], additionally forwarding membership
    /// events to `listener` in delivery order for as long as the dispatcher
    /// is open.
    pub fn create_dispatcher_with_listener<Cmd: Command>(
        &self,
        service: impl Into<String>,
        context: Cmd::Context,
        listener: Arc<dyn GroupListener>,
    ) -> DispatchResult<CommandDispatcher<Cmd>> {
        self.create_internal(service.into(), context, Some(listener))
    }

    fn create_internal<Cmd: Command>(
        &self,
        service: String,
        context: Cmd::Context,
        listener: Option<Arc<dyn GroupListener>>,
    ) -> DispatchResult<CommandDispatcher<Cmd>> {
        if service.is_empty() {
            return Err(DispatchError::Config(
                "service name must not be empty".into(),
            ));
        }

        let binding_id = self.next_binding.fetch_add(1, Ordering::SeqCst);
        match self.bindings.entry(service.clone()) {
            Entry::Occupied(mut occupied) => match self.config.duplicate_binding {
                DuplicateBindingPolicy::Reject => {
                    return Err(DispatchError::DuplicateBinding { service });
                }
                DuplicateBindingPolicy::Replace => {
                    warn!(service = %service, "replacing active service binding");
                    occupied.insert(binding_id);
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(binding_id);
            }
        }

        let context = Arc::new(context);
        self.transport
            .register(&service, inbound_handler::<Cmd>(service.clone(), context.clone()));

        let listener_task =
            listener.map(|listener| spawn_listener_task(self.group.clone(), listener));

        debug!(service = %service, "created command dispatcher");
        Ok(CommandDispatcher::new(Arc::new(DispatcherShared {
            service,
            context,
            group: self.group.clone(),
            transport: self.transport.clone(),
            unicast_timeout: self.config.unicast_timeout,
            shutdown_grace: self.config.shutdown_grace,
            closed: std::sync::atomic::AtomicBool::new(false),
            listener_task: Mutex::new(listener_task),
            bindings: self.bindings.clone(),
            binding_id,
        })))
    }

    /// True if the local node currently holds the coordinator role.
    pub fn is_coordinator(&self) -> bool {
        self.group.is_coordinator()
    }

    /// The local node's identity.
    pub fn local_node(&self) -> Node {
        self.group.local_node()
    }

    /// The current coordinator's identity.
    pub fn coordinator_node(&self) -> Node {
        self.group.coordinator_node()
    }

    /// Snapshot of the current members.
    pub fn nodes(&self) -> Vec<Node> {
        self.group.nodes()
    }
}

/// Build the inbound side of a binding: decode, execute against the local
/// context, encode the reply envelope. Every command-level failure is carried
/// inside the envelope so the transport only ever reports delivery failures.
fn inbound_handler<Cmd: Command>(service: String, context: Arc<Cmd::Context>) -> InboundHandler {
    Arc::new(move |payload: Bytes| {
        let context = context.clone();
        let service = service.clone();
        Box::pin(async move {
            let envelope: Result<Cmd::Output, CommandError> = match codec::decode::<Cmd>(&payload)
            {
                Ok(command) => command.execute(&context).await,
                Err(e) => Err(CommandError::new(format!("inbound decode failed: {e}"))),
            };
            match codec::encode(&envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // An empty reply surfaces as a codec failure in the
                    // sender's response slot.
                    error!(service = %service, error = %e, "failed to encode reply envelope");
                    Bytes::new()
                }
            }
        }) as HandlerFuture
    })
}

fn spawn_listener_task(group: Arc<dyn Group>, listener: Arc<dyn GroupListener>) -> BackgroundTask {
    let mut events = group.subscribe();
    BackgroundTask::spawn("membership-listener", move |mut shutdown| async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Ok(event) => listener.membership_changed(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "membership listener lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
