//! Broadcast over the command-dispatch layer.
//!
//! Broadcasting reuses cluster dispatch instead of a separate transport so
//! membership changes, failure capture, and serialization are handled once:
//! a broadcast is a [`BroadcastCommand`] fanned out to every member, and the
//! command's remote effect is "enqueue these bytes into the receiving node's
//! local delivery queue".
//!
//! # Roles
//!
//! A channel endpoint is in exactly one of three modes (`Closed`,
//! `Broadcaster`, or `Receiver`) and only the compare-and-exchange
//! transition out of `Closed` performs setup. Opening an already-open
//! channel is a silent no-op, so concurrent openers race safely: one wins,
//! the rest share whatever role won.
//!
//! # Sharing
//!
//! Channel state is shared per name within a [`BroadcastRegistry`]: all
//! endpoints on a node that use the same name see one mode and one delivery
//! queue. The registry is an explicitly owned value, not process-global
//! state; its lifetime bounds the channels it manages.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::command::{Command, CommandError};
use crate::dispatcher::{ClusterRoute, CommandDispatcher, LocalDelivery};
use crate::error::{DispatchError, DispatchResult};
use crate::factory::CommandDispatcherFactory;

/// Role of a broadcast channel on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BroadcastMode {
    /// No role; the channel performs no work.
    Closed = 0,
    /// This node sends payloads to the group.
    Broadcaster = 1,
    /// This node consumes payloads from the local delivery queue.
    Receiver = 2,
}

impl BroadcastMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BroadcastMode::Broadcaster,
            2 => BroadcastMode::Receiver,
            _ => BroadcastMode::Closed,
        }
    }
}

/// Per-name channel state shared by every endpoint using that name within
/// one registry: the role, the local delivery queue, and the dispatcher that
/// carries broadcasts while the channel is open.
pub struct BroadcastManager {
    name: String,
    mode: AtomicU8,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    dispatcher: Mutex<Option<CommandDispatcher<BroadcastCommand>>>,
}

impl BroadcastManager {
    fn new(name: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            mode: AtomicU8::new(BroadcastMode::Closed as u8),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            dispatcher: Mutex::new(None),
        }
    }

    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The channel's current role.
    pub fn mode(&self) -> BroadcastMode {
        BroadcastMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    async fn deliver(&self, payload: Bytes) -> Result<(), CommandError> {
        match self.tx.lock().await.as_ref() {
            Some(tx) => tx
                .send(payload)
                .map_err(|_| CommandError::new("broadcast queue is closed")),
            None => Err(CommandError::new("broadcast channel is closed")),
        }
    }
}

/// Dispatcher context for a broadcast channel: inbound broadcast commands
/// deposit their payload into the channel's local queue.
///
/// Holds the channel state weakly so a closed, unregistered channel does not
/// stay alive just because in-flight commands still reference the sink.
pub struct BroadcastSink {
    manager: Weak<BroadcastManager>,
}

/// The command a broadcaster fans out: carry `payload` to every member and
/// enqueue it there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastCommand {
    payload: Bytes,
}

#[async_trait]
impl Command for BroadcastCommand {
    type Context = BroadcastSink;
    type Output = ();

    async fn execute(&self, sink: &BroadcastSink) -> Result<(), CommandError> {
        match sink.manager.upgrade() {
            Some(manager) => manager.deliver(self.payload.clone()).await,
            None => Err(CommandError::new("broadcast channel is closed")),
        }
    }
}

struct RegistryInner {
    factory: Arc<CommandDispatcherFactory>,
    channels: DashMap<String, Arc<BroadcastManager>>,
}

/// Creates broadcast endpoints and owns the per-name channel state they
/// share.
#[derive(Clone)]
pub struct BroadcastRegistry {
    inner: Arc<RegistryInner>,
}

impl BroadcastRegistry {
    /// Create a registry whose endpoints dispatch through `factory`.
    pub fn new(factory: Arc<CommandDispatcherFactory>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                channels: DashMap::new(),
            }),
        }
    }

    /// An endpoint for the named channel, creating the shared channel state
    /// on first use of the name.
    pub fn endpoint(&self, channel: impl Into<String>) -> BroadcastEndpoint {
        let name = channel.into();
        let manager = self
            .inner
            .channels
            .entry(name.clone())
            .or_insert_with(|| Arc::new(BroadcastManager::new(name)))
            .clone();
        BroadcastEndpoint {
            manager,
            registry: self.inner.clone(),
        }
    }
}

/// One handle onto a named broadcast channel.
///
/// Endpoints with the same name from the same registry share role and queue;
/// an endpoint adds no state of its own.
#[derive(Clone)]
pub struct BroadcastEndpoint {
    manager: Arc<BroadcastManager>,
    registry: Arc<RegistryInner>,
}

impl BroadcastEndpoint {
    /// The channel's current role.
    pub fn mode(&self) -> BroadcastMode {
        self.manager.mode()
    }

    /// Take the broadcaster role.
    ///
    /// Performs setup only on the transition out of `Closed`; opening an
    /// already-open channel (in either role) is a silent no-op.
    pub async fn open_broadcaster(&self) -> DispatchResult<()> {
        self.open(BroadcastMode::Broadcaster).await
    }

    /// Take the receiver role. Same transition rules as
    /// [`Self::open_broadcaster`].
    pub async fn open_client(&self) -> DispatchResult<()> {
        self.open(BroadcastMode::Receiver).await
    }

    async fn open(&self, target: BroadcastMode) -> DispatchResult<()> {
        if self
            .manager
            .mode
            .compare_exchange(
                BroadcastMode::Closed as u8,
                target as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            trace!(channel = %self.manager.name, "channel already open, open is a no-op");
            return Ok(());
        }

        // An endpoint left over from a closed cycle no longer backs the
        // registry's channel state; a fresh endpoint must be obtained.
        let current = self
            .registry
            .channels
            .get(&self.manager.name)
            .map(|entry| Arc::ptr_eq(entry.value(), &self.manager))
            .unwrap_or(false);
        if !current {
            self.manager
                .mode
                .store(BroadcastMode::Closed as u8, Ordering::SeqCst);
            return Err(DispatchError::EndpointClosed);
        }

        // This caller won the transition: start the cycle with a fresh queue
        // and acquire the channel's dispatcher.
        let (tx, rx) = mpsc::unbounded_channel();
        *self.manager.tx.lock().await = Some(tx);
        *self.manager.rx.lock().await = rx;

        let service = format!("broadcast/{}", self.manager.name);
        let sink = BroadcastSink {
            manager: Arc::downgrade(&self.manager),
        };
        match self
            .registry
            .factory
            .create_dispatcher::<BroadcastCommand>(service, sink)
        {
            Ok(dispatcher) => {
                *self.manager.dispatcher.lock().await = Some(dispatcher);
                if self.manager.mode() == BroadcastMode::Closed {
                    // A concurrent close ran while setup was in progress;
                    // finish its teardown so nothing leaks.
                    if let Some(dispatcher) = self.manager.dispatcher.lock().await.take() {
                        dispatcher.close().await;
                    }
                    self.manager.tx.lock().await.take();
                    return Ok(());
                }
                debug!(channel = %self.manager.name, mode = ?target, "broadcast channel opened");
                Ok(())
            }
            Err(e) => {
                self.manager
                    .mode
                    .store(BroadcastMode::Closed as u8, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Send `payload` to every member's delivery queue, the local node's
    /// included.
    ///
    /// A no-op unless this channel is in the broadcaster role. Blocks only
    /// for the dispatch round trip, not for receivers draining their queues.
    /// Per-node delivery failures are logged and swallowed: discovery
    /// broadcasts are best-effort by design.
    pub async fn broadcast(&self, payload: Bytes) -> DispatchResult<()> {
        if self.manager.mode() != BroadcastMode::Broadcaster {
            return Ok(());
        }
        let dispatcher = self.manager.dispatcher.lock().await.clone();
        let Some(dispatcher) = dispatcher else {
            return Ok(());
        };
        let command = BroadcastCommand { payload };
        let route = ClusterRoute::new(LocalDelivery::Execute);
        match dispatcher.execute_on_cluster(&command, &route).await {
            Ok(responses) => {
                for response in responses.values() {
                    if let Err(e) = response.get() {
                        warn!(
                            channel = %self.manager.name,
                            node = %response.node(),
                            error = %e,
                            "broadcast delivery failed"
                        );
                    }
                }
                Ok(())
            }
            // The channel raced a close; a broadcast on a closed channel is
            // a no-op, not an error.
            Err(e) if e.is_illegal_state() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Await the next payload, FIFO per sender.
    ///
    /// Returns `None` without blocking unless this channel is in the
    /// receiver role; also returns `None` if the channel closes while
    /// waiting.
    pub async fn receive(&self) -> Option<Bytes> {
        if self.manager.mode() != BroadcastMode::Receiver {
            return None;
        }
        let mut rx = self.manager.rx.lock().await;
        rx.recv().await
    }

    /// As [`Self::receive`], but bounded: a timeout yields `None` rather
    /// than an error.
    pub async fn receive_timeout(&self, timeout: Duration) -> Option<Bytes> {
        if self.manager.mode() != BroadcastMode::Receiver {
            return None;
        }
        let mut rx = self.manager.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Close the channel.
    ///
    /// Exactly one caller performs the teardown: closes the underlying
    /// dispatcher, wakes parked receivers, and drops the shared state from
    /// the registry; everyone else is a no-op. Safe to call repeatedly.
    pub async fn close(&self) {
        let previous = self
            .manager
            .mode
            .swap(BroadcastMode::Closed as u8, Ordering::SeqCst);
        if previous == BroadcastMode::Closed as u8 {
            return;
        }
        if let Some(dispatcher) = self.manager.dispatcher.lock().await.take() {
            dispatcher.close().await;
        }
        // Dropping the sender wakes any parked receiver with `None`.
        self.manager.tx.lock().await.take();
        self.registry
            .channels
            .remove_if(&self.manager.name, |_, m| Arc::ptr_eq(m, &self.manager));
        debug!(channel = %self.manager.name, "broadcast channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FactoryConfig;
    use crate::memory::MemoryCluster;
    use crate::node::Node;

    fn node(name: &str) -> Node {
        Node::new(name, "127.0.0.1", 7600)
    }

    fn registry_for(cluster: &MemoryCluster, name: &str) -> BroadcastRegistry {
        let member = cluster.join(node(name));
        let factory = CommandDispatcherFactory::new(
            Arc::new(member.clone()),
            Arc::new(member),
            FactoryConfig::default(),
        )
        .unwrap();
        BroadcastRegistry::new(Arc::new(factory))
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");
        let endpoint = registry.endpoint("discovery");

        endpoint.open_broadcaster().await.unwrap();
        assert_eq!(endpoint.mode(), BroadcastMode::Broadcaster);

        // Reopening in either role changes nothing.
        endpoint.open_broadcaster().await.unwrap();
        endpoint.open_client().await.unwrap();
        assert_eq!(endpoint.mode(), BroadcastMode::Broadcaster);
    }

    #[tokio::test]
    async fn test_racing_opens_have_one_winner() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");

        let broadcaster = registry.endpoint("discovery");
        let receiver = registry.endpoint("discovery");

        let open_b = tokio::spawn(async move {
            broadcaster.open_broadcaster().await.unwrap();
            broadcaster
        });
        let open_r = tokio::spawn(async move {
            receiver.open_client().await.unwrap();
            receiver
        });

        let broadcaster = open_b.await.unwrap();
        let receiver = open_r.await.unwrap();

        // Exactly one role won; both endpoints observe it.
        let mode = broadcaster.mode();
        assert_ne!(mode, BroadcastMode::Closed);
        assert_eq!(mode, receiver.mode());
    }

    #[tokio::test]
    async fn test_receive_is_noop_outside_receiver_role() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");
        let endpoint = registry.endpoint("discovery");

        // Closed: no blocking, no payloads.
        assert_eq!(endpoint.receive().await, None);

        endpoint.open_broadcaster().await.unwrap();
        assert_eq!(endpoint.receive().await, None);
        assert_eq!(
            endpoint
                .receive_timeout(Duration::from_millis(10))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_broadcast_is_noop_outside_broadcaster_role() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");
        let endpoint = registry.endpoint("discovery");

        endpoint.open_client().await.unwrap();
        endpoint
            .broadcast(Bytes::from_static(b"ignored"))
            .await
            .unwrap();

        // Nothing was enqueued by the no-op broadcast.
        assert_eq!(
            endpoint
                .receive_timeout(Duration::from_millis(50))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_local_round_trip_and_shared_queue() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");
        let endpoint = registry.endpoint("discovery");

        // Single-node cluster: the broadcaster's own queue receives the
        // payload, but only the receiver role may consume. Flip roles via a
        // close/open cycle to drain.
        endpoint.open_broadcaster().await.unwrap();
        endpoint.broadcast(Bytes::from_static(b"hello")).await.unwrap();
        endpoint.close().await;

        let endpoint = registry.endpoint("discovery");
        endpoint.open_client().await.unwrap();
        // New open cycle starts with a fresh queue.
        assert_eq!(
            endpoint
                .receive_timeout(Duration::from_millis(50))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_close_twice_is_safe_and_frees_the_name() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");
        let endpoint = registry.endpoint("discovery");

        endpoint.open_broadcaster().await.unwrap();
        endpoint.close().await;
        endpoint.close().await;
        assert_eq!(endpoint.mode(), BroadcastMode::Closed);

        // The name can start a new cycle in a different role.
        let endpoint = registry.endpoint("discovery");
        endpoint.open_client().await.unwrap();
        assert_eq!(endpoint.mode(), BroadcastMode::Receiver);
        endpoint.close().await;
    }

    #[tokio::test]
    async fn test_stale_endpoint_cannot_reopen_a_closed_cycle() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");

        let stale = registry.endpoint("discovery");
        stale.open_broadcaster().await.unwrap();
        stale.close().await;

        // The close dropped the channel state from the registry; this handle
        // belongs to the dead cycle.
        let err = stale.open_broadcaster().await.unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::EndpointClosed));
        assert_eq!(stale.mode(), BroadcastMode::Closed);

        // A fresh endpoint starts the next cycle normally.
        let fresh = registry.endpoint("discovery");
        fresh.open_broadcaster().await.unwrap();
        assert_eq!(fresh.mode(), BroadcastMode::Broadcaster);
        fresh.close().await;
    }

    #[tokio::test]
    async fn test_parked_receiver_wakes_on_close() {
        let cluster = MemoryCluster::new();
        let registry = registry_for(&cluster, "a");
        let endpoint = registry.endpoint("discovery");
        endpoint.open_client().await.unwrap();

        let parked = endpoint.clone();
        let waiter = tokio::spawn(async move { parked.receive().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        endpoint.close().await;
        let received = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, None);
    }
}
