//! Key generation biased toward node locality.
//!
//! A key-affinity service produces cache keys whose computed owner is a
//! requested node, so data written under those keys lands locally. Two
//! variants exist, chosen once at construction from the cache's declared
//! clustering mode:
//!
//! - **Clustered**: a background task continuously pre-computes keys,
//!   placing each into a bounded buffer for the member that owns it on the
//!   consistent-hash ring. Requests draw from the buffer, so every key
//!   handed out resolved to the requested node at buffering time.
//! - **Trivial**: for caches that are not distributed there is no ownership
//!   to honor; requests proxy straight to the raw generator and callers must
//!   treat locality as a best-effort hint.
//!
//! # Lifecycle
//!
//! `start` and `stop` are the only lifecycle authority for the service.
//! Topology-change notifications from the cache invalidate buffered keys
//! (their ownership is stale) but never stop key generation; a service is
//! stopped exclusively by its owner, and once `stop` returns no further
//! buffer writes occur.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use conhash::ConsistentHash;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::AffinityConfig;
use crate::constants::{MEMBERSHIP_EVENT_CAPACITY, VIRTUAL_NODES_PER_MEMBER};
use crate::error::DispatchResult;
use crate::node::Node;
use crate::tasks::BackgroundTask;

/// Failure raised by a key generator.
#[derive(Debug, Clone, Error)]
#[error("key generation failed: {0}")]
pub struct KeyGenerationError(pub String);

impl KeyGenerationError {
    /// Create a generation error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Produces candidate cache keys.
///
/// Generators are called from the refill task (clustered variant) or
/// directly per request (trivial variant); they must be cheap and safe to
/// call concurrently.
pub trait KeyGenerator<K>: Send + Sync + 'static {
    /// Produce the next candidate key.
    fn next_key(&self) -> Result<K, KeyGenerationError>;
}

impl<K, F> KeyGenerator<K> for F
where
    F: Fn() -> Result<K, KeyGenerationError> + Send + Sync + 'static,
{
    fn next_key(&self) -> Result<K, KeyGenerationError> {
        self()
    }
}

/// A change in the cache's member set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyChange {
    /// The member set after the change.
    pub members: Vec<Node>,
}

/// Introspection over the underlying cache's clustering topology.
///
/// Supplied by the cache integration; this crate only reads it. The owner
/// function must be deterministic for a given member set so that keys
/// buffered for a node remain valid until the topology actually changes.
pub trait CacheTopology: Send + Sync + 'static {
    /// True if the cache runs in a distributed (multi-owner, partitioned)
    /// mode. Decides the service variant, once, at construction.
    fn is_distributed(&self) -> bool;

    /// The local member's address.
    fn local_address(&self) -> Node;

    /// Snapshot of the cache's current members.
    fn members(&self) -> Vec<Node>;

    /// The member owning `key`, if any member exists.
    fn owner_of(&self, key: &[u8]) -> Option<Node>;

    /// Subscribe to member-set changes.
    fn subscribe_changes(&self) -> broadcast::Receiver<TopologyChange>;
}

/// Compute the ring owner for a key.
///
/// Each member is placed on the ring with [`VIRTUAL_NODES_PER_MEMBER`]
/// replicas, which keeps the key distribution even and limits reshuffling to
/// roughly `1/n` of the key space when the member set changes.
fn ring_owner(members: &[Node], key: &[u8]) -> Option<Node> {
    match members {
        [] => None,
        [only] => Some(only.clone()),
        _ => {
            let mut ring: ConsistentHash<Node> = ConsistentHash::new();
            for member in members {
                ring.add(member, VIRTUAL_NODES_PER_MEMBER);
            }
            ring.get(key).cloned()
        }
    }
}

/// [`CacheTopology`] backed by a consistent-hash ring over an updatable
/// member list.
pub struct HashRingTopology {
    local: Node,
    distributed: bool,
    members: RwLock<Vec<Node>>,
    changes: broadcast::Sender<TopologyChange>,
}

impl HashRingTopology {
    /// A distributed topology over the given members.
    pub fn distributed(local: Node, members: Vec<Node>) -> Self {
        let (changes, _) = broadcast::channel(MEMBERSHIP_EVENT_CAPACITY);
        Self {
            local,
            distributed: true,
            members: RwLock::new(members),
            changes,
        }
    }

    /// A non-distributed, local-only topology.
    pub fn local_only(local: Node) -> Self {
        let (changes, _) = broadcast::channel(MEMBERSHIP_EVENT_CAPACITY);
        let members = vec![local.clone()];
        Self {
            local,
            distributed: false,
            members: RwLock::new(members),
            changes,
        }
    }

    /// Replace the member set and notify subscribers.
    pub fn update_members(&self, members: Vec<Node>) {
        *self
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner) = members.clone();
        let _ = self.changes.send(TopologyChange { members });
    }
}

impl CacheTopology for HashRingTopology {
    fn is_distributed(&self) -> bool {
        self.distributed
    }

    fn local_address(&self) -> Node {
        self.local.clone()
    }

    fn members(&self) -> Vec<Node> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn owner_of(&self, key: &[u8]) -> Option<Node> {
        let members = self
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        ring_owner(&members, key)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<TopologyChange> {
        self.changes.subscribe()
    }
}

/// Errors from key-affinity requests.
#[derive(Debug, Error)]
pub enum AffinityError {
    /// The service has not been started yet.
    #[error("key affinity service has not been started")]
    NotStarted,

    /// The service has been stopped by its owner.
    #[error("key affinity service is stopped")]
    Stopped,

    /// The requested node is not in the cache topology.
    #[error("node {node} is not in the cache topology")]
    UnknownNode { node: Node },

    /// The cache topology has no members to own keys.
    #[error("the cache topology has no members")]
    NoMembers,

    /// The underlying key generator failed.
    #[error(transparent)]
    Generation(#[from] KeyGenerationError),
}

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct ClusteredInner<K> {
    topology: Arc<dyn CacheTopology>,
    generator: Arc<dyn KeyGenerator<K>>,
    config: AffinityConfig,
    state: AtomicU8,
    /// Per-member buffers of pre-computed keys. The refill task owns the
    /// sending halves; consumers share the receiving halves.
    buffers: DashMap<Node, Arc<Mutex<mpsc::Receiver<K>>>>,
    task: Mutex<Option<BackgroundTask>>,
}

impl<K: Send + 'static> ClusteredInner<K> {
    /// Replace all member buffers, dropping whatever was queued. The old
    /// senders die with the caller's previous map, which wakes consumers
    /// parked on replaced buffers so they re-resolve.
    fn build_buffers(&self, members: &[Node]) -> HashMap<Node, mpsc::Sender<K>> {
        self.buffers.clear();
        let mut senders = HashMap::with_capacity(members.len());
        for member in members {
            let (tx, rx) = mpsc::channel(self.config.buffer_size);
            self.buffers
                .insert(member.clone(), Arc::new(Mutex::new(rx)));
            senders.insert(member.clone(), tx);
        }
        senders
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }
}

/// The buffered, ownership-honoring variant for distributed caches.
pub struct ClusteredAffinity<K> {
    inner: Arc<ClusteredInner<K>>,
}

impl<K: AsRef<[u8]> + Send + 'static> ClusteredAffinity<K> {
    fn new(
        topology: Arc<dyn CacheTopology>,
        generator: Arc<dyn KeyGenerator<K>>,
        config: AffinityConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClusteredInner {
                topology,
                generator,
                config,
                state: AtomicU8::new(STATE_NEW),
                buffers: DashMap::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the refill task. Idempotent while running; a stopped service
    /// stays stopped.
    pub async fn start(&self) {
        match self.inner.state.compare_exchange(
            STATE_NEW,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_STOPPED) => {
                warn!("key affinity service is stopped, start ignored");
                return;
            }
            Err(_) => return,
        }

        let members = self.inner.topology.members();
        let senders = self.inner.build_buffers(&members);
        let inner = self.inner.clone();
        let task = BackgroundTask::spawn("affinity-refill", move |shutdown| {
            refill_loop(inner, senders, shutdown)
        });
        *self.inner.task.lock().await = Some(task);
        debug!(members = members.len(), "key affinity service started");
    }

    /// Stop the refill task.
    ///
    /// Waits for the task to terminate; no buffer write happens after this
    /// returns. Consumers parked on a buffer wake with
    /// [`AffinityError::Stopped`].
    pub async fn stop(&self) {
        if self.inner.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return;
        }
        if let Some(task) = self.inner.task.lock().await.take() {
            task.shutdown(self.inner.config.shutdown_grace).await;
        }
        debug!("key affinity service stopped");
    }

    /// A pre-computed key owned by `node`, waiting for the refill task if
    /// the buffer is momentarily empty.
    pub async fn key_for_node(&self, node: &Node) -> Result<K, AffinityError> {
        loop {
            match self.inner.state() {
                STATE_NEW => return Err(AffinityError::NotStarted),
                STATE_STOPPED => return Err(AffinityError::Stopped),
                _ => {}
            }

            let buffer = self.inner.buffers.get(node).map(|e| e.value().clone());
            let Some(buffer) = buffer else {
                if !self.inner.topology.members().contains(node) {
                    return Err(AffinityError::UnknownNode { node: node.clone() });
                }
                // A just-joined member: the refill task has not built its
                // buffer yet.
                tokio::time::sleep(self.inner.config.idle_backoff).await;
                continue;
            };

            let mut receiver = buffer.lock().await;
            match receiver.recv().await {
                Some(key) => return Ok(key),
                // Buffer was rebuilt (topology change) or the service is
                // stopping; the state check at the top of the loop decides.
                None => continue,
            }
        }
    }

    /// A key colocated with `other`, owned by the same member.
    pub async fn collocated_key(&self, other: &K) -> Result<K, AffinityError> {
        match self.inner.topology.owner_of(other.as_ref()) {
            Some(owner) => self.key_for_node(&owner).await,
            None => Err(AffinityError::NoMembers),
        }
    }
}

/// Pre-compute keys and place each into its owner's buffer.
///
/// Generation failures are logged and retried with backoff; they never
/// propagate to consumers, which keep draining whatever is buffered. Keys
/// whose owner's buffer is full are discarded; generation is cheap and the
/// next round will refill.
async fn refill_loop<K: AsRef<[u8]> + Send + 'static>(
    inner: Arc<ClusteredInner<K>>,
    mut senders: HashMap<Node, mpsc::Sender<K>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut changes = inner.topology.subscribe_changes();
    let mut consecutive_drops = 0usize;
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => break,
            Err(_) => {}
        }

        match changes.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                // Ownership moved: everything buffered is stale. Rebuild and
                // keep generating; churn never stops the service.
                let members = inner.topology.members();
                senders = inner.build_buffers(&members);
                debug!(
                    members = members.len(),
                    "cache topology changed, discarded buffered keys"
                );
                continue;
            }
            Err(_) => {}
        }

        if senders.is_empty() || senders.values().all(|s| s.capacity() == 0) {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(inner.config.idle_backoff) => {}
            }
            continue;
        }

        match inner.generator.next_key() {
            Err(e) => {
                warn!(error = %e, "key generation failed, backing off");
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(inner.config.retry_backoff) => {}
                }
            }
            Ok(key) => {
                let members = inner.topology.members();
                let delivered = match ring_owner(&members, key.as_ref()) {
                    // A full buffer drops the key.
                    Some(owner) => senders
                        .get(&owner)
                        .is_some_and(|sender| sender.try_send(key).is_ok()),
                    None => false,
                };
                if delivered {
                    consecutive_drops = 0;
                } else {
                    consecutive_drops += 1;
                    // A skewed key distribution can keep one buffer full
                    // while the rest have room; don't spin through drops.
                    if consecutive_drops >= inner.config.buffer_size {
                        consecutive_drops = 0;
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(inner.config.idle_backoff) => {}
                        }
                    }
                }
            }
        }
    }
}

/// The pass-through variant for non-distributed caches.
///
/// No buffering and no ownership verification: every request draws straight
/// from the raw generator, and locality is only a hint.
pub struct TrivialAffinity<K> {
    generator: Arc<dyn KeyGenerator<K>>,
    state: AtomicU8,
}

impl<K: Send + 'static> TrivialAffinity<K> {
    fn new(generator: Arc<dyn KeyGenerator<K>>) -> Self {
        Self {
            generator,
            state: AtomicU8::new(STATE_NEW),
        }
    }

    /// Mark the service active. No background work is involved.
    pub fn start(&self) {
        let _ = self.state.compare_exchange(
            STATE_NEW,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Mark the service stopped.
    pub fn stop(&self) {
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> Result<(), AffinityError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_NEW => Err(AffinityError::NotStarted),
            STATE_STOPPED => Err(AffinityError::Stopped),
            _ => Ok(()),
        }
    }

    /// Any key from the raw generator; the node is ignored.
    pub fn key_for_node(&self, _node: &Node) -> Result<K, AffinityError> {
        self.ensure_running()?;
        Ok(self.generator.next_key()?)
    }

    /// Any key from the raw generator; no colocation claim is made.
    pub fn collocated_key(&self, _other: &K) -> Result<K, AffinityError> {
        self.ensure_running()?;
        Ok(self.generator.next_key()?)
    }
}

/// A key-affinity service: one of the two variants, fixed at construction.
pub enum KeyAffinityService<K> {
    /// Buffered, ownership-honoring variant for distributed caches.
    Clustered(ClusteredAffinity<K>),
    /// Pass-through variant for non-distributed caches.
    Trivial(TrivialAffinity<K>),
}

impl<K: AsRef<[u8]> + Send + 'static> KeyAffinityService<K> {
    /// True for the clustered variant.
    pub fn is_clustered(&self) -> bool {
        matches!(self, KeyAffinityService::Clustered(_))
    }

    /// Start the service.
    pub async fn start(&self) {
        match self {
            KeyAffinityService::Clustered(service) => service.start().await,
            KeyAffinityService::Trivial(service) => service.start(),
        }
    }

    /// Stop the service. For the clustered variant this waits for the
    /// refill task to terminate.
    pub async fn stop(&self) {
        match self {
            KeyAffinityService::Clustered(service) => service.stop().await,
            KeyAffinityService::Trivial(service) => service.stop(),
        }
    }

    /// A key whose owner is `node` (clustered) or any generated key
    /// (trivial, best-effort).
    pub async fn key_for_node(&self, node: &Node) -> Result<K, AffinityError> {
        match self {
            KeyAffinityService::Clustered(service) => service.key_for_node(node).await,
            KeyAffinityService::Trivial(service) => service.key_for_node(node),
        }
    }

    /// A key owned by the same member as `other` (clustered) or any
    /// generated key (trivial, best-effort).
    pub async fn collocated_key(&self, other: &K) -> Result<K, AffinityError> {
        match self {
            KeyAffinityService::Clustered(service) => service.collocated_key(other).await,
            KeyAffinityService::Trivial(service) => service.collocated_key(other),
        }
    }
}

/// Creates key-affinity services bound to a (cache topology, generator)
/// pair.
pub struct KeyAffinityServiceFactory {
    config: AffinityConfig,
}

impl KeyAffinityServiceFactory {
    /// Create a factory with the given buffering configuration.
    pub fn new(config: AffinityConfig) -> DispatchResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create the service variant matching the cache's declared clustering
    /// mode. Deterministic and infallible: a distributed cache gets the
    /// clustered variant, anything else the trivial one.
    pub fn create_service<K: AsRef<[u8]> + Send + 'static>(
        &self,
        topology: Arc<dyn CacheTopology>,
        generator: Arc<dyn KeyGenerator<K>>,
    ) -> KeyAffinityService<K> {
        if topology.is_distributed() {
            KeyAffinityService::Clustered(ClusteredAffinity::new(
                topology,
                generator,
                self.config.clone(),
            ))
        } else {
            KeyAffinityService::Trivial(TrivialAffinity::new(generator))
        }
    }
}
