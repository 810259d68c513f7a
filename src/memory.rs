//! In-process cluster: transport hub plus membership view.
//!
//! `MemoryCluster` wires any number of members together inside one process.
//! Each [`MemoryMember`] handle implements both [`Group`] and
//! [`CommandTransport`] for its node, so a full dispatch stack can be
//! assembled without a network: the integration tests run whole clusters
//! this way, and embedders can use it to host several logical members in one
//! process.
//!
//! Failure injection is scriptable: [`MemoryCluster::leave`] removes a
//! member (with membership events), and [`MemoryCluster::sever`] /
//! [`MemoryCluster::heal`] partition individual links.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::constants::MEMBERSHIP_EVENT_CAPACITY;
use crate::group::{Group, MembershipEvent};
use crate::node::Node;
use crate::transport::{CommandTransport, DeliveryFailure, InboundHandler};

struct Hub {
    /// Members in join order; the first member is the coordinator.
    members: RwLock<Vec<Node>>,
    /// Inbound handlers keyed by (node, service).
    services: DashMap<(Node, String), InboundHandler>,
    /// Severed links, stored in both directions.
    severed: DashMap<(Node, Node), ()>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Hub {
    fn coordinator(members: &[Node]) -> Option<Node> {
        members.first().cloned()
    }
}

/// An in-process cluster of members sharing one transport hub.
#[derive(Clone)]
pub struct MemoryCluster {
    hub: Arc<Hub>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(MEMBERSHIP_EVENT_CAPACITY);
        Self {
            hub: Arc::new(Hub {
                members: RwLock::new(Vec::new()),
                services: DashMap::new(),
                severed: DashMap::new(),
                events,
            }),
        }
    }

    /// Add a member and return its per-node handle.
    ///
    /// Joining an already-present node returns a fresh handle without
    /// re-announcing it.
    pub fn join(&self, node: Node) -> MemoryMember {
        let mut members = self
            .hub
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !members.contains(&node) {
            let previous = Hub::coordinator(&members);
            members.push(node.clone());
            debug!(node = %node, "member joined");
            let _ = self.hub.events.send(MembershipEvent::Joined(node.clone()));
            let current = Hub::coordinator(&members);
            if previous != current {
                if let Some(coordinator) = current {
                    let _ = self
                        .hub
                        .events
                        .send(MembershipEvent::CoordinatorChanged(coordinator));
                }
            }
        }
        MemoryMember {
            node,
            hub: self.hub.clone(),
        }
    }

    /// Remove a member, drop its service registrations, and announce the
    /// departure (plus a coordinator change if it held the role).
    pub fn leave(&self, node: &Node) {
        let mut members = self
            .hub
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !members.contains(node) {
            return;
        }
        let previous = Hub::coordinator(&members);
        members.retain(|m| m != node);
        self.hub.services.retain(|(owner, _), _| owner != node);
        debug!(node = %node, "member left");
        let _ = self.hub.events.send(MembershipEvent::Left(node.clone()));
        let current = Hub::coordinator(&members);
        if previous != current {
            if let Some(coordinator) = current {
                let _ = self
                    .hub
                    .events
                    .send(MembershipEvent::CoordinatorChanged(coordinator));
            }
        }
    }

    /// Partition the link between two members in both directions.
    pub fn sever(&self, a: &Node, b: &Node) {
        self.hub.severed.insert((a.clone(), b.clone()), ());
        self.hub.severed.insert((b.clone(), a.clone()), ());
    }

    /// Restore a previously severed link.
    pub fn heal(&self, a: &Node, b: &Node) {
        self.hub.severed.remove(&(a.clone(), b.clone()));
        self.hub.severed.remove(&(b.clone(), a.clone()));
    }

    /// Current members in join order.
    pub fn members(&self) -> Vec<Node> {
        self.hub
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One member's handle onto a [`MemoryCluster`]: its group view and its
/// transport endpoint.
#[derive(Clone)]
pub struct MemoryMember {
    node: Node,
    hub: Arc<Hub>,
}

impl MemoryMember {
    /// This member's identity.
    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Group for MemoryMember {
    fn local_node(&self) -> Node {
        self.node.clone()
    }

    fn coordinator_node(&self) -> Node {
        let members = self
            .hub
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Hub::coordinator(&members).unwrap_or_else(|| self.node.clone())
    }

    fn nodes(&self) -> Vec<Node> {
        self.hub
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.hub.events.subscribe()
    }
}

#[async_trait]
impl CommandTransport for MemoryMember {
    async fn unicast(
        &self,
        service: &str,
        target: &Node,
        payload: Bytes,
    ) -> Result<Bytes, DeliveryFailure> {
        let is_member = self
            .hub
            .members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(target);
        if !is_member {
            return Err(DeliveryFailure::Unreachable {
                node: target.clone(),
            });
        }
        if self
            .hub
            .severed
            .contains_key(&(self.node.clone(), target.clone()))
        {
            return Err(DeliveryFailure::Unreachable {
                node: target.clone(),
            });
        }
        let handler = self
            .hub
            .services
            .get(&(target.clone(), service.to_string()))
            .map(|entry| entry.value().clone());
        match handler {
            Some(handler) => {
                let reply = handler(payload).await;
                // A reply cannot come back from a node that is gone or cut
                // off by the time the handler finished.
                let still_member = self
                    .hub
                    .members
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(target);
                let cut_off = self
                    .hub
                    .severed
                    .contains_key(&(self.node.clone(), target.clone()));
                if !still_member || cut_off {
                    return Err(DeliveryFailure::Unreachable {
                        node: target.clone(),
                    });
                }
                Ok(reply)
            }
            None => Err(DeliveryFailure::NoSuchService {
                service: service.to_string(),
                node: target.clone(),
            }),
        }
    }

    fn register(&self, service: &str, handler: InboundHandler) {
        self.hub
            .services
            .insert((self.node.clone(), service.to_string()), handler);
    }

    fn unregister(&self, service: &str) {
        self.hub
            .services
            .remove(&(self.node.clone(), service.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Node {
        Node::new(name, "127.0.0.1", 7600)
    }

    #[tokio::test]
    async fn test_join_order_defines_coordinator() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(node("a"));
        let b = cluster.join(node("b"));

        assert!(a.is_coordinator());
        assert!(!b.is_coordinator());
        assert_eq!(b.coordinator_node(), node("a"));
        assert_eq!(cluster.members(), vec![node("a"), node("b")]);
    }

    #[tokio::test]
    async fn test_leave_moves_coordinator_and_emits_events() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(node("a"));
        let mut events = a.subscribe();
        let b = cluster.join(node("b"));

        cluster.leave(&node("a"));

        assert!(b.is_coordinator());
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Joined(node("b")));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Left(node("a")));
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::CoordinatorChanged(node("b"))
        );
    }

    #[tokio::test]
    async fn test_unicast_round_trip() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(node("a"));
        let b = cluster.join(node("b"));

        b.register(
            "echo",
            Arc::new(|payload: Bytes| -> crate::transport::HandlerFuture {
                Box::pin(async move { payload })
            }),
        );

        let reply = a
            .unicast("echo", &node("b"), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_unicast_to_unknown_node_is_unreachable() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(node("a"));

        let err = a
            .unicast("echo", &node("ghost"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryFailure::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_unicast_without_handler_is_no_such_service() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(node("a"));
        cluster.join(node("b"));

        let err = a.unicast("echo", &node("b"), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryFailure::NoSuchService { .. }));
    }

    #[tokio::test]
    async fn test_severed_link_blocks_delivery_until_healed() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(node("a"));
        let b = cluster.join(node("b"));
        b.register(
            "echo",
            Arc::new(|payload: Bytes| -> crate::transport::HandlerFuture {
                Box::pin(async move { payload })
            }),
        );

        cluster.sever(&node("a"), &node("b"));
        let err = a.unicast("echo", &node("b"), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryFailure::Unreachable { .. }));

        cluster.heal(&node("a"), &node("b"));
        assert!(a.unicast("echo", &node("b"), Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_leave_drops_service_registrations() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(node("a"));
        let b = cluster.join(node("b"));
        b.register(
            "echo",
            Arc::new(|payload: Bytes| -> crate::transport::HandlerFuture {
                Box::pin(async move { payload })
            }),
        );

        cluster.leave(&node("b"));
        cluster.join(node("b"));

        let err = a.unicast("echo", &node("b"), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryFailure::NoSuchService { .. }));
    }
}
