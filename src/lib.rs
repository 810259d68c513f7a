//! # Clustercast
//! Cluster command dispatch, broadcast discovery, and key-affinity services.
//!
//! This crate coordinates work across the members of a dynamic cluster: any
//! node can invoke a typed unit of work on one specific peer or on the whole
//! group, discover peer identity and coordinator status as membership
//! changes, broadcast discovery payloads over the same dispatch layer, and
//! generate cache keys biased toward a chosen node for data locality.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────┐      ┌─────────────────────┐
//!   │ BroadcastEndpoint│      │ KeyAffinityService  │
//!   │   (discovery)    │      │   (key locality)    │
//!   └────────┬─────────┘      └──────────┬──────────┘
//!            │                           │
//!            ▼                           ▼
//!   ┌──────────────────┐      ┌─────────────────────┐
//!   │CommandDispatcher │      │   CacheTopology     │ ← cache integration
//!   │    (fan-out)     │      └─────────────────────┘
//!   └────────┬─────────┘
//!            │
//!   ┌────────┴─────────┐
//!   ▼                  ▼
//! ┌──────────┐  ┌──────────────────┐
//! │  Group   │  │ CommandTransport │ ← membership / wire providers
//! └──────────┘  └──────────────────┘
//! ```
//!
//! Membership ([`Group`]) and the wire ([`CommandTransport`]) are external
//! collaborators; the [`memory`] module provides an in-process pair for
//! single-process clusters and tests.
//!
//! # Dispatching commands
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use clustercast::{
//!     ClusterRoute, Command, CommandDispatcherFactory, CommandError, FactoryConfig,
//!     LocalDelivery, MemoryCluster, Node,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Ping;
//!
//! #[async_trait]
//! impl Command for Ping {
//!     type Context = String;
//!     type Output = String;
//!
//!     async fn execute(&self, local_name: &String) -> Result<String, CommandError> {
//!         Ok(local_name.clone())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = MemoryCluster::new();
//!     let member = cluster.join(Node::new("a", "127.0.0.1", 7600));
//!     let factory = CommandDispatcherFactory::new(
//!         Arc::new(member.clone()),
//!         Arc::new(member),
//!         FactoryConfig::default(),
//!     )?;
//!
//!     let dispatcher = factory.create_dispatcher::<Ping>("ping", "a".to_string())?;
//!     let responses = dispatcher
//!         .execute_on_cluster(&Ping, &ClusterRoute::new(LocalDelivery::Execute))
//!         .await?;
//!     for (node, response) in &responses {
//!         println!("{node}: {:?}", response.get());
//!     }
//!     dispatcher.close().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod affinity;
pub mod broadcast;
pub mod command;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod group;
pub mod memory;
pub mod node;
pub mod tasks;
pub mod telemetry;
pub mod transport;

pub use affinity::{
    AffinityError, CacheTopology, ClusteredAffinity, HashRingTopology, KeyAffinityService,
    KeyAffinityServiceFactory, KeyGenerationError, KeyGenerator, TopologyChange, TrivialAffinity,
};
pub use broadcast::{BroadcastEndpoint, BroadcastManager, BroadcastMode, BroadcastRegistry};
pub use command::{
    ClusterSubmission, Command, CommandError, CommandResponse, SubmittedCommand,
};
pub use config::{AffinityConfig, DuplicateBindingPolicy, FactoryConfig};
pub use dispatcher::{ClusterRoute, CommandDispatcher, LocalDelivery};
pub use error::{DispatchError, DispatchResult};
pub use factory::CommandDispatcherFactory;
pub use group::{Group, GroupListener, MembershipEvent};
pub use memory::{MemoryCluster, MemoryMember};
pub use node::Node;
pub use transport::{CommandTransport, DeliveryFailure, HandlerFuture, InboundHandler};
