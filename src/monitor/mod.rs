//! Cluster monitor: state replication, aggregation, placement and the
//! orchestration loop.

pub mod actions;
pub mod aggregate;
pub mod config_sync;
pub mod descriptor;
pub mod gossip;
pub mod intent;
pub mod model;
pub mod orchestrator;
pub mod placement;
pub mod scaler;
pub mod server;
pub mod store;
pub mod tasks;

pub use actions::{ActionDispatcher, ActionRunner, CommandRunner};
pub use config_sync::{DisabledPeerClient, PeerClient};
pub use descriptor::{ServiceDescriptor, ServiceRegistry};
pub use gossip::{GossipCodec, GossipMessage};
pub use orchestrator::Orchestrator;
pub use placement::PlacementEngine;
pub use server::Monitor;
pub use store::StateStore;
