//! # clustermon
//!
//! The monitor of a cluster orchestration daemon. Every node runs one and
//! they converge on where each service runs:
//! - Gossip of per-node snapshots as generation-numbered patches
//! - Cluster-wide status aggregation per service
//! - Deterministic placement ranking, identical on every node
//! - Declared intents (`global_expect`) reconciled by a per-node policy loop
//! - External actions (start, stop, provision...) dispatched as subprocesses
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!  peers ──gossip──► StateStore ◄── status caches
//!                        │
//!              aggregate │ merge intents
//!                        ▼
//!               Orchestrator (node, auto, manual, scaler)
//!                        │
//!                        ▼
//!               ActionDispatcher ──► <action_command> <path> <verb>
//! ```
//!
//! ## Usage
//!
//! ```bash
//! clustermon-daemon --nodename n1 --cluster-nodes n1,n2,n3 \
//!   --services-dir /etc/clustermon/services
//! ```

pub mod common;
pub mod monitor;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use monitor::Monitor;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
