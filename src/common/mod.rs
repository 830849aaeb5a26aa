//! Common utilities and types shared across clustermon

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{Config, MonitorConfig, NodeConfig, PathsConfig};
pub use error::{Error, Result};
pub use hash::{blake3_hash, hrw_hash, hrw_weight};
pub use utils::{
    format_timestamp, newer_wins, parse_duration, retry_with_backoff, timestamp_now, Clock,
    ManualClock, SystemClock,
};
