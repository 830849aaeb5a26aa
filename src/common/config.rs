//! Configuration for the cluster monitor

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clustermon/config.toml";

/// Environment variable overriding the configuration file location
pub const CONFIG_PATH_ENV: &str = "CLUSTERMON_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Local node identity and cluster membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local node name. Empty means "not configured", which is fatal.
    #[serde(default)]
    pub nodename: String,

    /// Every node of the cluster, local node included, in declared order
    #[serde(default)]
    pub cluster_nodes: Vec<String>,

    /// Below this free memory percentage a node is overloaded
    #[serde(default = "default_min_avail_pct")]
    pub min_avail_mem_pct: f64,

    /// Below this free swap percentage a node is overloaded
    #[serde(default = "default_min_avail_pct")]
    pub min_avail_swap_pct: f64,
}

fn default_min_avail_pct() -> f64 {
    2.0
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nodename: String::new(),
            cluster_nodes: Vec::new(),
            min_avail_mem_pct: default_min_avail_pct(),
            min_avail_swap_pct: default_min_avail_pct(),
        }
    }
}

/// Orchestration loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Idle poll period of the monitor loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Startup window during which automatic actions are suppressed
    #[serde(default = "default_rejoin_grace_period")]
    pub rejoin_grace_period_secs: u64,

    /// Debounce between `ready` and the start action
    #[serde(default = "default_ready_period")]
    pub ready_period_secs: u64,

    /// Max concurrent scaler slave creations
    #[serde(default = "default_max_scaling_burst")]
    pub max_scaling_burst: usize,

    #[serde(default = "default_consensus_retries")]
    pub config_consensus_retries: u32,

    #[serde(default = "default_consensus_interval")]
    pub config_consensus_interval_ms: u64,

    /// Bounded wait for a global_expect to be satisfied and cleared
    #[serde(default = "default_expect_wait_timeout")]
    pub expect_wait_timeout_secs: u64,

    #[serde(default = "default_stonith_timeout")]
    pub stonith_timeout_secs: u64,

    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    500
}
fn default_rejoin_grace_period() -> u64 {
    90
}
fn default_ready_period() -> u64 {
    5
}
fn default_max_scaling_burst() -> usize {
    3
}
fn default_consensus_retries() -> u32 {
    30
}
fn default_consensus_interval() -> u64 {
    1000
}
fn default_expect_wait_timeout() -> u64 {
    120
}
fn default_stonith_timeout() -> u64 {
    10
}
fn default_action_timeout() -> u64 {
    600
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            rejoin_grace_period_secs: default_rejoin_grace_period(),
            ready_period_secs: default_ready_period(),
            max_scaling_burst: default_max_scaling_burst(),
            config_consensus_retries: default_consensus_retries(),
            config_consensus_interval_ms: default_consensus_interval(),
            expect_wait_timeout_secs: default_expect_wait_timeout(),
            stonith_timeout_secs: default_stonith_timeout(),
            action_timeout_secs: default_action_timeout(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rejoin_grace_period(&self) -> Duration {
        Duration::from_secs(self.rejoin_grace_period_secs)
    }

    pub fn ready_period(&self) -> Duration {
        Duration::from_secs(self.ready_period_secs)
    }

    pub fn config_consensus_interval(&self) -> Duration {
        Duration::from_millis(self.config_consensus_interval_ms)
    }

    pub fn expect_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.expect_wait_timeout_secs)
    }

    pub fn stonith_timeout(&self) -> Duration {
        Duration::from_secs(self.stonith_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// Filesystem locations and external commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the per-service status cache files
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,

    /// Directory holding one service descriptor (`*.json`) per service
    #[serde(default = "default_services_dir")]
    pub services_dir: PathBuf,

    /// Executable invoked as `<action_command> <path> <verb> [args...]`
    #[serde(default = "default_action_command")]
    pub action_command: String,

    /// Executable invoked as `<stonith_command> <nodename>`
    #[serde(default)]
    pub stonith_command: Option<String>,
}

fn default_var_dir() -> PathBuf {
    PathBuf::from("/var/lib/clustermon")
}
fn default_services_dir() -> PathBuf {
    PathBuf::from("/etc/clustermon/services")
}
fn default_action_command() -> String {
    "svcmgr".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            var_dir: default_var_dir(),
            services_dir: default_services_dir(),
            action_command: default_action_command(),
            stonith_command: None,
        }
    }
}

impl Config {
    /// Load the configuration file (if any), then apply `CLUSTERMON__*`
    /// environment overrides, e.g. `CLUSTERMON__NODE__NODENAME=n1`.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CLUSTERMON")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("node.cluster_nodes")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Check the settings the monitor cannot run without.
    pub fn validate(&mut self) -> Result<()> {
        if self.node.nodename.trim().is_empty() {
            return Err(Error::NodeIdentity("node.nodename is not set".into()));
        }
        if !self.node.cluster_nodes.contains(&self.node.nodename) {
            self.node.cluster_nodes.push(self.node.nodename.clone());
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("monitor.poll_interval_ms must be > 0".into()));
        }
        if self.monitor.max_scaling_burst == 0 {
            return Err(Error::InvalidConfig("monitor.max_scaling_burst must be > 0".into()));
        }
        Ok(())
    }
}
