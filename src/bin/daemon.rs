//! Cluster monitor daemon

use clap::Parser;
use clustermon::common::{parse_duration, Config};
use clustermon::monitor::{CommandRunner, DisabledPeerClient, ServiceRegistry};
use clustermon::Monitor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "clustermon-daemon")]
#[command(about = "Cluster monitor: replicates node state and orchestrates services")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to $CLUSTERMON_CONFIG or /etc/clustermon/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Local node name
    #[arg(long)]
    nodename: Option<String>,

    /// Cluster nodes (comma-separated, in declared order)
    #[arg(long, value_delimiter = ',')]
    cluster_nodes: Vec<String>,

    /// Directory of service descriptors
    #[arg(long)]
    services_dir: Option<PathBuf>,

    /// Status cache root
    #[arg(long)]
    var_dir: Option<PathBuf>,

    /// Executable running service actions
    #[arg(long)]
    action_command: Option<String>,

    /// Executable fencing a node
    #[arg(long)]
    stonith_command: Option<String>,

    /// Idle poll period of the monitor loop (e.g. 500ms)
    #[arg(long, value_parser = duration_arg)]
    poll_interval: Option<Duration>,

    /// Rejoin grace period (e.g. 90s)
    #[arg(long, value_parser = duration_arg)]
    rejoin_grace_period: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

impl Args {
    /// CLI flags take priority over the file and environment.
    fn apply(self, config: &mut Config) {
        if let Some(nodename) = self.nodename {
            config.node.nodename = nodename;
        }
        if !self.cluster_nodes.is_empty() {
            config.node.cluster_nodes = self.cluster_nodes;
        }
        if let Some(dir) = self.services_dir {
            config.paths.services_dir = dir;
        }
        if let Some(dir) = self.var_dir {
            config.paths.var_dir = dir;
        }
        if let Some(cmd) = self.action_command {
            config.paths.action_command = cmd;
        }
        if self.stonith_command.is_some() {
            config.paths.stonith_command = self.stonith_command;
        }
        if let Some(d) = self.poll_interval {
            config.monitor.poll_interval_ms = d.as_millis() as u64;
        }
        if let Some(d) = self.rejoin_grace_period {
            config.monitor.rejoin_grace_period_secs = d.as_secs();
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load config from file and environment, then override with CLI arguments
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    args.apply(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = config.validate() {
        tracing::error!("cannot start: {}", e);
        return Err(e.into());
    }

    let registry = Arc::new(ServiceRegistry::new());
    let loaded = registry.load_dir(&config.paths.services_dir)?;
    tracing::info!(
        "loaded {} service descriptors from {}",
        loaded,
        config.paths.services_dir.display()
    );

    let runner = Arc::new(CommandRunner::new(
        config.paths.action_command.clone(),
        config.paths.stonith_command.clone(),
    ));
    let monitor = Monitor::new(config, registry, runner, Arc::new(DisabledPeerClient))?;

    monitor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("signal handler: {}", e);
            }
        })
        .await?;

    tracing::info!("monitor stopped");
    Ok(())
}
