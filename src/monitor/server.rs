//! Monitor loop

use crate::common::{Clock, Config, Error, Result, SystemClock};
use crate::monitor::actions::{ActionCompletion, ActionDispatcher, ActionRunner};
use crate::monitor::aggregate::aggregate_all;
use crate::monitor::config_sync::{
    serve_object_config, stale_configs, sync_configs, ObjectConfigRequest, ObjectConfigResponse,
    PeerClient,
};
use crate::monitor::descriptor::ServiceRegistry;
use crate::monitor::gossip::{GossipCodec, GossipMessage, Ingested};
use crate::monitor::intent::merge_peer_intents;
use crate::monitor::model::NodeStatus;
use crate::monitor::orchestrator::Orchestrator;
use crate::monitor::placement::PlacementEngine;
use crate::monitor::store::StateStore;
use crate::monitor::tasks::TaskPool;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_SYNC_TASK: &str = "config-sync";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Monitor {
    config: Config,
    store: Arc<StateStore>,
    registry: Arc<ServiceRegistry>,
    codec: GossipCodec,
    dispatcher: Arc<ActionDispatcher>,
    orchestrator: Orchestrator,
    pool: Arc<TaskPool>,
    peer_client: Arc<dyn PeerClient>,
    status_collected: AtomicBool,
}

impl Monitor {
    pub fn new(
        config: Config,
        registry: Arc<ServiceRegistry>,
        runner: Arc<dyn ActionRunner>,
        peer_client: Arc<dyn PeerClient>,
    ) -> Result<Self> {
        Self::with_clock(config, registry, runner, peer_client, Arc::new(SystemClock))
    }

    pub fn with_clock(
        mut config: Config,
        registry: Arc<ServiceRegistry>,
        runner: Arc<dyn ActionRunner>,
        peer_client: Arc<dyn PeerClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let nodename = config.node.nodename.clone();
        let store = Arc::new(StateStore::with_clock(nodename.clone(), clock.clone()));
        store.set_last_shutdown(read_last_shutdown(&config));
        let boot = next_boot(&config)?;
        store.set_boot(boot);

        let dispatcher = Arc::new(ActionDispatcher::new(
            runner,
            clock,
            config.monitor.action_timeout(),
            config.paths.var_dir.clone(),
        ));
        let pool = Arc::new(TaskPool::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            pool.clone(),
            PlacementEngine::from_config(&config.node),
            config.monitor.clone(),
            config.node.cluster_nodes.clone(),
        );

        Ok(Self {
            codec: GossipCodec::new(nodename),
            config,
            store,
            registry,
            dispatcher,
            orchestrator,
            pool,
            peer_client,
            status_collected: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting monitor: {} (boot {})", self.store.nodename(), self.store.boot());
        info!("  Cluster nodes: {}", self.config.node.cluster_nodes.join(","));
        info!("  Services: {}", self.registry.paths().len());
        info!("  Var dir: {}", self.config.paths.var_dir.display());

        tokio::pin!(shutdown);
        let poll = self.config.monitor.poll_interval();
        loop {
            if let Err(e) = self.tick().await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("monitor pass: {}", e);
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.store.wait_changed(poll) => {}
            }
        }
        self.shutdown().await
    }

    /// One monitor pass.
    pub async fn tick(&self) -> Result<()> {
        for completion in self.dispatcher.reap(&self.store) {
            self.on_action_done(&completion);
        }

        self.collect_local_status().await;
        self.store.set_local_config(self.registry.config_refs());

        let view = self.store.cluster_view();
        self.store.replace_aggs(aggregate_all(&self.registry, &view));
        let adopted = merge_peer_intents(&self.store, &view);
        if !adopted.is_empty() {
            debug!("adopted peer intents on {}", adopted.join(","));
        }

        let view = self.store.cluster_view();
        self.orchestrator.orchestrate(&view);
        self.spawn_config_sync();

        self.codec.publish(&self.store)?;
        self.pool.reap();
        Ok(())
    }

    fn on_action_done(&self, completion: &ActionCompletion) {
        if completion.succeeded() && completion.verb == "delete" {
            self.registry.remove(&completion.path);
            info!(path = %completion.path, "service deleted on this node");
        }
    }

    /// Refresh local instances from their status caches.
    async fn collect_local_status(&self) {
        let local = self.store.nodename().to_string();
        for desc in self.registry.all() {
            if !desc.nodes.contains(&local) || self.dispatcher.is_busy(&desc.path) {
                continue;
            }
            if let Err(e) = self
                .dispatcher
                .load_or_refresh_status(&self.store, &desc.path)
                .await
            {
                debug!(path = %desc.path, "status: {}", e);
            }
        }
        if !self.status_collected.swap(true, Ordering::SeqCst) {
            self.orchestrator.on_local_status_collected();
        }
    }

    fn spawn_config_sync(&self) {
        if self.pool.is_running(CONFIG_SYNC_TASK) {
            return;
        }
        let stale = stale_configs(&self.registry, &self.store.cluster_view());
        if stale.is_empty() {
            return;
        }
        let client = self.peer_client.clone();
        let registry = self.registry.clone();
        let store = self.store.clone();
        self.pool.spawn(CONFIG_SYNC_TASK, async move {
            sync_configs(client.as_ref(), &registry, &store, stale).await;
            Ok(())
        });
    }

    // === Gossip surface ===

    pub fn ingest_gossip(&self, message: GossipMessage) -> Result<Ingested> {
        self.codec.ingest(&self.store, message)
    }

    /// Messages queued for every peer since the last call.
    pub fn outbox(&self) -> Vec<GossipMessage> {
        self.codec.take_outbox()
    }

    pub fn full_snapshot(&self) -> Option<Arc<GossipMessage>> {
        self.codec.full_snapshot()
    }

    /// Peers to ask for a full snapshot.
    pub fn resync_requests(&self) -> Vec<String> {
        self.codec.take_resync_requests()
    }

    /// A peer left the cluster view.
    pub fn peer_lost(&self, node: &str) {
        let Some(last) = self.store.purge_peer(node) else {
            return;
        };
        warn!(node = %node, "peer lost");
        let view = self.store.cluster_view();
        self.orchestrator.on_peer_lost(node, &last, &view);
    }

    pub fn answer_object_config(&self, request: &ObjectConfigRequest) -> ObjectConfigResponse {
        serve_object_config(&self.registry, request)
    }

    async fn shutdown(&self) -> Result<()> {
        info!("monitor shutting down, {} background tasks", self.pool.len());
        self.store.set_nmon_status(NodeStatus::Shutting);
        self.dispatcher.kill_all();
        self.pool.shutdown(SHUTDOWN_GRACE).await;
        self.codec.publish(&self.store)?;
        write_last_shutdown(&self.config, self.store.now())
    }
}

fn boot_path(config: &Config) -> PathBuf {
    config.paths.var_dir.join("boot")
}

/// Bump and persist the boot counter. Written at startup so a crash still
/// counts as a restart for the peers.
fn next_boot(config: &Config) -> Result<u64> {
    let path = boot_path(config);
    let previous: u64 = std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let boot = previous + 1;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, boot.to_string())?;
    Ok(boot)
}

fn last_shutdown_path(config: &Config) -> PathBuf {
    config.paths.var_dir.join("last_shutdown")
}

fn read_last_shutdown(config: &Config) -> f64 {
    std::fs::read_to_string(last_shutdown_path(config))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0.0)
}

fn write_last_shutdown(config: &Config, now: f64) -> Result<()> {
    let path = last_shutdown_path(config);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, format!("{}", now)).map_err(Error::from)
}
