//! Multi-node scenarios: several monitors in one process, gossip delivered
//! by hand, actions simulated by writing the status cache files.

use clustermon::common::{Clock, Config, ManualClock};
use clustermon::monitor::actions::{status_cache_path, ActionRunner, RunningAction};
use clustermon::monitor::model::{
    GlobalExpect, MonitorStatus, NodeStatus, ResourceStatus, ServiceInstance, Status, Topology,
};
use clustermon::monitor::store::{ExpectChange, SmonUpdate};
use clustermon::monitor::{DisabledPeerClient, ServiceDescriptor, ServiceRegistry};
use clustermon::Monitor;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Done;

impl RunningAction for Done {
    fn try_wait(&mut self) -> clustermon::Result<Option<i32>> {
        Ok(Some(0))
    }

    fn kill(&mut self) {}
}

/// Plays the external action layer of one node: every action succeeds at
/// once and rewrites the service status cache.
struct FakeActions {
    node: String,
    var_dir: PathBuf,
    clock: ManualClock,
    services: Mutex<BTreeMap<String, ServiceInstance>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeActions {
    fn initial() -> ServiceInstance {
        ServiceInstance {
            avail: Status::Down,
            overall: Status::Down,
            resources: [(
                "fs#1".to_string(),
                ResourceStatus {
                    status: Status::Down,
                    provisioned: Some(true),
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        }
    }

    fn write(&self, path: &str, instance: &ServiceInstance) -> clustermon::Result<()> {
        let file = status_cache_path(&self.var_dir, path);
        std::fs::create_dir_all(file.parent().unwrap())?;
        std::fs::write(&file, serde_json::to_vec(instance)?)?;
        Ok(())
    }
}

impl ActionRunner for FakeActions {
    fn spawn(&self, path: &str, argv: &[String]) -> clustermon::Result<Box<dyn RunningAction>> {
        let verb = argv[0].as_str();
        if verb != "status" {
            self.log.lock().push(format!("{} {} {}", self.node, path, verb));
        }
        let mut services = self.services.lock();
        if verb == "delete" {
            services.remove(path);
            let _ = std::fs::remove_file(status_cache_path(&self.var_dir, path));
            return Ok(Box::new(Done));
        }
        let instance = services
            .entry(path.to_string())
            .or_insert_with(Self::initial);
        match verb {
            "start" => {
                instance.avail = Status::Up;
                instance.overall = Status::Up;
            }
            "stop" | "shutdown" | "toc" => {
                instance.avail = Status::Down;
                instance.overall = Status::Down;
            }
            "freeze" => instance.frozen = self.clock.now(),
            "thaw" => instance.frozen = 0.0,
            "provision" | "unprovision" => {
                for resource in instance.resources.values_mut() {
                    resource.provisioned = Some(verb == "provision");
                }
            }
            _ => {}
        }
        let snapshot = instance.clone();
        drop(services);
        self.write(path, &snapshot)?;
        Ok(Box::new(Done))
    }

    fn spawn_stonith(&self, node: &str) -> clustermon::Result<Box<dyn RunningAction>> {
        self.log.lock().push(format!("{} stonith {}", self.node, node));
        Ok(Box::new(Done))
    }
}

struct Node {
    name: String,
    monitor: Monitor,
    _dir: TempDir,
}

struct Cluster {
    clock: ManualClock,
    nodes: Vec<Node>,
    down: BTreeSet<String>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Cluster {
    fn new(names: &[&str], services: &[ServiceDescriptor]) -> Self {
        let clock = ManualClock::new(1000.0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let nodes = names
            .iter()
            .map(|name| {
                let dir = TempDir::new().unwrap();
                let mut config = Config::default();
                config.node.nodename = name.to_string();
                config.node.cluster_nodes = names.iter().map(|s| s.to_string()).collect();
                config.paths.var_dir = dir.path().to_path_buf();

                let registry = Arc::new(ServiceRegistry::new());
                for desc in services {
                    registry.insert(desc.clone(), 1.0).unwrap();
                }
                let runner = Arc::new(FakeActions {
                    node: name.to_string(),
                    var_dir: dir.path().to_path_buf(),
                    clock: clock.clone(),
                    services: Mutex::new(BTreeMap::new()),
                    log: log.clone(),
                });
                let monitor = Monitor::with_clock(
                    config,
                    registry,
                    runner,
                    Arc::new(DisabledPeerClient),
                    Arc::new(clock.clone()),
                )
                .unwrap();
                Node {
                    name: name.to_string(),
                    monitor,
                    _dir: dir,
                }
            })
            .collect();
        Self {
            clock,
            nodes,
            down: BTreeSet::new(),
            log,
        }
    }

    fn node(&self, name: &str) -> &Monitor {
        &self.nodes.iter().find(|n| n.name == name).unwrap().monitor
    }

    fn alive(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !self.down.contains(&n.name))
    }

    /// One pass on every live node, then deliver gossip between them.
    async fn tick(&self) {
        for node in self.alive() {
            node.monitor.tick().await.unwrap();
        }
        let messages: Vec<_> = self
            .alive()
            .map(|n| (n.name.clone(), n.monitor.outbox()))
            .collect();
        for (from, batch) in &messages {
            for to in self.alive().filter(|n| n.name != *from) {
                for message in batch {
                    to.monitor.ingest_gossip(message.clone()).unwrap();
                }
            }
        }
        for to in self.alive() {
            for peer in to.monitor.resync_requests() {
                if let Some(full) = self.node(&peer).full_snapshot() {
                    to.monitor.ingest_gossip((*full).clone()).unwrap();
                }
            }
        }
    }

    /// Take `name` out of the cluster: survivors purge its data.
    fn kill(&mut self, name: &str) {
        self.down.insert(name.to_string());
        for node in self.alive() {
            node.monitor.peer_lost(name);
        }
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

fn failover(path: &str, nodes: &[&str]) -> ServiceDescriptor {
    ServiceDescriptor::new(
        path,
        Topology::Failover,
        nodes.iter().map(|s| s.to_string()).collect(),
    )
}

fn avail(monitor: &Monitor, path: &str) -> Option<Status> {
    monitor.store().local_instance(path).map(|i| i.avail)
}

#[tokio::test]
async fn test_failover_start_and_takeover() {
    let mut cluster = Cluster::new(&["n1", "n2"], &[failover("ns/svc/web", &["n1", "n2"])]);

    cluster.tick().await;
    assert_eq!(cluster.node("n1").store().nmon().status, NodeStatus::Rejoin);

    // both peers seen: grace period over, the first declared node gets ready
    cluster.tick().await;
    assert_eq!(cluster.node("n1").store().nmon().status, NodeStatus::Idle);
    assert_eq!(
        cluster.node("n1").store().smon("ns/svc/web").status,
        MonitorStatus::Ready
    );
    assert_eq!(
        cluster.node("n2").store().smon("ns/svc/web").status,
        MonitorStatus::Idle
    );

    cluster.clock.advance(Duration::from_secs(6));
    cluster.tick().await;
    cluster.tick().await;
    assert_eq!(avail(cluster.node("n1"), "ns/svc/web"), Some(Status::Up));
    assert_eq!(avail(cluster.node("n2"), "ns/svc/web"), Some(Status::Down));
    assert_eq!(cluster.calls(), vec!["n1 ns/svc/web start"]);

    cluster.tick().await;
    assert_eq!(cluster.node("n2").store().agg("ns/svc/web").avail, Status::Up);

    cluster.kill("n1");
    cluster.tick().await;
    assert_eq!(
        cluster.node("n2").store().smon("ns/svc/web").status,
        MonitorStatus::Ready
    );
    cluster.clock.advance(Duration::from_secs(6));
    cluster.tick().await;
    cluster.tick().await;
    assert_eq!(avail(cluster.node("n2"), "ns/svc/web"), Some(Status::Up));
    assert_eq!(
        cluster.calls(),
        vec!["n1 ns/svc/web start", "n2 ns/svc/web start"]
    );
}

#[tokio::test]
async fn test_purge_tears_down_leader_last() {
    let cluster = Cluster::new(&["n1", "n2"], &[failover("ns/svc/db", &["n1", "n2"])]);
    cluster.tick().await;
    cluster.tick().await;

    let n1 = cluster.node("n1");
    n1.store().set_smon(
        "ns/svc/db",
        SmonUpdate::new().with_global_expect(ExpectChange::Set(GlobalExpect::Purged)),
    );

    for _ in 0..12 {
        cluster.tick().await;
    }

    for name in ["n1", "n2"] {
        let monitor = cluster.node(name);
        assert!(monitor.store().local_instance("ns/svc/db").is_none(), "{}", name);
        assert!(!monitor.registry().contains("ns/svc/db"), "{}", name);
    }
    assert_eq!(
        cluster.calls(),
        vec![
            "n2 ns/svc/db unprovision",
            "n2 ns/svc/db delete",
            "n1 ns/svc/db unprovision",
            "n1 ns/svc/db delete",
        ]
    );
}

#[tokio::test]
async fn test_frozen_node_does_not_start() {
    let cluster = Cluster::new(&["n1"], &[failover("ns/svc/web", &["n1"])]);
    cluster.node("n1").store().freeze_node();
    cluster.tick().await;
    cluster.clock.advance(Duration::from_secs(6));
    cluster.tick().await;
    cluster.tick().await;
    assert!(cluster.calls().is_empty());
    assert_eq!(avail(cluster.node("n1"), "ns/svc/web"), Some(Status::Down));
}
