//! Snapshot replication between two monitors, with lost messages.

use clustermon::common::{Config, ManualClock};
use clustermon::monitor::gossip::{GossipMessage, Ingested};
use clustermon::monitor::model::MonitorStatus;
use clustermon::monitor::store::SmonUpdate;
use clustermon::monitor::{CommandRunner, DisabledPeerClient, ServiceRegistry};
use clustermon::Monitor;
use std::sync::Arc;
use tempfile::TempDir;

fn monitor(name: &str, dir: &TempDir) -> Monitor {
    let mut config = Config::default();
    config.node.nodename = name.to_string();
    config.node.cluster_nodes = vec!["n1".into(), "n2".into()];
    config.paths.var_dir = dir.path().to_path_buf();
    Monitor::with_clock(
        config,
        Arc::new(ServiceRegistry::new()),
        Arc::new(CommandRunner::new("/bin/false", None)),
        Arc::new(DisabledPeerClient),
        Arc::new(ManualClock::new(1000.0)),
    )
    .unwrap()
}

fn deliver(to: &Monitor, messages: Vec<GossipMessage>) -> Vec<Ingested> {
    messages
        .into_iter()
        .map(|m| to.ingest_gossip(m).unwrap())
        .collect()
}

#[tokio::test]
async fn test_lost_patch_triggers_resync() {
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let n1 = monitor("n1", &dir1);
    let n2 = monitor("n2", &dir2);

    n1.tick().await.unwrap();
    assert_eq!(deliver(&n2, n1.outbox()), vec![Ingested::Replaced]);
    assert_eq!(n2.store().peer("n1").unwrap().generation, 1);

    // generation 2 never reaches n2
    n1.store().freeze_node();
    n1.tick().await.unwrap();
    let lost = n1.outbox();
    assert_eq!(lost.len(), 1);

    n1.store().thaw_node();
    n1.tick().await.unwrap();
    assert_eq!(deliver(&n2, n1.outbox()), vec![Ingested::Discarded]);
    assert_eq!(n2.resync_requests(), vec!["n1".to_string()]);
    assert!(n2.resync_requests().is_empty());

    let full = n1.full_snapshot().unwrap();
    assert_eq!(full.generation(), 3);
    assert_eq!(
        n2.ingest_gossip((*full).clone()).unwrap(),
        Ingested::Replaced
    );
    let replica = n2.store().peer("n1").unwrap();
    assert_eq!(replica.generation, 3);
    assert_eq!(replica.frozen, 0.0);

    // stale patch arriving late is dropped
    assert_eq!(deliver(&n2, lost), vec![Ingested::Discarded]);
}

#[tokio::test]
async fn test_smon_changes_reach_peer() {
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let n1 = monitor("n1", &dir1);
    let n2 = monitor("n2", &dir2);
    n1.tick().await.unwrap();
    deliver(&n2, n1.outbox());

    n1.store().put_local_instance("ns/svc/web", Default::default());
    n1.store()
        .set_smon("ns/svc/web", SmonUpdate::status(MonitorStatus::Ready));
    n1.tick().await.unwrap();
    assert_eq!(deliver(&n2, n1.outbox()), vec![Ingested::Applied]);

    let view = n2.store().cluster_view();
    let instance = view.instance("n1", "ns/svc/web").unwrap();
    assert_eq!(instance.monitor.status, MonitorStatus::Ready);
}

#[tokio::test]
async fn test_restarted_peer_replaces_replica() {
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let n1 = monitor("n1", &dir1);
    let n2 = monitor("n2", &dir2);

    n1.tick().await.unwrap();
    deliver(&n2, n1.outbox());
    for freeze in [true, false, true] {
        if freeze {
            n1.store().freeze_node();
        } else {
            n1.store().thaw_node();
        }
        n1.tick().await.unwrap();
        assert_eq!(deliver(&n2, n1.outbox()), vec![Ingested::Applied]);
    }
    let before = n2.store().peer("n1").unwrap();
    assert_eq!((before.boot, before.generation), (1, 4));
    assert!(before.is_frozen());

    // same var dir, no clean shutdown: generations start over
    drop(n1);
    let n1 = monitor("n1", &dir1);
    n1.tick().await.unwrap();
    assert_eq!(deliver(&n2, n1.outbox()), vec![Ingested::Replaced]);

    let after = n2.store().peer("n1").unwrap();
    assert_eq!((after.boot, after.generation), (2, 1));
    assert!(!after.is_frozen());
    assert!(n2.resync_requests().is_empty());

    n1.store().freeze_node();
    n1.tick().await.unwrap();
    assert_eq!(deliver(&n2, n1.outbox()), vec![Ingested::Applied]);
    assert!(n2.store().peer("n1").unwrap().is_frozen());
}
