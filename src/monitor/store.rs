//! Lock-protected cluster database
//!
//! Regions:
//! - the local node snapshot (written by the monitor loop only)
//! - peer snapshot replicas (written by gossip ingestion only, or purged)
//! - the local SMON table
//! - the aggregated status cache (rebuilt every pass)
//!
//! Every accessor copies data out. No lock is held across a decision, and no
//! two locks are ever held at once.

use crate::common::{Clock, SystemClock};
use crate::monitor::model::{
    AggregatedServiceStatus, GlobalExpect, LocalExpect, MonitorStatus, NodeGlobalExpect,
    NodeMonitor, NodeSnapshot, NodeStats, NodeStatus, Placement, ServiceConfigRef,
    ServiceInstance, ServiceMonitor, COMPAT_VERSION,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Change to a `global_expect` field.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpectChange {
    /// Set, stamped with the local clock
    Set(GlobalExpect),
    /// Set, keeping the stamp of the peer that declared it
    SetAt(GlobalExpect, f64),
    Unset,
}

/// Partial update of a SMON record. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct SmonUpdate {
    pub status: Option<MonitorStatus>,
    pub global_expect: Option<ExpectChange>,
    pub local_expect: Option<Option<LocalExpect>>,
    pub placement: Option<Placement>,
    pub stonith: Option<Option<String>>,
    pub restart_incr: Option<String>,
    pub restart_reset: Option<String>,
}

impl SmonUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: MonitorStatus) -> Self {
        Self::new().with_status(status)
    }

    pub fn with_status(mut self, status: MonitorStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_global_expect(mut self, change: ExpectChange) -> Self {
        self.global_expect = Some(change);
        self
    }

    pub fn with_local_expect(mut self, local_expect: Option<LocalExpect>) -> Self {
        self.local_expect = Some(local_expect);
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn with_stonith(mut self, stonith: Option<String>) -> Self {
        self.stonith = Some(stonith);
        self
    }

    pub fn incr_restart(mut self, rid: impl Into<String>) -> Self {
        self.restart_incr = Some(rid.into());
        self
    }

    pub fn reset_restart(mut self, rid: impl Into<String>) -> Self {
        self.restart_reset = Some(rid.into());
        self
    }
}

/// Owned copy of every usable node snapshot, local node included.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub local: String,
    pub nodes: BTreeMap<String, NodeSnapshot>,
}

impl ClusterView {
    pub fn node(&self, name: &str) -> Option<&NodeSnapshot> {
        self.nodes.get(name)
    }

    pub fn local_node(&self) -> Option<&NodeSnapshot> {
        self.nodes.get(&self.local)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn peers(&self) -> impl Iterator<Item = (&String, &NodeSnapshot)> {
        self.nodes.iter().filter(move |(name, _)| **name != self.local)
    }

    /// Every node's instance of `path`, keyed by node name
    pub fn instances(&self, path: &str) -> BTreeMap<&str, &ServiceInstance> {
        self.nodes
            .iter()
            .filter_map(|(name, snap)| snap.services.get(path).map(|i| (name.as_str(), i)))
            .collect()
    }

    pub fn instance(&self, node: &str, path: &str) -> Option<&ServiceInstance> {
        self.nodes.get(node).and_then(|n| n.services.get(path))
    }

    pub fn local_instance(&self, path: &str) -> Option<&ServiceInstance> {
        self.instance(&self.local, path)
    }

    /// Every service path seen on any node
    pub fn paths(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .flat_map(|n| n.services.keys().cloned())
            .collect()
    }

    pub fn is_node_frozen(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(NodeSnapshot::is_frozen)
    }
}

pub struct StateStore {
    nodename: String,
    clock: Arc<dyn Clock>,
    local: Mutex<NodeSnapshot>,
    peers: Mutex<BTreeMap<String, NodeSnapshot>>,
    smon: Mutex<BTreeMap<String, ServiceMonitor>>,
    agg: Mutex<BTreeMap<String, AggregatedServiceStatus>>,
    incompatible: Mutex<BTreeSet<String>>,
    last_shutdown: Mutex<f64>,
    changed: Notify,
}

impl StateStore {
    pub fn new(nodename: impl Into<String>) -> Self {
        Self::with_clock(nodename, Arc::new(SystemClock))
    }

    pub fn with_clock(nodename: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let mut local = NodeSnapshot::default();
        local.monitor.status_updated = clock.now();
        Self {
            nodename: nodename.into(),
            clock,
            local: Mutex::new(local),
            peers: Mutex::new(BTreeMap::new()),
            smon: Mutex::new(BTreeMap::new()),
            agg: Mutex::new(BTreeMap::new()),
            incompatible: Mutex::new(BTreeSet::new()),
            last_shutdown: Mutex::new(0.0),
            changed: Notify::new(),
        }
    }

    pub fn nodename(&self) -> &str {
        &self.nodename
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    // === Change notification ===

    /// Wake the monitor loop early.
    pub fn notify_changed(&self) {
        self.changed.notify_one();
    }

    /// Wait for a change notification or `timeout`, whichever comes first.
    /// Returns true when woken by a change.
    pub async fn wait_changed(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.changed.notified())
            .await
            .is_ok()
    }

    // === Service monitors ===

    /// SMON of `path`. A never-seen path starts `idle`.
    pub fn smon(&self, path: &str) -> ServiceMonitor {
        self.smon.lock().get(path).cloned().unwrap_or_default()
    }

    pub fn smons(&self) -> BTreeMap<String, ServiceMonitor> {
        self.smon.lock().clone()
    }

    pub fn remove_smon(&self, path: &str) {
        if self.smon.lock().remove(path).is_some() {
            info!(path = %path, "service monitor dropped");
        }
    }

    /// Apply `update` to the SMON of `path` and return the new record.
    pub fn set_smon(&self, path: &str, update: SmonUpdate) -> ServiceMonitor {
        let now = self.now();
        let mut table = self.smon.lock();
        let mut changed = !table.contains_key(path);
        let smon = table.entry(path.to_string()).or_insert_with(|| ServiceMonitor {
            status_updated: now,
            ..Default::default()
        });

        if let Some(status) = update.status {
            if smon.status != status {
                info!("{} monitor status change: {} => {}", path, smon.status, status);
                smon.status = status;
                smon.status_updated = now;
                changed = true;
            }
        }
        if let Some(change) = update.global_expect {
            let (value, stamp) = match change {
                ExpectChange::Set(g) => (Some(g), now),
                ExpectChange::SetAt(g, ts) => (Some(g), ts),
                ExpectChange::Unset => (None, now),
            };
            if smon.global_expect != value {
                info!(
                    "{} global expect change: {} => {}",
                    path,
                    display_opt(&smon.global_expect),
                    display_opt(&value)
                );
                smon.global_expect = value;
                smon.global_expect_updated = stamp;
                changed = true;
            }
        }
        if let Some(local_expect) = update.local_expect {
            if smon.local_expect != local_expect {
                info!(
                    "{} local expect change: {} => {}",
                    path,
                    display_opt(&smon.local_expect),
                    display_opt(&local_expect)
                );
                smon.local_expect = local_expect;
                changed = true;
            }
        }
        if let Some(placement) = update.placement {
            if smon.placement != placement {
                info!("{} placement change: {} => {}", path, smon.placement, placement);
                smon.placement = placement;
                changed = true;
            }
        }
        if let Some(stonith) = update.stonith {
            if smon.stonith != stonith {
                smon.stonith = stonith;
                changed = true;
            }
        }
        if let Some(rid) = update.restart_incr {
            *smon.restart.entry(rid).or_insert(0) += 1;
            changed = true;
        }
        if let Some(rid) = update.restart_reset {
            changed |= smon.restart.remove(&rid).is_some();
        }
        let smon = smon.clone();
        drop(table);
        if changed {
            self.notify_changed();
        }
        smon
    }

    // === Node monitor ===

    pub fn nmon(&self) -> NodeMonitor {
        self.local.lock().monitor.clone()
    }

    pub fn set_nmon_status(&self, status: NodeStatus) {
        let now = self.now();
        let mut local = self.local.lock();
        if local.monitor.status != status {
            info!("node monitor status change: {} => {}", local.monitor.status, status);
            local.monitor.status = status;
            local.monitor.status_updated = now;
            drop(local);
            self.notify_changed();
        }
    }

    pub fn set_nmon_global_expect(&self, global_expect: Option<NodeGlobalExpect>, updated: Option<f64>) {
        let stamp = updated.unwrap_or_else(|| self.now());
        let mut local = self.local.lock();
        if local.monitor.global_expect != global_expect {
            info!(
                "node global expect change: {} => {}",
                display_opt(&local.monitor.global_expect),
                display_opt(&global_expect)
            );
            local.monitor.global_expect = global_expect;
            local.monitor.global_expect_updated = stamp;
            drop(local);
            self.notify_changed();
        }
    }

    // === Local node region ===

    pub fn node_frozen(&self) -> f64 {
        self.local.lock().frozen
    }

    pub fn freeze_node(&self) {
        let now = self.now();
        let mut local = self.local.lock();
        if local.frozen == 0.0 {
            info!("freeze node");
            local.frozen = now;
            drop(local);
            self.notify_changed();
        }
    }

    pub fn thaw_node(&self) {
        let mut local = self.local.lock();
        if local.frozen > 0.0 {
            info!("thaw node");
            local.frozen = 0.0;
            drop(local);
            self.notify_changed();
        }
    }

    pub fn boot(&self) -> u64 {
        self.local.lock().boot
    }

    /// Stamp the local snapshot with this daemon's boot counter.
    pub fn set_boot(&self, boot: u64) {
        self.local.lock().boot = boot;
    }

    pub fn last_shutdown(&self) -> f64 {
        *self.last_shutdown.lock()
    }

    pub fn set_last_shutdown(&self, ts: f64) {
        *self.last_shutdown.lock() = ts;
    }

    pub fn local_instance(&self, path: &str) -> Option<ServiceInstance> {
        self.local.lock().services.get(path).cloned()
    }

    pub fn local_paths(&self) -> Vec<String> {
        self.local.lock().services.keys().cloned().collect()
    }

    pub fn put_local_instance(&self, path: &str, instance: ServiceInstance) {
        self.local.lock().services.insert(path.to_string(), instance);
    }

    /// Drop the local instance and its SMON (service deleted on this node).
    pub fn remove_local_instance(&self, path: &str) -> Option<ServiceInstance> {
        let removed = self.local.lock().services.remove(path);
        self.local.lock().config.remove(path);
        self.remove_smon(path);
        removed
    }

    pub fn set_local_stats(&self, stats: NodeStats) {
        self.local.lock().stats = stats;
    }

    /// Stamp the local snapshot with the generation the codec published.
    pub fn set_local_generation(&self, generation: u64, updated: f64) {
        let mut local = self.local.lock();
        local.generation = generation;
        local.updated = updated;
    }

    pub fn set_local_config(&self, config: BTreeMap<String, ServiceConfigRef>) {
        self.local.lock().config = config;
    }

    /// The local node snapshot, SMON copies embedded in each instance.
    pub fn local_snapshot(&self) -> NodeSnapshot {
        let smons = self.smons();
        let mut snap = self.local.lock().clone();
        for (path, instance) in snap.services.iter_mut() {
            if let Some(smon) = smons.get(path) {
                instance.monitor = smon.clone();
            }
        }
        snap
    }

    // === Peer replicas ===

    pub fn peer(&self, node: &str) -> Option<NodeSnapshot> {
        self.peers.lock().get(node).cloned()
    }

    /// Replace a peer replica with a full snapshot.
    pub fn put_peer(&self, node: &str, snapshot: NodeSnapshot) {
        if node == self.nodename {
            warn!("refuse to overwrite the local snapshot with gossip data");
            return;
        }
        self.peers.lock().insert(node.to_string(), snapshot);
        self.notify_changed();
    }

    /// Drop a departed peer. The only local mutation of a peer region.
    pub fn purge_peer(&self, node: &str) -> Option<NodeSnapshot> {
        let removed = self.peers.lock().remove(node);
        if removed.is_some() {
            info!(node = %node, "purge peer data");
            self.incompatible.lock().remove(node);
            self.notify_changed();
        }
        removed
    }

    /// Local snapshot plus every compatible peer replica.
    pub fn cluster_view(&self) -> ClusterView {
        let mut nodes = BTreeMap::new();
        let peers = self.peers.lock().clone();
        for (name, snap) in peers {
            if snap.compat != COMPAT_VERSION {
                if self.incompatible.lock().insert(name.clone()) {
                    warn!(
                        node = %name,
                        "ignore peer data: compat {} differs from ours {}",
                        snap.compat,
                        COMPAT_VERSION
                    );
                }
                continue;
            }
            nodes.insert(name, snap);
        }
        nodes.insert(self.nodename.clone(), self.local_snapshot());
        ClusterView {
            local: self.nodename.clone(),
            nodes,
        }
    }

    // === Aggregated status cache ===

    pub fn agg(&self, path: &str) -> AggregatedServiceStatus {
        self.agg.lock().get(path).cloned().unwrap_or_default()
    }

    pub fn aggs(&self) -> BTreeMap<String, AggregatedServiceStatus> {
        self.agg.lock().clone()
    }

    pub fn replace_aggs(&self, aggs: BTreeMap<String, AggregatedServiceStatus>) {
        *self.agg.lock() = aggs;
    }
}

fn display_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "unset".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;

    fn store() -> (StateStore, ManualClock) {
        let clock = ManualClock::new(1000.0);
        (StateStore::with_clock("n1", Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_unknown_smon_is_idle() {
        let (store, _) = store();
        let smon = store.smon("ns/svc/a");
        assert_eq!(smon.status, MonitorStatus::Idle);
        assert!(smon.global_expect.is_none());
    }

    #[test]
    fn test_set_smon_stamps_changes_only() {
        let (store, clock) = store();
        store.set_smon("ns/svc/a", SmonUpdate::status(MonitorStatus::Ready));
        assert_eq!(store.smon("ns/svc/a").status_updated, 1000.0);

        clock.advance(Duration::from_secs(5));
        store.set_smon("ns/svc/a", SmonUpdate::status(MonitorStatus::Ready));
        assert_eq!(store.smon("ns/svc/a").status_updated, 1000.0);

        let smon = store.set_smon(
            "ns/svc/a",
            SmonUpdate::status(MonitorStatus::Starting)
                .with_global_expect(ExpectChange::SetAt(GlobalExpect::Started, 900.0)),
        );
        assert_eq!(smon.status_updated, 1005.0);
        assert_eq!(smon.global_expect_updated, 900.0);
    }

    #[test]
    fn test_restart_counters() {
        let (store, _) = store();
        store.set_smon("p/s/a", SmonUpdate::new().incr_restart("app#1"));
        store.set_smon("p/s/a", SmonUpdate::new().incr_restart("app#1"));
        assert_eq!(store.smon("p/s/a").restart["app#1"], 2);
        store.set_smon("p/s/a", SmonUpdate::new().reset_restart("app#1"));
        assert!(store.smon("p/s/a").restart.is_empty());
    }

    #[test]
    fn test_local_snapshot_embeds_smon() {
        let (store, _) = store();
        store.put_local_instance("ns/svc/a", ServiceInstance::default());
        store.set_smon(
            "ns/svc/a",
            SmonUpdate::new().with_placement(Placement::Leader),
        );
        let snap = store.local_snapshot();
        assert_eq!(snap.services["ns/svc/a"].monitor.placement, Placement::Leader);
    }

    #[test]
    fn test_cluster_view_skips_incompatible_peers() {
        let (store, _) = store();
        store.put_peer("n2", NodeSnapshot::default());
        store.put_peer(
            "n3",
            NodeSnapshot {
                compat: COMPAT_VERSION + 1,
                ..Default::default()
            },
        );
        let view = store.cluster_view();
        let names: Vec<_> = view.node_names().cloned().collect();
        assert_eq!(names, vec!["n1", "n2"]);
    }

    #[test]
    fn test_put_peer_refuses_local_name() {
        let (store, _) = store();
        store.put_peer("n1", NodeSnapshot::default());
        assert!(store.peer("n1").is_none());
    }

    #[tokio::test]
    async fn test_wait_changed() {
        let (store, _) = store();
        store.notify_changed();
        assert!(store.wait_changed(Duration::from_millis(10)).await);
        assert!(!store.wait_changed(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_node_freeze_wakes_loop() {
        let (store, _) = store();
        store.freeze_node();
        assert!(store.wait_changed(Duration::from_millis(10)).await);
        // already frozen: nothing to announce
        store.freeze_node();
        assert!(!store.wait_changed(Duration::from_millis(10)).await);
        store.thaw_node();
        assert!(store.wait_changed(Duration::from_millis(10)).await);
    }
}
