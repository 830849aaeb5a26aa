//! Intent reconciliation
//!
//! Peers only ever propose targets. A proposal is adopted when it is the
//! newest declaration seen for the path and when adopting it would change
//! something: an intent the cluster already satisfies is refused, and so is
//! one that the local monitor has already failed against.

use crate::common::newer_wins;
use crate::monitor::model::{
    AggregatedServiceStatus, FrozenState, GlobalExpect, MonitorStatus, NodeGlobalExpect, Placement,
    PlacementQuality, Provisioned, ServiceMonitor, Status, Topology,
};
use crate::monitor::store::{ClusterView, ExpectChange, SmonUpdate, StateStore};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// `(failed status, target)` pairs that reset `global_expect`.
const ABORT_TABLE: &[(MonitorStatus, &str)] = &[
    (MonitorStatus::StartFailed, "started"),
    (MonitorStatus::StopFailed, "stopped"),
    (MonitorStatus::ShutdownFailed, "shutdown"),
    (MonitorStatus::FreezeFailed, "frozen"),
    (MonitorStatus::ThawFailed, "thawed"),
    (MonitorStatus::ProvisionFailed, "provisioned"),
    (MonitorStatus::UnprovisionFailed, "unprovisioned"),
    (MonitorStatus::UnprovisionFailed, "purged"),
    (MonitorStatus::DeleteFailed, "deleted"),
    (MonitorStatus::DeleteFailed, "purged"),
];

/// Does a failed local action forbid pursuing `target` any further?
///
/// Relocation targets are scoped: a failed start aborts them on the leader,
/// a failed stop aborts them on a non-leader.
pub fn abort_conflict(status: MonitorStatus, placement: Placement, target: &GlobalExpect) -> bool {
    let name = target.to_string();
    if ABORT_TABLE.iter().any(|(s, t)| *s == status && *t == name) {
        return true;
    }
    match target {
        GlobalExpect::Placed | GlobalExpect::PlacedAt(_) => match placement {
            Placement::Leader => status == MonitorStatus::StartFailed,
            Placement::NonLeader | Placement::None => status == MonitorStatus::StopFailed,
        },
        _ => false,
    }
}

/// Is `target` already realized for `path` across the cluster view?
pub fn satisfied(
    target: &GlobalExpect,
    path: &str,
    agg: &AggregatedServiceStatus,
    view: &ClusterView,
) -> bool {
    let instances = view.instances(path);
    match target {
        GlobalExpect::Frozen => agg.frozen == FrozenState::Frozen,
        GlobalExpect::Thawed => agg.frozen == FrozenState::Thawed,
        GlobalExpect::Started => agg.avail == Status::Up,
        GlobalExpect::Stopped => instances.values().all(|i| !i.avail.is_up() && i.avail != Status::Warn),
        GlobalExpect::Shutdown => instances
            .values()
            .all(|i| i.avail.is_stopped() && i.overall.is_stopped()),
        GlobalExpect::Provisioned => agg.provisioned == Provisioned::True,
        GlobalExpect::Unprovisioned => {
            matches!(agg.provisioned, Provisioned::False | Provisioned::NotApplicable)
        }
        GlobalExpect::Deleted | GlobalExpect::Purged => instances.is_empty(),
        GlobalExpect::Placed => {
            agg.placement == PlacementQuality::Optimal && agg.avail == Status::Up
        }
        GlobalExpect::PlacedAt(nodes) => {
            let width = match instances.values().next().map(|i| i.topology) {
                Some(Topology::Failover) | None => 1,
                Some(_) => nodes.len(),
            };
            let wanted: BTreeSet<&str> = nodes.iter().take(width).map(String::as_str).collect();
            let running: BTreeSet<&str> = instances
                .iter()
                .filter(|(_, i)| i.avail.is_up())
                .map(|(n, _)| *n)
                .collect();
            !wanted.is_empty() && wanted == running
        }
        GlobalExpect::Aborted => view
            .local_instance(path)
            .map_or(true, |i| !i.monitor.status.is_waiting()),
    }
}

/// Should the local SMON adopt `target`?
///
/// Idempotent: returns false when the aggregated state already satisfies it.
pub fn accept_g_expect(
    path: &str,
    smon: &ServiceMonitor,
    agg: &AggregatedServiceStatus,
    view: &ClusterView,
    target: &GlobalExpect,
) -> bool {
    if abort_conflict(smon.status, smon.placement, target) {
        debug!(path = %path, "refuse global expect {}: {} already", target, smon.status);
        return false;
    }
    if satisfied(target, path, agg, view) {
        debug!(path = %path, "refuse global expect {}: already satisfied", target);
        return false;
    }
    true
}

/// Clear the local `global_expect` once the cluster satisfies it.
pub fn set_smon_g_expect_from_status(store: &StateStore, path: &str, view: &ClusterView) {
    let smon = store.smon(path);
    let Some(target) = smon.global_expect.as_ref() else {
        return;
    };
    if smon.status.is_transitioning() {
        return;
    }
    let agg = store.agg(path);
    if satisfied(target, path, &agg, view) {
        info!(path = %path, "global expect {} satisfied", target);
        store.set_smon(path, SmonUpdate::new().with_global_expect(ExpectChange::Unset));
    }
}

/// Newest peer declaration per path.
fn peer_declarations(view: &ClusterView) -> BTreeMap<String, (GlobalExpect, f64, String)> {
    let mut newest: BTreeMap<String, (GlobalExpect, f64, String)> = BTreeMap::new();
    for (node, snap) in view.peers() {
        for (path, instance) in &snap.services {
            let Some(target) = instance.monitor.global_expect.clone() else {
                continue;
            };
            let stamp = instance.monitor.global_expect_updated;
            let replace = match newest.get(path) {
                None => true,
                // equal stamps: lowest node name wins, so every node picks the same one
                Some((_, best, best_node)) => stamp > *best || (stamp == *best && node < best_node),
            };
            if replace {
                newest.insert(path.clone(), (target, stamp, node.clone()));
            }
        }
    }
    newest
}

/// Merge peer intents into the local SMON and NMON tables.
///
/// Returns the paths whose local `global_expect` changed.
pub fn merge_peer_intents(store: &StateStore, view: &ClusterView) -> Vec<String> {
    let mut adopted = Vec::new();
    for (path, (target, stamp, node)) in peer_declarations(view) {
        if view.local_instance(&path).is_none() {
            continue;
        }
        let smon = store.smon(&path);
        if !newer_wins(smon.global_expect.as_ref(), smon.global_expect_updated, &target, stamp) {
            continue;
        }
        let agg = store.agg(&path);
        if accept_g_expect(&path, &smon, &agg, view, &target) {
            info!(path = %path, node = %node, "adopt global expect {}", target);
            store.set_smon(
                &path,
                SmonUpdate::new().with_global_expect(ExpectChange::SetAt(target, stamp)),
            );
            adopted.push(path);
        }
    }
    merge_node_intent(store, view);
    adopted
}

/// Node-level `frozen` / `thawed` intents are adopted whenever the local
/// frozen flag disagrees with the declared target.
fn merge_node_intent(store: &StateStore, view: &ClusterView) {
    let local = store.nmon();
    let frozen = store.node_frozen() > 0.0;
    let declared = view
        .peers()
        .filter_map(|(_, snap)| {
            snap.monitor
                .global_expect
                .map(|g| (g, snap.monitor.global_expect_updated))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));
    let Some((target, stamp)) = declared else {
        return;
    };
    if local.global_expect == Some(target) {
        return;
    }
    let disagrees = match target {
        NodeGlobalExpect::Frozen => !frozen,
        NodeGlobalExpect::Thawed => frozen,
    };
    if disagrees {
        info!("adopt node global expect {}", target);
        store.set_nmon_global_expect(Some(target), Some(stamp));
    }
}
