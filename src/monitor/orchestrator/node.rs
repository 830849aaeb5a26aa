//! Node policy: rejoin grace period, frozen merge, node-level intents.

use super::Orchestrator;
use crate::common::format_timestamp;
use crate::monitor::actions::ActionRequest;
use crate::monitor::model::{MonitorStatus, NodeGlobalExpect, NodeStatus, Outcome};
use crate::monitor::store::ClusterView;
use tracing::{info, warn};

impl Orchestrator {
    /// The local status of every service has been collected once.
    pub fn on_local_status_collected(&self) {
        if self.store.nmon().status == NodeStatus::Init {
            *self.rejoin_started.lock() = Some(self.store.now());
            self.store.set_nmon_status(NodeStatus::Rejoin);
        }
    }

    pub(super) fn node_orchestrator(&self, view: &ClusterView) {
        match self.store.nmon().status {
            NodeStatus::Rejoin => self.check_rejoin_grace_period(view),
            NodeStatus::Idle => self.node_global_expect(view),
            NodeStatus::Init | NodeStatus::Shutting => {}
        }
    }

    fn check_rejoin_grace_period(&self, view: &ClusterView) {
        let peers: Vec<&String> = self
            .cluster_nodes
            .iter()
            .filter(|n| n.as_str() != self.local_node())
            .collect();
        if peers.is_empty() {
            self.end_rejoin_grace_period("single node cluster", view);
            return;
        }

        let rejoined = peers.iter().all(|name| {
            view.node(name).is_some_and(|snap| {
                matches!(snap.monitor.status, NodeStatus::Idle | NodeStatus::Rejoin)
                    && !snap.services.is_empty()
            })
        });
        if rejoined {
            self.end_rejoin_grace_period("now rejoined", view);
            return;
        }

        let started = self.rejoin_started.lock().unwrap_or_else(|| self.store.now());
        let elapsed = self.store.now() - started;
        if elapsed >= self.config.rejoin_grace_period().as_secs_f64() {
            let missing: Vec<&str> = peers
                .iter()
                .filter(|n| view.node(n).is_none())
                .map(|n| n.as_str())
                .collect();
            warn!(
                "rejoin grace period expired, peers not seen: {}. freeze node",
                missing.join(",")
            );
            self.store.freeze_node();
            self.end_rejoin_grace_period("expired", view);
        }
    }

    fn end_rejoin_grace_period(&self, reason: &str, view: &ClusterView) {
        info!("end of rejoin grace period: {}", reason);
        self.merge_frozen(view);
        self.store.set_nmon_status(NodeStatus::Idle);
    }

    /// Freeze what a peer froze while this node was down.
    fn merge_frozen(&self, view: &ClusterView) {
        let last_shutdown = self.store.last_shutdown();
        for (node, snap) in view.peers() {
            if snap.frozen > last_shutdown && snap.is_frozen() && self.store.node_frozen() == 0.0 {
                info!(
                    node = %node,
                    "peer node frozen at {}, after our last shutdown: freeze node",
                    format_timestamp(snap.frozen)
                );
                self.store.freeze_node();
            }
            for (path, instance) in &snap.services {
                if instance.frozen <= last_shutdown || !instance.is_frozen() {
                    continue;
                }
                let Some(local) = self.store.local_instance(path) else {
                    continue;
                };
                if local.is_frozen() || self.dispatcher.is_busy(path) {
                    continue;
                }
                info!(
                    path = %path,
                    node = %node,
                    "peer instance frozen at {}, after our last shutdown: freeze",
                    format_timestamp(instance.frozen)
                );
                let outcome = self.act(
                    MonitorStatus::Freezing,
                    ActionRequest::new(path.clone(), "freeze", MonitorStatus::FreezeFailed),
                );
                if let Outcome::Fail(e) = outcome {
                    warn!(path = %path, "freeze: {}", e);
                }
            }
        }
    }

    /// Apply and clear the node `global_expect`.
    fn node_global_expect(&self, view: &ClusterView) {
        let Some(target) = self.store.nmon().global_expect else {
            return;
        };
        let frozen = self.store.node_frozen() > 0.0;
        match target {
            NodeGlobalExpect::Frozen if !frozen => self.store.freeze_node(),
            NodeGlobalExpect::Thawed if frozen => self.store.thaw_node(),
            _ => {}
        }
        let want_frozen = target == NodeGlobalExpect::Frozen;
        let local_frozen = self.store.node_frozen() > 0.0;
        let done = local_frozen == want_frozen
            && view
                .peers()
                .all(|(_, snap)| snap.is_frozen() == want_frozen);
        if done {
            info!("node global expect {} reached on every node", target);
            self.store.set_nmon_global_expect(None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use crate::monitor::descriptor::ServiceDescriptor;
    use crate::monitor::model::{
        MonitorStatus, NodeGlobalExpect, NodeMonitor, NodeSnapshot, NodeStatus, ServiceInstance,
        Status, Topology,
    };
    use std::time::Duration;

    #[test]
    fn test_single_node_ends_grace_without_freeze() {
        let h = Harness::new("n1", &["n1"]);
        h.orchestrator.on_local_status_collected();
        assert_eq!(h.store.nmon().status, NodeStatus::Rejoin);
        h.pass();
        assert_eq!(h.store.nmon().status, NodeStatus::Idle);
        assert_eq!(h.store.node_frozen(), 0.0);
    }

    #[test]
    fn test_grace_expiry_freezes_node() {
        let h = Harness::new("n1", &["n1", "n2"]);
        h.orchestrator.on_local_status_collected();
        h.pass();
        assert_eq!(h.store.nmon().status, NodeStatus::Rejoin);

        h.clock.advance(Duration::from_secs(91));
        h.pass();
        assert_eq!(h.store.nmon().status, NodeStatus::Idle);
        assert!(h.store.node_frozen() > 0.0);
    }

    #[test]
    fn test_rejoined_when_peers_report() {
        let h = Harness::new("n1", &["n1", "n2"]);
        h.orchestrator.on_local_status_collected();
        h.peer("n2", "ns/svc/a", ServiceInstance::default());
        h.pass();
        assert_eq!(h.store.nmon().status, NodeStatus::Idle);
        assert_eq!(h.store.node_frozen(), 0.0);
    }

    #[test]
    fn test_frozen_merge_after_last_shutdown() {
        let h = Harness::new("n1", &["n1", "n2"]);
        h.store.set_last_shutdown(500.0);
        h.add_service(ServiceDescriptor::new(
            "ns/svc/a",
            Topology::Failover,
            vec!["n1".into(), "n2".into()],
        ));
        h.local("ns/svc/a", Status::Down);
        h.peer(
            "n2",
            "ns/svc/a",
            ServiceInstance {
                frozen: 800.0,
                ..Default::default()
            },
        );
        h.orchestrator.on_local_status_collected();
        h.pass();
        assert_eq!(h.calls(), vec!["ns/svc/a freeze"]);
        assert_eq!(h.store.smon("ns/svc/a").status, MonitorStatus::Idle);
    }

    #[test]
    fn test_node_global_expect_cleared_when_reached() {
        let h = Harness::new("n1", &["n1", "n2"]);
        h.peer_node(
            "n2",
            NodeSnapshot {
                frozen: 10.0,
                monitor: NodeMonitor {
                    status: NodeStatus::Idle,
                    ..Default::default()
                },
                services: [("ns/svc/a".to_string(), ServiceInstance::default())].into(),
                ..Default::default()
            },
        );
        h.orchestrator.on_local_status_collected();
        h.pass();
        assert_eq!(h.store.nmon().status, NodeStatus::Idle);

        h.store
            .set_nmon_global_expect(Some(NodeGlobalExpect::Frozen), None);
        h.pass();
        assert!(h.store.node_frozen() > 0.0);
        assert!(h.store.nmon().global_expect.is_none());
    }
}
