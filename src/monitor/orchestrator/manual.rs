//! Manual policy: drive the local instance toward the declared
//! `global_expect`, respecting the ordering each target requires.

use super::Orchestrator;
use crate::monitor::actions::{ActionRequest, FollowUp};
use crate::monitor::descriptor::ServiceDescriptor;
use crate::monitor::model::{
    GlobalExpect, LocalExpect, MonitorStatus, Outcome, Placement, Provisioned, ServiceInstance,
    ServiceMonitor, Status, Topology,
};
use crate::monitor::placement::Discard;
use crate::monitor::store::{ClusterView, ExpectChange, SmonUpdate};
use tracing::info;

impl Orchestrator {
    pub(super) fn service_orchestrator_manual(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        target: &GlobalExpect,
        view: &ClusterView,
    ) -> Outcome {
        let Some(local) = view.local_instance(&desc.path) else {
            return Outcome::Continue;
        };
        match target {
            GlobalExpect::Frozen => self.manual_freeze(desc, local),
            GlobalExpect::Thawed => self.manual_thaw(desc, local),
            GlobalExpect::Started => self.manual_started(desc, smon, local, view),
            GlobalExpect::Stopped => self.manual_stopped(desc, local),
            GlobalExpect::Shutdown => self.manual_shutdown(desc, local),
            GlobalExpect::Provisioned => self.manual_provisioned(desc, smon, local, view),
            GlobalExpect::Unprovisioned => self.manual_unprovisioned(desc, smon, local, view),
            GlobalExpect::Purged => self.manual_purged(desc, smon, local, view),
            GlobalExpect::Deleted => self.manual_deleted(desc, smon, view),
            GlobalExpect::Placed => {
                let leaders = self.placement.leaders(desc, view, Discard::none());
                self.manual_placed(desc, smon, local, view, &leaders)
            }
            GlobalExpect::PlacedAt(nodes) => {
                let width = match desc.topology {
                    Topology::Failover => 1,
                    Topology::Flex | Topology::Span => nodes.len(),
                };
                let leaders: Vec<String> = nodes
                    .iter()
                    .filter(|n| view.instance(n, &desc.path).is_some())
                    .take(width)
                    .cloned()
                    .collect();
                self.manual_placed(desc, smon, local, view, &leaders)
            }
            GlobalExpect::Aborted => self.manual_aborted(desc, smon),
        }
    }

    /// Move out of a wait state whose condition no longer holds.
    fn settle(&self, path: &str, smon: &ServiceMonitor) -> Outcome {
        if smon.status.is_waiting() || smon.status == MonitorStatus::Ready {
            self.set_status(path, MonitorStatus::Idle);
        }
        Outcome::Continue
    }

    fn wait(&self, path: &str, status: MonitorStatus) -> Outcome {
        self.set_status(path, status);
        Outcome::Continue
    }

    fn manual_freeze(&self, desc: &ServiceDescriptor, local: &ServiceInstance) -> Outcome {
        if local.is_frozen() {
            return Outcome::Continue;
        }
        self.act(
            MonitorStatus::Freezing,
            ActionRequest::new(desc.path.as_str(), "freeze", MonitorStatus::FreezeFailed),
        )
    }

    fn manual_thaw(&self, desc: &ServiceDescriptor, local: &ServiceInstance) -> Outcome {
        if !local.is_frozen() {
            return Outcome::Continue;
        }
        self.act(
            MonitorStatus::Thawing,
            ActionRequest::new(desc.path.as_str(), "thaw", MonitorStatus::ThawFailed),
        )
    }

    fn start(&self, path: &str) -> Outcome {
        info!(path = %path, "start");
        self.act(
            MonitorStatus::Starting,
            ActionRequest::new(path, "start", MonitorStatus::StartFailed).on_success(
                FollowUp::status(MonitorStatus::Idle).with_local_expect(Some(LocalExpect::Started)),
            ),
        )
    }

    fn stop(&self, path: &str) -> Outcome {
        info!(path = %path, "stop");
        self.act(
            MonitorStatus::Stopping,
            ActionRequest::new(path, "stop", MonitorStatus::StopFailed)
                .on_success(FollowUp::status(MonitorStatus::Idle).with_local_expect(None)),
        )
    }

    fn manual_started(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        local: &ServiceInstance,
        view: &ClusterView,
    ) -> Outcome {
        let path = desc.path.as_str();
        if local.is_frozen() {
            return self.manual_thaw(desc, local);
        }
        if local.avail.is_up() {
            return self.settle(path, smon);
        }
        let discard = Discard {
            frozen: true,
            ..Discard::none()
        };
        if !self.placement.leaders(desc, view, discard).contains(&view.local) {
            return self.settle(path, smon);
        }
        if desc.topology == Topology::Failover && view.instances(path).values().any(|i| i.avail.is_up()) {
            return self.settle(path, smon);
        }
        if self.peer_transitioning(path, view) {
            return Outcome::Continue;
        }
        if !self.parents_available(desc) {
            return self.wait(path, MonitorStatus::WaitParents);
        }
        self.start(path)
    }

    fn manual_stopped(&self, desc: &ServiceDescriptor, local: &ServiceInstance) -> Outcome {
        if !local.is_frozen() {
            return self.manual_freeze(desc, local);
        }
        if matches!(local.avail, Status::Up | Status::Warn) {
            return self.stop(&desc.path);
        }
        Outcome::Continue
    }

    fn manual_shutdown(&self, desc: &ServiceDescriptor, local: &ServiceInstance) -> Outcome {
        if !local.is_frozen() {
            return self.manual_freeze(desc, local);
        }
        if local.avail.is_stopped() && local.overall.is_stopped() {
            return Outcome::Continue;
        }
        self.act(
            MonitorStatus::Shutting,
            ActionRequest::new(desc.path.as_str(), "shutdown", MonitorStatus::ShutdownFailed)
                .on_success(FollowUp::status(MonitorStatus::Idle).with_local_expect(None)),
        )
    }

    /// Leader first: non-leaders wait for the leader to be provisioned.
    fn manual_provisioned(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        local: &ServiceInstance,
        view: &ClusterView,
    ) -> Outcome {
        let path = desc.path.as_str();
        if local.provisioned() == Provisioned::True {
            return self.settle(path, smon);
        }
        let parents_ready = desc.parents.iter().all(|p| {
            matches!(
                self.store.agg(p).provisioned,
                Provisioned::True | Provisioned::NotApplicable
            )
        });
        if !parents_ready {
            return self.wait(path, MonitorStatus::WaitParents);
        }
        let in_sync = desc
            .nodes
            .iter()
            .all(|node| view.instance(node, path).is_some());
        if !in_sync {
            return self.wait(path, MonitorStatus::WaitSync);
        }
        let leader = self.placement.leader(desc, view, Discard::all());
        if let Some(leader) = leader.filter(|l| *l != view.local) {
            let leader_done = view
                .instance(&leader, path)
                .is_some_and(|i| i.provisioned() == Provisioned::True);
            if !leader_done {
                return self.wait(path, MonitorStatus::WaitLeader);
            }
        }
        self.act(
            MonitorStatus::Provisioning,
            ActionRequest::new(path, "provision", MonitorStatus::ProvisionFailed),
        )
    }

    /// Children must be unprovisioned before their parent.
    fn children_unprovisioned(&self, desc: &ServiceDescriptor) -> bool {
        desc.children.iter().all(|c| {
            matches!(
                self.store.agg(c).provisioned,
                Provisioned::False | Provisioned::NotApplicable
            )
        })
    }

    /// Leader last: the leader keeps its instance until every other node
    /// tore its own down.
    fn unprovision_leader_last(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        view: &ClusterView,
        on_success: FollowUp,
    ) -> Outcome {
        let path = desc.path.as_str();
        if smon.placement == Placement::Leader {
            let peers_done = view.peers().all(|(_, snap)| {
                snap.services
                    .get(path)
                    .map_or(true, ServiceInstance::is_unprovisioned)
            });
            if !peers_done {
                return self.wait(path, MonitorStatus::WaitNonLeader);
            }
        }
        self.act(
            MonitorStatus::Unprovisioning,
            ActionRequest::new(path, "unprovision", MonitorStatus::UnprovisionFailed)
                .on_success(on_success),
        )
    }

    fn manual_unprovisioned(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        local: &ServiceInstance,
        view: &ClusterView,
    ) -> Outcome {
        let path = desc.path.as_str();
        if !self.children_unprovisioned(desc) {
            return self.wait(path, MonitorStatus::WaitChildren);
        }
        if local.is_unprovisioned() {
            return self.settle(path, smon);
        }
        self.unprovision_leader_last(
            desc,
            smon,
            view,
            FollowUp::status(MonitorStatus::Idle).with_local_expect(None),
        )
    }

    fn manual_purged(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        local: &ServiceInstance,
        view: &ClusterView,
    ) -> Outcome {
        let path = desc.path.as_str();
        let children_gone = desc
            .children
            .iter()
            .all(|c| view.instances(c).is_empty());
        if !children_gone {
            return self.wait(path, MonitorStatus::WaitChildren);
        }
        if !local.is_unprovisioned() {
            return self.unprovision_leader_last(
                desc,
                smon,
                view,
                FollowUp::status(MonitorStatus::Idle).with_local_expect(None),
            );
        }
        self.delete(path)
    }

    fn manual_deleted(&self, desc: &ServiceDescriptor, smon: &ServiceMonitor, view: &ClusterView) -> Outcome {
        let path = desc.path.as_str();
        let children_gone = desc
            .children
            .iter()
            .all(|c| view.instances(c).is_empty());
        if !children_gone {
            return self.wait(path, MonitorStatus::WaitChildren);
        }
        if smon.status.is_waiting() {
            self.set_status(path, MonitorStatus::Idle);
        }
        self.delete(path)
    }

    fn delete(&self, path: &str) -> Outcome {
        info!(path = %path, "delete");
        self.act(
            MonitorStatus::Deleting,
            ActionRequest::new(path, "delete", MonitorStatus::DeleteFailed)
                .on_success(FollowUp::default().dropping_instance()),
        )
    }

    /// Relocate: non-leaders stop first, then the leaders start.
    fn manual_placed(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        local: &ServiceInstance,
        view: &ClusterView,
        leaders: &[String],
    ) -> Outcome {
        let path = desc.path.as_str();
        if leaders.is_empty() {
            return Outcome::Abort("no placement candidate".into());
        }
        let local_running = matches!(local.avail, Status::Up | Status::Warn);
        if !leaders.contains(&view.local) {
            if local_running {
                return self.stop(path);
            }
            return self.settle(path, smon);
        }
        if local_running {
            return self.settle(path, smon);
        }
        let others_running = view.instances(path).iter().any(|(node, i)| {
            !leaders.iter().any(|l| l == node) && matches!(i.avail, Status::Up | Status::Warn)
        });
        if others_running || self.peer_transitioning(path, view) {
            return self.wait(path, MonitorStatus::WaitNonLeader);
        }
        if local.is_frozen() {
            return self.manual_thaw(desc, local);
        }
        self.start(path)
    }

    fn manual_aborted(&self, desc: &ServiceDescriptor, smon: &ServiceMonitor) -> Outcome {
        let path = desc.path.as_str();
        info!(path = %path, "abort pending orchestration");
        self.settle(path, smon);
        self.store
            .set_smon(path, SmonUpdate::new().with_global_expect(ExpectChange::Unset));
        Outcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use crate::monitor::descriptor::ServiceDescriptor;
    use crate::monitor::model::{
        GlobalExpect, MonitorStatus, NodeStatus, ResourceStatus, ServiceInstance, Status, Topology,
    };
    use crate::monitor::store::{ExpectChange, SmonUpdate};

    const PATH: &str = "ns/svc/db";

    fn harness(local: &str, cluster: &[&str]) -> Harness {
        let h = Harness::new(local, cluster);
        h.store.set_nmon_status(NodeStatus::Idle);
        h.add_service(ServiceDescriptor::new(
            PATH,
            Topology::Failover,
            cluster.iter().map(|s| s.to_string()).collect(),
        ));
        h
    }

    fn expect(h: &Harness, target: GlobalExpect) {
        h.store.set_smon(
            PATH,
            SmonUpdate::new().with_global_expect(ExpectChange::Set(target)),
        );
    }

    fn provisioned(avail: Status, provisioned: bool) -> ServiceInstance {
        let mut inst = ServiceInstance {
            avail,
            overall: avail,
            ..Default::default()
        };
        inst.resources.insert(
            "disk#1".into(),
            ResourceStatus {
                provisioned: Some(provisioned),
                ..Default::default()
            },
        );
        inst
    }

    #[test]
    fn test_stopped_freezes_then_stops() {
        let h = harness("a", &["a"]);
        h.local(PATH, Status::Up);
        expect(&h, GlobalExpect::Stopped);
        h.pass();
        assert_eq!(h.calls(), vec![format!("{} freeze", PATH)]);

        let mut inst = h.store.local_instance(PATH).unwrap();
        inst.frozen = 1000.0;
        h.store.put_local_instance(PATH, inst);
        h.pass();
        assert_eq!(h.calls().last().unwrap(), &format!("{} stop", PATH));
    }

    #[test]
    fn test_purge_leader_waits_for_non_leaders() {
        let h = harness("a", &["a", "b"]);
        h.store.put_local_instance(PATH, provisioned(Status::Down, true));
        h.peer("b", PATH, provisioned(Status::Down, true));
        expect(&h, GlobalExpect::Purged);

        h.pass();
        assert_eq!(h.store.smon(PATH).status, MonitorStatus::WaitNonLeader);
        assert!(h.calls().is_empty());

        h.peer("b", PATH, provisioned(Status::Down, false));
        h.pass();
        assert_eq!(h.calls(), vec![format!("{} unprovision", PATH)]);
    }

    #[test]
    fn test_purge_non_leader_goes_first() {
        let h = harness("b", &["a", "b"]);
        h.store.put_local_instance(PATH, provisioned(Status::Down, true));
        h.peer("a", PATH, provisioned(Status::Down, true));
        expect(&h, GlobalExpect::Purged);
        h.pass();
        assert_eq!(h.calls(), vec![format!("{} unprovision", PATH)]);

        h.store.put_local_instance(PATH, provisioned(Status::Down, false));
        h.pass();
        assert_eq!(h.calls().last().unwrap(), &format!("{} delete", PATH));
        assert!(h.store.local_instance(PATH).is_none());
    }

    #[test]
    fn test_provision_leader_first() {
        let h = harness("b", &["a", "b"]);
        h.store.put_local_instance(PATH, provisioned(Status::Down, false));
        expect(&h, GlobalExpect::Provisioned);
        h.pass();
        assert_eq!(h.store.smon(PATH).status, MonitorStatus::WaitSync);

        h.peer("a", PATH, provisioned(Status::Down, false));
        h.pass();
        assert_eq!(h.store.smon(PATH).status, MonitorStatus::WaitLeader);

        h.peer("a", PATH, provisioned(Status::Down, true));
        h.pass();
        assert_eq!(h.calls(), vec![format!("{} provision", PATH)]);
    }

    #[test]
    fn test_placed_at_relocates() {
        let h = harness("a", &["a", "b"]);
        h.local(PATH, Status::Up);
        h.peer(
            "b",
            PATH,
            ServiceInstance {
                avail: Status::Down,
                ..Default::default()
            },
        );
        expect(&h, GlobalExpect::PlacedAt(vec!["b".into()]));
        h.pass();
        assert_eq!(h.calls(), vec![format!("{} stop", PATH)]);
    }

    #[test]
    fn test_aborted_clears_waits() {
        let h = harness("a", &["a", "b"]);
        h.local(PATH, Status::Down);
        h.store
            .set_smon(PATH, SmonUpdate::status(MonitorStatus::WaitNonLeader));
        expect(&h, GlobalExpect::Aborted);
        h.pass();
        let smon = h.store.smon(PATH);
        assert_eq!(smon.status, MonitorStatus::Idle);
        assert!(smon.global_expect.is_none());
    }
}
