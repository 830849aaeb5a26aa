//! Automatic policy: keep services running where placement says they should.

use super::Orchestrator;
use crate::monitor::actions::{ActionRequest, FollowUp};
use crate::monitor::descriptor::{OrchestrateMode, ServiceDescriptor};
use crate::monitor::model::{
    LocalExpect, MonitorStatus, NodeSnapshot, Outcome, ServiceMonitor, Status, Topology,
};
use crate::monitor::placement::Discard;
use crate::monitor::store::{ClusterView, SmonUpdate};
use tracing::{debug, info};

impl Orchestrator {
    pub(super) fn service_orchestrator_auto(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        view: &ClusterView,
    ) -> Outcome {
        if desc.orchestrate == OrchestrateMode::No || smon.status.is_failed() {
            return Outcome::Continue;
        }
        let Some(local) = view.local_instance(&desc.path) else {
            return Outcome::Continue;
        };
        if local.is_frozen() || view.is_node_frozen(&view.local) {
            if matches!(smon.status, MonitorStatus::Ready | MonitorStatus::WaitParents) {
                self.set_status(&desc.path, MonitorStatus::Idle);
            }
            return Outcome::Continue;
        }
        match desc.topology {
            Topology::Failover => self.auto_failover(desc, smon, view),
            Topology::Flex | Topology::Span => self.auto_flex(desc, smon, view),
        }
    }

    fn auto_failover(&self, desc: &ServiceDescriptor, smon: &ServiceMonitor, view: &ClusterView) -> Outcome {
        let path = desc.path.as_str();
        let instances = view.instances(path);
        let running = instances
            .values()
            .any(|i| matches!(i.avail, Status::Up | Status::Warn));
        if running {
            return self.back_to_idle(path, smon, "service already running");
        }
        let local_stopped = instances
            .get(view.local.as_str())
            .is_some_and(|i| i.avail.is_stopped());
        if !local_stopped {
            return Outcome::Continue;
        }

        let ranks = self.placement.ranked_candidates(desc, view, Discard::none());
        if ranks.first() != Some(&view.local) {
            return self.back_to_idle(path, smon, "not placement leader");
        }
        if self.peer_transitioning(path, view) {
            return Outcome::Continue;
        }
        self.start_when_ready(desc, smon, view, &ranks)
    }

    fn auto_flex(&self, desc: &ServiceDescriptor, smon: &ServiceMonitor, view: &ClusterView) -> Outcome {
        let path = desc.path.as_str();
        let instances = view.instances(path);
        let up_nodes: Vec<String> = instances
            .iter()
            .filter(|(_, i)| i.avail.is_up())
            .map(|(n, _)| n.to_string())
            .collect();
        let n_up = up_nodes.len() as u32;
        let target = desc.flex_target();
        let local_up = up_nodes.contains(&view.local);

        if n_up < target {
            if local_up {
                return Outcome::Continue;
            }
            let leaders = self.placement.leaders(desc, view, Discard::none());
            if !leaders.contains(&view.local) {
                return self.back_to_idle(path, smon, "not elected");
            }
            if self.peer_transitioning(path, view) {
                return Outcome::Continue;
            }
            // co-elected peers may get ready alongside us
            let ranks: Vec<String> = self
                .placement
                .ranked_candidates(desc, view, Discard::none())
                .into_iter()
                .filter(|n| *n == view.local || !leaders.contains(n))
                .collect();
            return self.start_when_ready(desc, smon, view, &ranks);
        }

        if n_up > target && local_up && !self.peer_transitioning(path, view) {
            let excess = (n_up - target) as usize;
            let stop = self.placement.stop_order(desc, view, &up_nodes);
            if stop.iter().take(excess).any(|n| *n == view.local) {
                info!(path = %path, "{} instances up, target {}: stop", n_up, target);
                return self.act(
                    MonitorStatus::Stopping,
                    ActionRequest::new(path, "stop", MonitorStatus::StopFailed)
                        .on_success(FollowUp::status(MonitorStatus::Idle).with_local_expect(None)),
                );
            }
        }
        self.back_to_idle(path, smon, "instance count on target")
    }

    /// `idle -> ready`, then start once `ready_period` passed without a
    /// better ranked peer getting ready too.
    fn start_when_ready(
        &self,
        desc: &ServiceDescriptor,
        smon: &ServiceMonitor,
        view: &ClusterView,
        ranks: &[String],
    ) -> Outcome {
        let path = desc.path.as_str();
        if !self.parents_available(desc) {
            self.set_status(path, MonitorStatus::WaitParents);
            return Outcome::Continue;
        }
        match smon.status {
            MonitorStatus::Idle | MonitorStatus::WaitParents => {
                self.set_status(path, MonitorStatus::Ready);
                Outcome::Continue
            }
            MonitorStatus::Ready => {
                let my_rank = ranks.iter().position(|n| *n == view.local).unwrap_or(usize::MAX);
                let better_ready = view.peers().any(|(node, snap)| {
                    let rank = ranks.iter().position(|n| n == node).unwrap_or(usize::MAX);
                    rank < my_rank
                        && snap
                            .services
                            .get(path)
                            .is_some_and(|i| i.monitor.status == MonitorStatus::Ready)
                });
                if better_ready {
                    self.set_status(path, MonitorStatus::Idle);
                    return Outcome::Abort("better ranked peer is ready".into());
                }
                let waited = self.store.now() - smon.status_updated;
                if waited < self.config.ready_period().as_secs_f64() {
                    return Outcome::Continue;
                }
                if let Some(node) = &smon.stonith {
                    return self.fence(path, node);
                }
                info!(path = %path, "start");
                self.act(
                    MonitorStatus::Starting,
                    ActionRequest::new(path, "start", MonitorStatus::StartFailed).on_success(
                        FollowUp::status(MonitorStatus::Idle)
                            .with_local_expect(Some(LocalExpect::Started)),
                    ),
                )
            }
            _ => Outcome::Continue,
        }
    }

    fn back_to_idle(&self, path: &str, smon: &ServiceMonitor, reason: &str) -> Outcome {
        if matches!(smon.status, MonitorStatus::Ready | MonitorStatus::WaitParents) {
            debug!(path = %path, "back to idle: {}", reason);
            self.set_status(path, MonitorStatus::Idle);
        }
        Outcome::Continue
    }

    fn fence(&self, path: &str, node: &str) -> Outcome {
        info!(path = %path, node = %node, "stonith before takeover");
        let request = ActionRequest::stonith(path, node, self.config.stonith_timeout());
        match self.dispatcher.dispatch(&self.store, request) {
            Ok(()) => Outcome::Continue,
            Err(e) => Outcome::Fail(e),
        }
    }

    /// Restart failed resources of a started instance, then toc it once
    /// a monitored resource exhausted its restarts.
    pub(super) fn resource_orchestrator(&self, desc: &ServiceDescriptor, view: &ClusterView) -> Outcome {
        let path = desc.path.as_str();
        let smon = self.store.smon(path);
        if desc.orchestrate != OrchestrateMode::Ha
            || smon.local_expect != Some(LocalExpect::Started)
            || smon.status != MonitorStatus::Idle
        {
            return Outcome::Continue;
        }
        let Some(local) = view.local_instance(path) else {
            return Outcome::Continue;
        };
        if local.is_frozen() || view.is_node_frozen(&view.local) {
            return Outcome::Continue;
        }

        for (rid, resource) in &local.resources {
            match resource.status {
                Status::Up | Status::NotApplicable | Status::StdbyUp => {
                    if smon.restart.contains_key(rid) {
                        self.store.set_smon(path, SmonUpdate::new().reset_restart(rid.clone()));
                    }
                }
                Status::Down | Status::Warn | Status::StdbyDown => {
                    let tried = smon.restart.get(rid).copied().unwrap_or(0);
                    if tried < resource.restart {
                        info!(path = %path, "restart resource {} ({}/{})", rid, tried + 1, resource.restart);
                        self.store.set_smon(path, SmonUpdate::new().incr_restart(rid.clone()));
                        return self.act(
                            MonitorStatus::Restarting,
                            ActionRequest::new(path, "start", MonitorStatus::RestartFailed)
                                .arg("--rid")
                                .arg(rid.clone())
                                .on_error(FollowUp::status(MonitorStatus::Idle)),
                        );
                    }
                    if resource.monitor {
                        info!(path = %path, "monitored resource {} down, restarts exhausted: toc", rid);
                        return self.act(
                            MonitorStatus::Tocing,
                            ActionRequest::new(path, "toc", MonitorStatus::TocFailed)
                                .on_success(FollowUp::status(MonitorStatus::Idle).with_local_expect(None)),
                        );
                    }
                }
                Status::Undef | Status::Unknown => {}
            }
        }
        Outcome::Continue
    }

    /// A peer left the cluster: mark the failover services it was running
    /// for fencing, where this node takes over.
    pub fn on_peer_lost(&self, node: &str, last: &NodeSnapshot, view: &ClusterView) {
        for (path, instance) in &last.services {
            if !instance.avail.is_up() {
                continue;
            }
            let Some(desc) = self.registry.get(path) else {
                continue;
            };
            if !desc.stonith || desc.topology != Topology::Failover {
                continue;
            }
            let leader = self.placement.leader(&desc, view, Discard::none());
            if leader.as_deref() == Some(view.local.as_str()) {
                info!(path = %path, node = %node, "lost peer was running the service: mark for stonith");
                self.store
                    .set_smon(path, SmonUpdate::new().with_stonith(Some(node.to_string())));
            }
        }
    }
}
