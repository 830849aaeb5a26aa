//! Orchestration policies
//!
//! One pass runs the node policy, then every local service through either
//! the manual policy (a `global_expect` is set) or the automatic one. Every
//! decision is recomputed from the cluster view handed in: nothing carries
//! over between passes except what the store holds.

mod auto;
mod manual;
mod node;

use crate::common::MonitorConfig;
use crate::monitor::actions::{ActionDispatcher, ActionRequest};
use crate::monitor::descriptor::{ServiceDescriptor, ServiceRegistry};
use crate::monitor::intent::{abort_conflict, set_smon_g_expect_from_status};
use crate::monitor::model::{MonitorStatus, NodeStatus, Outcome, Status};
use crate::monitor::placement::PlacementEngine;
use crate::monitor::scaler;
use crate::monitor::store::{ClusterView, ExpectChange, SmonUpdate, StateStore};
use crate::monitor::tasks::TaskPool;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Orchestrator {
    store: Arc<StateStore>,
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<ActionDispatcher>,
    pool: Arc<TaskPool>,
    placement: PlacementEngine,
    config: MonitorConfig,
    cluster_nodes: Vec<String>,
    rejoin_started: Mutex<Option<f64>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<ServiceRegistry>,
        dispatcher: Arc<ActionDispatcher>,
        pool: Arc<TaskPool>,
        placement: PlacementEngine,
        config: MonitorConfig,
        cluster_nodes: Vec<String>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            pool,
            placement,
            config,
            cluster_nodes,
            rejoin_started: Mutex::new(None),
        }
    }

    pub fn placement(&self) -> &PlacementEngine {
        &self.placement
    }

    /// One orchestration pass.
    pub fn orchestrate(&self, view: &ClusterView) {
        self.node_orchestrator(view);
        if self.store.nmon().status == NodeStatus::Shutting {
            return;
        }
        for path in self.store.local_paths() {
            match self.service_orchestrator(&path, view) {
                Outcome::Continue => {}
                Outcome::Abort(reason) => debug!(path = %path, "orchestration aborted: {}", reason),
                Outcome::Fail(e) => warn!(path = %path, "orchestration failed: {}", e),
            }
        }
    }

    /// Decide and act for one local service.
    pub fn service_orchestrator(&self, path: &str, view: &ClusterView) -> Outcome {
        let Some(desc) = self.registry.get(path) else {
            return Outcome::Continue;
        };
        if self.dispatcher.is_busy(path) {
            return Outcome::Continue;
        }

        let placement = self.placement.local_placement(&desc, view);
        let smon = self.store.set_smon(path, SmonUpdate::new().with_placement(placement));

        if smon.status.is_transitioning() {
            return self.check_stale_transition(&desc, smon.status, smon.status_updated);
        }

        set_smon_g_expect_from_status(&self.store, path, view);
        let smon = self.store.smon(path);

        if let Some(target) = &smon.global_expect {
            if abort_conflict(smon.status, smon.placement, target) {
                info!(path = %path, "abort global expect {}: status is {}", target, smon.status);
                self.store.set_smon(
                    path,
                    SmonUpdate::new().with_global_expect(ExpectChange::Unset),
                );
                return Outcome::Abort(format!("{} on {}", smon.status, target));
            }
        }

        if desc.is_scaler() {
            return scaler::scaler_orchestrator(self, &desc, view);
        }

        match smon.global_expect.clone() {
            Some(target) => self.service_orchestrator_manual(&desc, &smon, &target, view),
            None if self.store.nmon().status == NodeStatus::Idle => {
                let outcome = self.service_orchestrator_auto(&desc, &smon, view);
                if outcome.is_continue() {
                    self.resource_orchestrator(&desc, view)
                } else {
                    outcome
                }
            }
            None => Outcome::Continue,
        }
    }

    /// A `<verb>ing` status with no action behind it (crashed or restarted
    /// daemon) falls back to `idle` once the action timeout has passed.
    fn check_stale_transition(&self, desc: &ServiceDescriptor, status: MonitorStatus, since: f64) -> Outcome {
        if status == MonitorStatus::Scaling && self.pool.is_running(&scaler::task_key(&desc.path)) {
            return Outcome::Continue;
        }
        let age = self.store.now() - since;
        if age > self.config.action_timeout().as_secs_f64() {
            warn!(path = %desc.path, "{} for {:.0}s with no action running, reset", status, age);
            self.store
                .set_smon(&desc.path, SmonUpdate::status(MonitorStatus::Idle));
            return Outcome::Abort(format!("stale {}", status));
        }
        Outcome::Continue
    }

    /// Set `status`, then dispatch `request`.
    fn act(&self, status: MonitorStatus, request: ActionRequest) -> Outcome {
        self.store.set_smon(&request.path, SmonUpdate::status(status));
        match self.dispatcher.dispatch(&self.store, request) {
            Ok(()) => Outcome::Continue,
            Err(e) => Outcome::Fail(e),
        }
    }

    /// Move to `status` unless already there.
    fn set_status(&self, path: &str, status: MonitorStatus) {
        self.store.set_smon(path, SmonUpdate::status(status));
    }

    /// Parents are available when up, or unknown to the cluster.
    fn parents_available(&self, desc: &ServiceDescriptor) -> bool {
        desc.parents.iter().all(|parent| {
            matches!(
                self.store.agg(parent).avail,
                Status::Up | Status::NotApplicable
            )
        })
    }

    /// Does any peer run an action on `path`?
    fn peer_transitioning(&self, path: &str, view: &ClusterView) -> bool {
        view.peers().any(|(_, snap)| {
            snap.services
                .get(path)
                .is_some_and(|i| i.monitor.status.is_transitioning())
        })
    }

    fn local_node(&self) -> &str {
        self.store.nodename()
    }

    pub(crate) fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub(crate) fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub(crate) fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    pub(crate) fn config(&self) -> &MonitorConfig {
        &self.config
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Harness;
    use super::*;
    use crate::monitor::model::{GlobalExpect, Topology};

    #[test]
    fn test_abort_table_resets_global_expect() {
        let h = Harness::new("n1", &["n1"]);
        h.add_service(ServiceDescriptor::new("ns/svc/a", Topology::Failover, vec!["n1".into()]));
        h.local("ns/svc/a", Status::Down);
        h.store.set_smon(
            "ns/svc/a",
            SmonUpdate::status(MonitorStatus::StartFailed)
                .with_global_expect(ExpectChange::Set(GlobalExpect::Started)),
        );
        let view = h.store.cluster_view();
        let outcome = h.orchestrator.service_orchestrator("ns/svc/a", &view);
        assert!(matches!(outcome, Outcome::Abort(_)));
        assert!(h.store.smon("ns/svc/a").global_expect.is_none());
        assert!(h.calls().is_empty());
    }

    #[test]
    fn test_stale_transition_resets() {
        let h = Harness::new("n1", &["n1"]);
        h.add_service(ServiceDescriptor::new("ns/svc/a", Topology::Failover, vec!["n1".into()]));
        h.local("ns/svc/a", Status::Down);
        h.store
            .set_smon("ns/svc/a", SmonUpdate::status(MonitorStatus::Starting));
        h.pass();
        assert_eq!(h.store.smon("ns/svc/a").status, MonitorStatus::Starting);

        h.clock.advance(std::time::Duration::from_secs(601));
        h.pass();
        assert_eq!(h.store.smon("ns/svc/a").status, MonitorStatus::Idle);
    }
}
