//! Placement: candidate filtering and deterministic node ranking
//!
//! Every node computes the same ranking from the same cluster view: all
//! orderings are total, with the node name as the final tiebreak. The first
//! ranked candidate is the placement leader of a failover service; the first
//! `flex_target` candidates lead a flex service.

use crate::common::{hrw_hash, NodeConfig};
use crate::monitor::descriptor::{PlacementPolicy, ServiceDescriptor};
use crate::monitor::model::{NodeStats, Placement, Status, Topology};
use crate::monitor::store::ClusterView;
use std::cmp::Ordering;

/// Filters to skip when computing candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discard {
    pub frozen: bool,
    pub unprovisioned: bool,
    pub overloaded: bool,
}

impl Discard {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            frozen: true,
            unprovisioned: true,
            overloaded: true,
        }
    }
}

/// Placement decisions for services.
#[derive(Debug, Clone)]
pub struct PlacementEngine {
    min_avail_mem_pct: f64,
    min_avail_swap_pct: f64,
}

impl Default for PlacementEngine {
    fn default() -> Self {
        Self::new(2.0, 2.0)
    }
}

impl PlacementEngine {
    pub fn new(min_avail_mem_pct: f64, min_avail_swap_pct: f64) -> Self {
        Self {
            min_avail_mem_pct,
            min_avail_swap_pct,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.min_avail_mem_pct, config.min_avail_swap_pct)
    }

    /// A node under its memory or swap thresholds should not take new work.
    pub fn is_overloaded(&self, stats: &NodeStats) -> bool {
        stats.mem_avail_pct < self.min_avail_mem_pct || stats.swap_avail_pct < self.min_avail_swap_pct
    }

    fn node_overloaded(&self, view: &ClusterView, node: &str) -> bool {
        view.node(node).is_some_and(|n| self.is_overloaded(&n.stats))
    }

    /// Nodes allowed to run `svc`, in no particular order.
    pub fn candidates(&self, svc: &ServiceDescriptor, view: &ClusterView, discard: Discard) -> Vec<String> {
        let mut candidates: Vec<String> = view
            .nodes
            .iter()
            .filter(|(name, _)| svc.nodes.iter().any(|n| n == *name))
            .filter_map(|(name, snap)| snap.services.get(&svc.path).map(|inst| (name, snap, inst)))
            .filter(|(_, snap, inst)| discard.frozen || !(inst.is_frozen() || snap.is_frozen()))
            .filter(|(_, _, inst)| discard.unprovisioned || inst.is_provisioned())
            .filter(|(_, snap, _)| discard.overloaded || !self.is_overloaded(&snap.stats))
            .map(|(name, _, _)| name.clone())
            .filter(|name| {
                svc.hard_affinity.iter().all(|p| runs_on(view, name, p))
                    && !svc.hard_anti_affinity.iter().any(|p| runs_on(view, name, p))
            })
            .collect();

        if !svc.soft_affinity.is_empty() {
            apply_soft(&mut candidates, |name| {
                svc.soft_affinity.iter().all(|p| runs_on(view, name, p))
            });
        }
        if !svc.soft_anti_affinity.is_empty() {
            apply_soft(&mut candidates, |name| {
                !svc.soft_anti_affinity.iter().any(|p| runs_on(view, name, p))
            });
        }
        candidates
    }

    /// Total order over `candidates`, best first.
    pub fn ranks(&self, svc: &ServiceDescriptor, view: &ClusterView, candidates: &[String]) -> Vec<String> {
        let mut ranked: Vec<String> = candidates.to_vec();
        ranked.sort();
        ranked.dedup();
        match svc.placement {
            PlacementPolicy::NodesOrder => {
                let position = |node: &String| {
                    svc.nodes
                        .iter()
                        .position(|n| n == node)
                        .unwrap_or(usize::MAX)
                };
                ranked.sort_by(|a, b| position(a).cmp(&position(b)).then_with(|| a.cmp(b)));
            }
            PlacementPolicy::LoadAvg => {
                let load = |node: &String| view.node(node).map_or(f64::MAX, |n| n.stats.load_15m);
                ranked.sort_by(|a, b| load(a).total_cmp(&load(b)).then_with(|| a.cmp(b)));
            }
            PlacementPolicy::Score => {
                let score = |node: &String| view.node(node).map_or(0, |n| n.stats.score);
                ranked.sort_by(|a, b| score(b).cmp(&score(a)).then_with(|| a.cmp(b)));
            }
            PlacementPolicy::Spread => ranked = hrw_hash(&svc.path, &ranked),
            PlacementPolicy::None => {}
        }
        ranked
    }

    /// Ranked candidates, default filters applied.
    pub fn ranked_candidates(&self, svc: &ServiceDescriptor, view: &ClusterView, discard: Discard) -> Vec<String> {
        let candidates = self.candidates(svc, view, discard);
        self.ranks(svc, view, &candidates)
    }

    /// First ranked candidate.
    pub fn leader(&self, svc: &ServiceDescriptor, view: &ClusterView, discard: Discard) -> Option<String> {
        self.ranked_candidates(svc, view, discard).into_iter().next()
    }

    /// Nodes elected to run the service: one for failover, the first
    /// `flex_target` for flex and span.
    pub fn leaders(&self, svc: &ServiceDescriptor, view: &ClusterView, discard: Discard) -> Vec<String> {
        let width = match svc.topology {
            Topology::Failover => 1,
            Topology::Flex | Topology::Span => svc.flex_target() as usize,
        };
        let mut ranked = self.ranked_candidates(svc, view, discard);
        ranked.truncate(width);
        ranked
    }

    /// Placement role of the local instance.
    pub fn local_placement(&self, svc: &ServiceDescriptor, view: &ClusterView) -> Placement {
        if view.local_instance(&svc.path).is_none() {
            return Placement::None;
        }
        if self.leaders(svc, view, Discard::none()).contains(&view.local) {
            Placement::Leader
        } else {
            Placement::NonLeader
        }
    }

    /// Order in which running instances should stop to shrink a flex
    /// service: overloaded nodes first, then worst ranked first.
    pub fn stop_order(&self, svc: &ServiceDescriptor, view: &ClusterView, up_nodes: &[String]) -> Vec<String> {
        let ranked = self.ranks(svc, view, up_nodes);
        let mut order: Vec<(usize, String)> = ranked.into_iter().enumerate().collect();
        order.sort_by(|(ia, a), (ib, b)| {
            let oa = self.node_overloaded(view, a);
            let ob = self.node_overloaded(view, b);
            match (oa, ob) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => ib.cmp(ia),
            }
        });
        order.into_iter().map(|(_, n)| n).collect()
    }
}

/// Does `node` run an `up` instance of `path`?
fn runs_on(view: &ClusterView, node: &str, path: &str) -> bool {
    view.instance(node, path).is_some_and(|i| i.avail == Status::Up)
}

/// Keep the matching candidates, unless none would remain.
fn apply_soft(candidates: &mut Vec<String>, keep: impl Fn(&str) -> bool) {
    let kept: Vec<String> = candidates.iter().filter(|n| keep(n)).cloned().collect();
    if !kept.is_empty() {
        *candidates = kept;
    }
}
