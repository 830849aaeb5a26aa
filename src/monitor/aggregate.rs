//! Cluster-wide derived service status
//!
//! Pure functions over the set of instances of one service path. Nothing here
//! touches the store: the monitor loop feeds a [`ClusterView`] in and stores
//! the resulting map for the duration of one pass.

use crate::monitor::descriptor::{ServiceDescriptor, ServiceRegistry};
use crate::monitor::model::{
    AggregatedServiceStatus, FrozenState, Placement, PlacementQuality, Provisioned,
    ServiceInstance, Status, Topology,
};
use crate::monitor::store::ClusterView;
use std::collections::{BTreeMap, BTreeSet};

/// Slave nesting deeper than this is ignored when folding.
const MAX_COMPOSITE_DEPTH: usize = 8;

/// Failover availability: exactly one instance may run.
pub fn failover_avail(instances: &[&ServiceInstance]) -> Status {
    if instances.is_empty() {
        return Status::NotApplicable;
    }
    if instances.iter().all(|i| i.avail == Status::NotApplicable) {
        return Status::NotApplicable;
    }
    let n_up = instances.iter().filter(|i| i.avail.is_up()).count();
    match n_up {
        1 => Status::Up,
        // more than one up: split-brain symptom, never auto-resolved
        n if n > 1 => Status::Warn,
        _ if instances.iter().any(|i| i.avail == Status::Warn) => Status::Warn,
        _ => Status::Down,
    }
}

/// Flex availability: between `flex_min` and `flex_max` instances may run.
pub fn flex_avail(
    instances: &[&ServiceInstance],
    flex_min: u32,
    flex_max: u32,
    scaler_slave: bool,
) -> Status {
    if instances.is_empty() || instances.iter().all(|i| i.avail == Status::NotApplicable) {
        return Status::NotApplicable;
    }
    let n_up = instances.iter().filter(|i| i.avail.is_up()).count() as u32;
    if n_up == 0 {
        if instances.iter().any(|i| i.avail == Status::Warn) {
            return Status::Warn;
        }
        return Status::Down;
    }
    if n_up > flex_max {
        return Status::Warn;
    }
    if n_up < flex_min && !scaler_slave {
        return Status::Warn;
    }
    Status::Up
}

/// Overall status folded over the instances.
pub fn overall(instances: &[&ServiceInstance]) -> Status {
    let mut states: BTreeSet<Status> = instances.iter().map(|i| i.overall).collect();
    if states.is_empty() {
        return Status::NotApplicable;
    }
    if states.len() > 1 {
        states.remove(&Status::NotApplicable);
    }
    if states.contains(&Status::Warn) || states.contains(&Status::StdbyDown) {
        return Status::Warn;
    }

    let folded = if states.len() == 1 {
        states.iter().next().copied().unwrap_or(Status::NotApplicable)
    } else {
        fold_mixed_overall(&states)
    };

    match folded {
        Status::StdbyUp | Status::StdbyDown => Status::Down,
        other => other,
    }
}

/// Acceptable mixed transitional states.
fn fold_mixed_overall(states: &BTreeSet<Status>) -> Status {
    use Status::{Down, StdbyUp, Up};
    const TO_UP: &[&[Status]] = &[&[Up, Down], &[Up, StdbyUp], &[Up, Down, StdbyUp]];
    const TO_DOWN: &[&[Status]] = &[&[Down, StdbyUp]];

    let matches = |table: &[&[Status]]| {
        table
            .iter()
            .any(|row| row.len() == states.len() && row.iter().all(|s| states.contains(s)))
    };
    if matches(TO_UP) {
        Up
    } else if matches(TO_DOWN) {
        Down
    } else {
        Status::Warn
    }
}

/// Are the running instances on the nodes the placement elected?
pub fn placement_quality(instances: &[&ServiceInstance]) -> PlacementQuality {
    let live = instances.iter().filter(|i| !i.is_frozen()).count();
    if live < 2 {
        return PlacementQuality::Optimal;
    }
    let mut has_up = false;
    let mut optimal = true;
    for instance in instances {
        let leader = instance.monitor.placement == Placement::Leader;
        if matches!(instance.avail, Status::Up | Status::Warn) {
            has_up = true;
            if !leader {
                optimal = false;
            }
        } else if leader && instance.is_frozen() {
            optimal = false;
        }
    }
    if !has_up {
        return PlacementQuality::NotApplicable;
    }
    if optimal {
        PlacementQuality::Optimal
    } else {
        PlacementQuality::NonOptimal
    }
}

pub fn provisioned(instances: &[&ServiceInstance]) -> Provisioned {
    Provisioned::fold(instances.iter().map(|i| i.provisioned()))
}

pub fn frozen(instances: &[&ServiceInstance]) -> FrozenState {
    if instances.is_empty() {
        return FrozenState::NotApplicable;
    }
    let n_frozen = instances.iter().filter(|i| i.is_frozen()).count();
    if n_frozen == instances.len() {
        FrozenState::Frozen
    } else if n_frozen == 0 {
        FrozenState::Thawed
    } else {
        FrozenState::Mixed
    }
}

/// Single distinct value wins, anything else is `warn`.
pub fn fold_statuses<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
    let distinct: BTreeSet<Status> = statuses.into_iter().collect();
    match distinct.len() {
        0 => Status::NotApplicable,
        1 => distinct.into_iter().next().unwrap_or(Status::NotApplicable),
        _ => Status::Warn,
    }
}

/// Aggregate one path from its own instances only.
pub fn aggregate_instances(
    descriptor: Option<&ServiceDescriptor>,
    instances: &[&ServiceInstance],
) -> AggregatedServiceStatus {
    let topology = descriptor
        .map(|d| d.topology)
        .or_else(|| instances.first().map(|i| i.topology))
        .unwrap_or_default();

    let avail = match topology {
        Topology::Failover => failover_avail(instances),
        Topology::Flex | Topology::Span => {
            let (flex_min, flex_max, scaler_slave) = match descriptor {
                Some(d) => (d.flex_min(), d.flex_max(), d.scaler_slave),
                None => instances
                    .first()
                    .map(|i| (i.flex_min, i.flex_max, i.scaler_slave))
                    .unwrap_or((1, 1, false)),
            };
            flex_avail(instances, flex_min, flex_max, scaler_slave)
        }
    };

    AggregatedServiceStatus {
        avail,
        overall: overall(instances),
        frozen: frozen(instances),
        placement: placement_quality(instances),
        provisioned: provisioned(instances),
    }
}

/// Aggregate every path known locally or seen on any node, folding slave
/// aggregates into their scaler / master services.
pub fn aggregate_all(
    registry: &ServiceRegistry,
    view: &ClusterView,
) -> BTreeMap<String, AggregatedServiceStatus> {
    let mut paths = view.paths();
    paths.extend(registry.paths());

    let base: BTreeMap<String, AggregatedServiceStatus> = paths
        .iter()
        .map(|path| {
            let instances: Vec<&ServiceInstance> = view.instances(path).into_values().collect();
            let descriptor = registry.get(path);
            (path.clone(), aggregate_instances(descriptor.as_deref(), &instances))
        })
        .collect();

    paths
        .iter()
        .map(|path| {
            let mut visiting = BTreeSet::new();
            let agg = composite(path, registry, &paths, &base, &mut visiting, 0);
            (path.clone(), agg)
        })
        .collect()
}

/// Paths whose status folds into `descriptor`'s
pub fn slave_paths(descriptor: &ServiceDescriptor, known: &BTreeSet<String>) -> Vec<String> {
    let mut slaves: Vec<String> = descriptor.slaves.clone();
    if descriptor.is_scaler() {
        slaves.extend(
            known
                .iter()
                .filter(|p| descriptor.slave_index(p).is_some())
                .cloned(),
        );
    }
    slaves
}

fn composite(
    path: &str,
    registry: &ServiceRegistry,
    known: &BTreeSet<String>,
    base: &BTreeMap<String, AggregatedServiceStatus>,
    visiting: &mut BTreeSet<String>,
    depth: usize,
) -> AggregatedServiceStatus {
    let mut agg = base.get(path).cloned().unwrap_or_default();
    let Some(descriptor) = registry.get(path) else {
        return agg;
    };
    let slaves = slave_paths(&descriptor, known);
    if slaves.is_empty() || depth >= MAX_COMPOSITE_DEPTH || !visiting.insert(path.to_string()) {
        return agg;
    }

    let children: Vec<AggregatedServiceStatus> = slaves
        .iter()
        .map(|slave| composite(slave, registry, known, base, visiting, depth + 1))
        .collect();
    visiting.remove(path);

    // a scaler has no instance of its own worth counting
    let own = !descriptor.is_scaler();
    let own_avail = own.then_some(agg.avail);
    let own_overall = own.then_some(agg.overall);
    agg.avail = fold_statuses(own_avail.into_iter().chain(children.iter().map(|c| c.avail)));
    agg.overall = fold_statuses(own_overall.into_iter().chain(children.iter().map(|c| c.overall)));
    agg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::model::ResourceStatus;

    fn inst(avail: Status) -> ServiceInstance {
        ServiceInstance {
            avail,
            overall: avail,
            ..Default::default()
        }
    }

    fn refs(instances: &[ServiceInstance]) -> Vec<&ServiceInstance> {
        instances.iter().collect()
    }

    #[test]
    fn test_failover_avail() {
        assert_eq!(failover_avail(&[]), Status::NotApplicable);
        let one_up = [inst(Status::Up), inst(Status::Down)];
        assert_eq!(failover_avail(&refs(&one_up)), Status::Up);
        let two_up = [inst(Status::Up), inst(Status::Up), inst(Status::Down)];
        assert_eq!(failover_avail(&refs(&two_up)), Status::Warn);
        let all_na = [inst(Status::NotApplicable), inst(Status::NotApplicable)];
        assert_eq!(failover_avail(&refs(&all_na)), Status::NotApplicable);
        let warn = [inst(Status::Warn), inst(Status::Down)];
        assert_eq!(failover_avail(&refs(&warn)), Status::Warn);
        let down = [inst(Status::Down), inst(Status::StdbyUp)];
        assert_eq!(failover_avail(&refs(&down)), Status::Down);
    }

    #[test]
    fn test_failover_avail_one_up_among_many() {
        for n_down in 0..5 {
            let mut set = vec![inst(Status::Up)];
            set.extend((0..n_down).map(|_| inst(Status::Down)));
            assert_eq!(failover_avail(&refs(&set)), Status::Up);
            set.push(inst(Status::Up));
            assert_eq!(failover_avail(&refs(&set)), Status::Warn);
        }
    }

    #[test]
    fn test_flex_avail() {
        let set = [inst(Status::Up), inst(Status::Down), inst(Status::Down)];
        assert_eq!(flex_avail(&refs(&set), 1, 3, false), Status::Up);
        assert_eq!(flex_avail(&refs(&set), 2, 3, false), Status::Warn);
        assert_eq!(flex_avail(&refs(&set), 2, 3, true), Status::Up);

        let over = [inst(Status::Up), inst(Status::Up), inst(Status::Up)];
        assert_eq!(flex_avail(&refs(&over), 1, 2, false), Status::Warn);

        let none_up = [inst(Status::Down), inst(Status::Warn)];
        assert_eq!(flex_avail(&refs(&none_up), 1, 2, false), Status::Warn);
        let all_down = [inst(Status::Down), inst(Status::Down)];
        assert_eq!(flex_avail(&refs(&all_down), 1, 2, false), Status::Down);
    }

    #[test]
    fn test_overall() {
        assert_eq!(overall(&[]), Status::NotApplicable);
        let mixed = [inst(Status::Up), inst(Status::Down)];
        assert_eq!(overall(&refs(&mixed)), Status::Up);
        let stdby = [inst(Status::Down), inst(Status::StdbyUp)];
        assert_eq!(overall(&refs(&stdby)), Status::Down);
        let stdby_down = [inst(Status::Up), inst(Status::StdbyDown)];
        assert_eq!(overall(&refs(&stdby_down)), Status::Warn);
        let uniform = [inst(Status::StdbyUp), inst(Status::StdbyUp)];
        assert_eq!(overall(&refs(&uniform)), Status::Down);
        let with_na = [inst(Status::Up), inst(Status::NotApplicable)];
        assert_eq!(overall(&refs(&with_na)), Status::Up);
        let odd = [inst(Status::Up), inst(Status::Undef)];
        assert_eq!(overall(&refs(&odd)), Status::Warn);
    }

    #[test]
    fn test_placement_quality() {
        let mut leader_up = inst(Status::Up);
        leader_up.monitor.placement = Placement::Leader;
        let follower_down = inst(Status::Down);
        assert_eq!(
            placement_quality(&[&leader_up, &follower_down]),
            PlacementQuality::Optimal
        );

        let follower_up = inst(Status::Up);
        let mut leader_down = inst(Status::Down);
        leader_down.monitor.placement = Placement::Leader;
        assert_eq!(
            placement_quality(&[&leader_down, &follower_up]),
            PlacementQuality::NonOptimal
        );

        assert_eq!(
            placement_quality(&[&leader_down, &follower_down]),
            PlacementQuality::NotApplicable
        );

        let mut frozen = inst(Status::Up);
        frozen.frozen = 1.0;
        assert_eq!(
            placement_quality(&[&frozen, &follower_down]),
            PlacementQuality::Optimal
        );
    }

    #[test]
    fn test_provisioned_and_frozen() {
        let mut yes = inst(Status::Up);
        yes.resources.insert(
            "disk#1".into(),
            ResourceStatus {
                provisioned: Some(true),
                ..Default::default()
            },
        );
        let mut no = inst(Status::Down);
        no.resources.insert(
            "disk#1".into(),
            ResourceStatus {
                provisioned: Some(false),
                ..Default::default()
            },
        );
        let blank = inst(Status::Down);
        assert_eq!(provisioned(&[&yes, &blank]), Provisioned::True);
        assert_eq!(provisioned(&[&no]), Provisioned::False);
        assert_eq!(provisioned(&[&yes, &no]), Provisioned::Mixed);
        assert_eq!(provisioned(&[&blank]), Provisioned::NotApplicable);

        let mut ice = inst(Status::Down);
        ice.frozen = 10.0;
        assert_eq!(frozen(&[&ice]), FrozenState::Frozen);
        assert_eq!(frozen(&[&ice, &blank]), FrozenState::Mixed);
        assert_eq!(frozen(&[&blank]), FrozenState::Thawed);
        assert_eq!(frozen(&[]), FrozenState::NotApplicable);
    }

    #[test]
    fn test_scaler_folds_slaves() {
        let registry = ServiceRegistry::new();
        let mut scaler = ServiceDescriptor::new(
            "ns/svc/web",
            Topology::Flex,
            vec!["n1".into(), "n2".into()],
        );
        scaler.scale = Some(2);
        registry.insert(scaler.clone(), 0.0).unwrap();
        registry.insert(scaler.slave_descriptor(0, 1), 0.0).unwrap();
        registry.insert(scaler.slave_descriptor(1, 1), 0.0).unwrap();

        let mut view = ClusterView {
            local: "n1".into(),
            ..Default::default()
        };
        let n1 = view.nodes.entry("n1".into()).or_default();
        n1.services.insert("ns/svc/0.web".into(), inst(Status::Up));
        n1.services.insert("ns/svc/1.web".into(), inst(Status::Up));

        let aggs = aggregate_all(&registry, &view);
        assert_eq!(aggs["ns/svc/web"].avail, Status::Up);

        view.nodes
            .get_mut("n1")
            .unwrap()
            .services
            .insert("ns/svc/1.web".into(), inst(Status::Down));
        let aggs = aggregate_all(&registry, &view);
        assert_eq!(aggs["ns/svc/web"].avail, Status::Warn);
        assert_eq!(aggs["ns/svc/1.web"].avail, Status::Down);
    }
}
