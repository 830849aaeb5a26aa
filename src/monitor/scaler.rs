//! Scaler control loop
//!
//! A scaler fans out into numbered slave services until their slots add up
//! to the `scale` target. Creating and removing slaves involves long waits
//! (config consensus, intents being satisfied), so the work runs as a
//! background task keyed by the scaler path. The scaler SMON stays
//! `scaling` until the task ends.

use crate::common::{Error, MonitorConfig, Result};
use crate::monitor::descriptor::{ServiceDescriptor, ServiceRegistry};
use crate::monitor::model::{
    GlobalExpect, MonitorStatus, NodeStatus, Outcome, ServiceInstance, Status, Topology,
};
use crate::monitor::orchestrator::Orchestrator;
use crate::monitor::placement::Discard;
use crate::monitor::store::{ClusterView, ExpectChange, SmonUpdate, StateStore};
use crate::monitor::tasks::wait_until;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub fn task_key(path: &str) -> String {
    format!("scale:{}", path)
}

/// Shared handles of a scaling task.
#[derive(Clone)]
struct ScaleContext {
    scaler: String,
    store: Arc<StateStore>,
    registry: Arc<ServiceRegistry>,
    config: MonitorConfig,
}

/// Compare realized slots against the scale target and start a scaling
/// task when they differ. Only the scaler placement leader scales.
pub(crate) fn scaler_orchestrator(orch: &Orchestrator, desc: &ServiceDescriptor, view: &ClusterView) -> Outcome {
    let store = orch.store();
    let path = desc.path.as_str();
    if store.nmon().status != NodeStatus::Idle {
        return Outcome::Continue;
    }
    let smon = store.smon(path);
    if smon.global_expect.is_some() || smon.status.is_transitioning() {
        return Outcome::Continue;
    }
    let key = task_key(path);
    if orch.pool().is_running(&key) {
        return Outcome::Continue;
    }
    let driver = orch.placement().leader(desc, view, Discard::all());
    if driver.as_deref() != Some(store.nodename()) {
        return Outcome::Continue;
    }

    let target = desc.scale.unwrap_or(0);
    let slaves = orch.registry().scaler_slaves(desc);
    let current: u32 = slaves.iter().map(|(_, s)| s.slots()).sum();
    let ctx = ScaleContext {
        scaler: path.to_string(),
        store: store.clone(),
        registry: orch.registry().clone(),
        config: orch.config().clone(),
    };

    match current.cmp(&target) {
        Ordering::Equal => Outcome::Continue,
        Ordering::Less => {
            let used: BTreeSet<u32> = slaves.iter().map(|(i, _)| *i).collect();
            let new = plan_scale_up(desc, &used, target - current, orch.config().max_scaling_burst);
            info!(
                path = %path,
                "scale up: {} slots for {}, create {}",
                current,
                target,
                new.iter().map(|s| s.path.as_str()).collect::<Vec<_>>().join(",")
            );
            store.set_smon(path, SmonUpdate::status(MonitorStatus::Scaling));
            orch.pool().spawn(key, run_to_idle(ctx.clone(), scale_up(ctx, new)));
            Outcome::Continue
        }
        Ordering::Greater => {
            let excess = plan_scale_down(&slaves, current - target);
            if excess.is_empty() {
                return Outcome::Continue;
            }
            info!(
                path = %path,
                "scale down: {} slots for {}, purge {}",
                current,
                target,
                excess.join(",")
            );
            store.set_smon(path, SmonUpdate::status(MonitorStatus::Scaling));
            orch.pool().spawn(key, run_to_idle(ctx.clone(), scale_down(ctx, excess)));
            Outcome::Continue
        }
    }
}

/// Slaves to create: lowest free indices, at most `burst` of them.
fn plan_scale_up(
    desc: &ServiceDescriptor,
    used: &BTreeSet<u32>,
    mut missing: u32,
    burst: usize,
) -> Vec<ServiceDescriptor> {
    let mut new = Vec::new();
    let mut index = 0;
    while missing > 0 && new.len() < burst.max(1) {
        while used.contains(&index) {
            index += 1;
        }
        let width = match desc.topology {
            Topology::Failover => 1,
            Topology::Flex | Topology::Span => (desc.nodes.len().max(1) as u32).min(missing),
        };
        let slave = desc.slave_descriptor(index, width);
        missing = missing.saturating_sub(slave.slots().max(1));
        new.push(slave);
        index += 1;
    }
    new
}

/// Slaves to purge, highest index first, never dropping below target.
fn plan_scale_down(slaves: &[(u32, Arc<ServiceDescriptor>)], mut excess: u32) -> Vec<String> {
    let mut purge = Vec::new();
    for (_, slave) in slaves.iter().rev() {
        if excess == 0 {
            break;
        }
        let slots = slave.slots();
        if slots > excess {
            continue;
        }
        excess -= slots;
        purge.push(slave.path.clone());
    }
    purge
}

async fn run_to_idle(ctx: ScaleContext, work: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    let res = work.await;
    ctx.store
        .set_smon(&ctx.scaler, SmonUpdate::status(MonitorStatus::Idle));
    res
}

async fn scale_up(ctx: ScaleContext, slaves: Vec<ServiceDescriptor>) -> Result<()> {
    let mut tasks = JoinSet::new();
    for slave in slaves {
        tasks.spawn(create_slave(ctx.clone(), slave));
    }
    let mut failed = 0;
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(path = %ctx.scaler, "slave creation: {}", e);
                failed += 1;
            }
            Err(e) => {
                warn!(path = %ctx.scaler, "slave creation task: {}", e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(Error::Other(format!("{} slave creations failed", failed)));
    }
    Ok(())
}

async fn create_slave(ctx: ScaleContext, slave: ServiceDescriptor) -> Result<()> {
    let path = slave.path.clone();
    let now = ctx.store.now();
    ctx.registry.insert(slave.clone(), now)?;
    ctx.store.put_local_instance(
        &path,
        ServiceInstance {
            avail: Status::Down,
            overall: Status::Down,
            // created frozen, thawed once every node has the config
            frozen: now,
            topology: slave.topology,
            scaler_slave: true,
            flex_min: slave.flex_min(),
            flex_max: slave.flex_max(),
            flex_target: slave.flex_target(),
            updated: now,
            ..Default::default()
        },
    );
    ctx.store.set_local_config(ctx.registry.config_refs());
    ctx.store.notify_changed();
    info!(path = %path, "scaler slave created");

    wait_config_consensus(&ctx, &slave).await?;
    set_expect_and_wait(&ctx, &path, GlobalExpect::Thawed).await?;
    set_expect_and_wait(&ctx, &path, GlobalExpect::Provisioned).await
}

/// Every reachable node allowed to run `slave` advertises our checksum.
async fn wait_config_consensus(ctx: &ScaleContext, slave: &ServiceDescriptor) -> Result<()> {
    let csum = ctx
        .registry
        .config_ref(&slave.path)
        .map(|c| c.csum)
        .ok_or_else(|| Error::UnknownService(slave.path.clone()))?;
    let interval = ctx.config.config_consensus_interval();
    let timeout = interval * ctx.config.config_consensus_retries;
    let local = ctx.store.nodename().to_string();
    wait_until("config consensus", timeout, interval, || {
        let view = ctx.store.cluster_view();
        slave
            .nodes
            .iter()
            .filter(|n| **n != local)
            .filter_map(|n| view.node(n))
            .all(|snap| snap.config.get(&slave.path).is_some_and(|c| c.csum == csum))
    })
    .await
    .map_err(|_| {
        warn!(path = %slave.path, "config consensus not reached, give up");
        Error::ConsensusTimeout
    })
}

/// Declare `target` on `path` and wait for it to be satisfied and cleared.
async fn set_expect_and_wait(ctx: &ScaleContext, path: &str, target: GlobalExpect) -> Result<()> {
    info!(path = %path, "set global expect {}", target);
    ctx.store.set_smon(
        path,
        SmonUpdate::new().with_global_expect(ExpectChange::Set(target.clone())),
    );
    wait_until(
        &format!("{} {}", path, target),
        ctx.config.expect_wait_timeout(),
        ctx.config.poll_interval(),
        || ctx.store.smon(path).global_expect.is_none(),
    )
    .await
}

async fn scale_down(ctx: ScaleContext, paths: Vec<String>) -> Result<()> {
    for path in &paths {
        info!(path = %path, "set global expect purged");
        ctx.store.set_smon(
            path,
            SmonUpdate::new().with_global_expect(ExpectChange::Set(GlobalExpect::Purged)),
        );
    }
    for path in &paths {
        wait_until(
            &format!("{} departure", path),
            ctx.config.expect_wait_timeout(),
            ctx.config.poll_interval(),
            || ctx.store.cluster_view().instances(path).is_empty(),
        )
        .await?;
        ctx.registry.remove(path);
        info!(path = %path, "scaler slave gone");
    }
    ctx.store.set_local_config(ctx.registry.config_refs());
    Ok(())
}
