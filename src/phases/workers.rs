//! Worker pool replacement handlers.
//!
//! Workers are replaced in bulk: the pool is doubled so every old node has a
//! new counterpart, old nodes are cordoned and drained, then deleted, and the
//! pool is shrunk back to its desired size.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info};

use super::{node_client, request_drains, reset_on_missing, worker_instances};
use crate::controller::{Context, Step};
use crate::crd::{AzureCluster, DrainerConfig};
use crate::nodes::{
    is_node_ready, is_unschedulable, is_worker, node_name, select_working_set, Classification,
    Replacement, WorkingSet,
};
use crate::scale::{all_instances_succeeded, scale, VmssInstance};
use crate::state::UpgradeState;
use crate::Error;

/// Working set of the worker pool.
///
/// Every old instance already has a replacement, so the whole old set moves
/// through cordon and drain together.
fn worker_working_set(
    cluster: &AzureCluster,
    instances: &[VmssInstance],
    drainers: &[DrainerConfig],
) -> WorkingSet {
    select_working_set(
        instances,
        drainers,
        &cluster.spec.operator_version,
        &BTreeMap::new(),
        &cluster.spec.worker_name_prefix(),
        Replacement::Surge {
            batch: instances.len(),
        },
    )
}

/// Handle the ScaleUpWorkerPool state.
///
/// Grows the pool toward twice the desired count, one strategy step per loop
/// and only while every instance is healthy.
pub async fn handle_scale_up(cluster: &AzureCluster, ctx: &Context) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::ScaleUpWorkerPool);
    let resource_group = cluster.spec.resource_group();
    let scale_set = cluster.spec.worker_scale_set();
    let target = cluster.spec.workers.count.saturating_mul(2);

    let instances = match worker_instances(cluster, ctx).await? {
        Ok(instances) => instances,
        Err(reset) => return Ok(reset),
    };
    if !all_instances_succeeded(&instances) {
        debug!("waiting for worker instances to finish provisioning");
        return Ok(stay);
    }

    let current = match ctx.scale_sets.get_capacity(resource_group, &scale_set).await {
        Ok(capacity) => capacity,
        Err(e) if e.is_not_found() => return Ok(reset_on_missing(&scale_set)),
        Err(e) => return Err(e),
    };
    if current < target {
        scale(
            ctx.scale_sets.as_ref(),
            ctx.config.scale_strategy,
            resource_group,
            &scale_set,
            target,
        )
        .await?;
        return Ok(stay);
    }

    info!(capacity = current, "worker pool scaled up");
    Ok(Step::to(UpgradeState::CordonOldWorkers))
}

/// Handle the CordonOldWorkers state.
///
/// Waits until at least as many new nodes as old nodes have registered, then
/// cordons every old node.
pub async fn handle_cordon(cluster: &AzureCluster, ctx: &Context) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::CordonOldWorkers);
    let prefix = cluster.spec.worker_name_prefix();

    let Some(nodes_api) = node_client(cluster, ctx).await? else {
        return Ok(stay);
    };
    let instances = match worker_instances(cluster, ctx).await? {
        Ok(instances) => instances,
        Err(reset) => return Ok(reset),
    };
    let old = match worker_working_set(cluster, &instances, &[]) {
        WorkingSet::InProgress(busy) => {
            debug!(instances = busy.len(), "waiting for worker instances to settle");
            return Ok(stay);
        }
        set => set.instances().to_vec(),
    };
    let nodes = nodes_api.list_nodes().await?;

    let (old_nodes, new_nodes) = Classification::of(&instances).registered_counts(&prefix, &nodes);
    if new_nodes < old_nodes {
        debug!(old_nodes, new_nodes, "waiting for new worker nodes to register");
        return Ok(stay);
    }

    let by_name: HashMap<String, &Node> = nodes
        .iter()
        .filter_map(|n| n.metadata.name.clone().map(|name| (name, n)))
        .collect();

    let mut cordoned = 0usize;
    for name in old.iter().map(|i| node_name(&prefix, i)) {
        let Some(node) = by_name.get(&name) else {
            debug!(node = %name, "old node not registered, skipping");
            continue;
        };
        if is_unschedulable(node) {
            continue;
        }
        match nodes_api.cordon(&name).await {
            Ok(()) => {
                info!(node = %name, "cordoned old worker");
                cordoned += 1;
            }
            Err(e) if e.is_not_found() => {
                debug!(node = %name, "node disappeared before cordon");
            }
            Err(e) => return Err(e),
        }
    }

    info!(cordoned, old = old.len(), "old workers cordoned");
    Ok(Step::to(UpgradeState::WaitForWorkersReady))
}

/// Handle the WaitForWorkersReady state
pub async fn handle_wait_for_workers_ready(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::WaitForWorkersReady);

    let Some(nodes_api) = node_client(cluster, ctx).await? else {
        return Ok(stay);
    };
    let nodes = nodes_api.list_nodes().await?;
    let workers: Vec<_> = nodes.iter().filter(|n| is_worker(n)).collect();
    let not_ready = workers.iter().filter(|n| !is_node_ready(n)).count();

    if not_ready > 0 {
        debug!(not_ready, total = workers.len(), "waiting for worker nodes to be ready");
        return Ok(stay);
    }

    info!(workers = workers.len(), "all worker nodes ready");
    Ok(Step::to(UpgradeState::DrainOldWorkerNodes))
}

/// Handle the DrainOldWorkerNodes state.
///
/// Keeps one DrainerConfig per old node, recreating timed out ones, until
/// every old node reports drained.
pub async fn handle_drain(cluster: &AzureCluster, ctx: &Context) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::DrainOldWorkerNodes);
    let cluster_id = &cluster.spec.cluster_id;

    let instances = match worker_instances(cluster, ctx).await? {
        Ok(instances) => instances,
        Err(reset) => return Ok(reset),
    };
    let drainers = ctx.drainers.list(cluster_id).await?;

    match worker_working_set(cluster, &instances, &drainers) {
        WorkingSet::InProgress(busy) | WorkingSet::Update(busy) => {
            debug!(instances = busy.len(), "waiting for worker instances to settle");
            Ok(stay)
        }
        WorkingSet::Drain(pending) => {
            request_drains(cluster, ctx, &cluster.spec.worker_name_prefix(), &pending).await?;
            debug!(pending = pending.len(), "waiting for old worker nodes to drain");
            Ok(stay)
        }
        set @ (WorkingSet::Reimage(_) | WorkingSet::Idle) => {
            for dc in &drainers {
                ctx.drainers.delete(cluster_id, &dc.spec.node_name).await?;
            }
            info!(drained = set.instances().len(), "old worker nodes drained");
            Ok(Step::to(UpgradeState::TerminateOldWorkerInstances))
        }
    }
}

/// Handle the TerminateOldWorkerInstances state.
///
/// The old set is derived again from live instances; anything computed in an
/// earlier loop may be stale.
pub async fn handle_terminate(cluster: &AzureCluster, ctx: &Context) -> Result<Step, Error> {
    let resource_group = cluster.spec.resource_group();
    let scale_set = cluster.spec.worker_scale_set();

    ctx.watchdogs.cancel(resource_group, &scale_set);

    let instances = match worker_instances(cluster, ctx).await? {
        Ok(instances) => instances,
        Err(reset) => return Ok(reset),
    };
    let old = Classification::of(&instances).old_instance_ids();

    if !old.is_empty() {
        match ctx
            .scale_sets
            .delete_instances(resource_group, &scale_set, &old)
            .await
        {
            Ok(()) => info!(instances = ?old, "deleted old worker instances"),
            Err(e) if e.is_not_found() => return Ok(reset_on_missing(&scale_set)),
            Err(e) => return Err(e),
        }
    }

    Ok(Step::to(UpgradeState::ScaleDownWorkerPool))
}

/// Handle the ScaleDownWorkerPool state
pub async fn handle_scale_down(cluster: &AzureCluster, ctx: &Context) -> Result<Step, Error> {
    let scale_set = cluster.spec.worker_scale_set();
    let target = cluster.spec.workers.count;

    let applied = match scale(
        ctx.scale_sets.as_ref(),
        ctx.config.scale_strategy,
        cluster.spec.resource_group(),
        &scale_set,
        target,
    )
    .await
    {
        Ok(applied) => applied,
        Err(e) if e.is_not_found() => return Ok(reset_on_missing(&scale_set)),
        Err(e) => return Err(e),
    };

    if applied != target {
        return Ok(Step::to(UpgradeState::ScaleDownWorkerPool));
    }

    info!(capacity = target, "worker pool back at desired size");
    Ok(Step::to(UpgradeState::DeploymentCompleted))
}
