//! MasterInstancesUpgrading handler.
//!
//! Masters cannot be doubled like workers. They are replaced in place, one
//! instance per loop: update the model, drain the node, reimage it.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{node_client, request_drains, reset_on_missing};
use crate::controller::{Context, Step};
use crate::crd::AzureCluster;
use crate::nodes::{node_name, node_versions, select_working_set, Replacement, WorkingSet};
use crate::state::UpgradeState;
use crate::Error;

/// Masters are replaced strictly one at a time
const MASTER_REPLACEMENT: Replacement = Replacement::InPlace { batch: 1 };

/// Working set of the master scale set, `None` if the scale set is missing
pub(super) async fn master_working_set(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Option<WorkingSet>, Error> {
    let resource_group = cluster.spec.resource_group();
    let scale_set = cluster.spec.master_scale_set();

    let instances = match ctx.scale_sets.list_instances(resource_group, &scale_set).await {
        Ok(instances) => instances,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };

    let versions = match node_client(cluster, ctx).await? {
        Some(nodes) => node_versions(&nodes.list_nodes().await?),
        None => BTreeMap::new(),
    };
    let drainers = ctx.drainers.list(&cluster.spec.cluster_id).await?;

    Ok(Some(select_working_set(
        &instances,
        &drainers,
        &cluster.spec.operator_version,
        &versions,
        &cluster.spec.master_name_prefix(),
        MASTER_REPLACEMENT,
    )))
}

/// Handle the MasterInstancesUpgrading state
pub async fn handle_master_instances_upgrading(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::MasterInstancesUpgrading);
    let resource_group = cluster.spec.resource_group();
    let scale_set = cluster.spec.master_scale_set();
    let prefix = cluster.spec.master_name_prefix();
    let cluster_id = &cluster.spec.cluster_id;

    let Some(set) = master_working_set(cluster, ctx).await? else {
        return Ok(reset_on_missing(&scale_set));
    };

    match set {
        WorkingSet::Idle => {
            info!("all master instances up to date");
            Ok(Step::to(UpgradeState::ScaleUpWorkerPool))
        }
        WorkingSet::InProgress(instances) => {
            debug!(instances = instances.len(), "master instance still provisioning");
            Ok(stay)
        }
        WorkingSet::Update(instances) => {
            let ids: Vec<String> = instances.iter().map(|i| i.instance_id.clone()).collect();
            info!(instances = ?ids, "updating master instance model");
            ctx.scale_sets
                .update_instances(resource_group, &scale_set, &ids)
                .await?;
            ctx.watchdogs
                .start(ctx.scale_sets.clone(), resource_group, &scale_set);
            Ok(stay)
        }
        WorkingSet::Drain(instances) => {
            debug!(instances = instances.len(), "waiting for master drain");
            request_drains(cluster, ctx, &prefix, &instances).await?;
            Ok(stay)
        }
        WorkingSet::Reimage(instances) => {
            let ids: Vec<String> = instances.iter().map(|i| i.instance_id.clone()).collect();
            info!(instances = ?ids, "reimaging drained master instance");
            ctx.scale_sets
                .reimage_instances(resource_group, &scale_set, &ids)
                .await?;
            for instance in &instances {
                ctx.drainers
                    .delete(cluster_id, &node_name(&prefix, instance))
                    .await?;
            }
            ctx.watchdogs
                .start(ctx.scale_sets.clone(), resource_group, &scale_set);
            Ok(stay)
        }
    }
}
