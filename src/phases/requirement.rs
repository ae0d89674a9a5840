//! UpgradeRequirementCheck handler.

use tracing::{debug, info};

use crate::controller::{Context, Step};
use crate::crd::AzureCluster;
use crate::state::UpgradeState;
use crate::Error;

use super::masters::master_working_set;
use super::reset_on_missing;

/// Decide whether the provisioned deployment needs node replacement.
///
/// A cluster that is still being created, or whose worker pool is being
/// scaled, gets its nodes from the deployment itself. Otherwise masters are
/// replaced first if they drifted, then workers.
pub async fn handle_upgrade_requirement_check(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Step, Error> {
    if cluster.conditions().is_empty() || cluster.is_creating() {
        info!("cluster is being created, skipping node replacement");
        return Ok(Step::to(UpgradeState::DeploymentCompleted));
    }

    let scale_set = cluster.spec.worker_scale_set();
    let capacity = match ctx
        .scale_sets
        .get_capacity(cluster.spec.resource_group(), &scale_set)
        .await
    {
        Ok(capacity) => capacity,
        Err(e) if e.is_not_found() => return Ok(reset_on_missing(&scale_set)),
        Err(e) => return Err(e),
    };
    if capacity != cluster.spec.workers.count {
        info!(
            capacity,
            desired = cluster.spec.workers.count,
            "worker pool is scaling, skipping node replacement"
        );
        return Ok(Step::to(UpgradeState::DeploymentCompleted));
    }

    let Some(masters) = master_working_set(cluster, ctx).await? else {
        return Ok(reset_on_missing(&cluster.spec.master_scale_set()));
    };
    if !masters.instances().is_empty() {
        info!("master instances drifted");
        return Ok(Step::to(UpgradeState::MasterInstancesUpgrading));
    }

    debug!("masters up to date");
    Ok(Step::to(UpgradeState::ScaleUpWorkerPool))
}
