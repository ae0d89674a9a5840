//! Deployment handlers: submission, provisioning and drift detection.

use tracing::{debug, info, warn};

use super::{desired, submit};
use crate::controller::{Context, Step};
use crate::crd::{AzureCluster, UpgradeStatus};
use crate::deployment::{DesiredDeployment, ProvisioningState, WORKER_DEPLOYMENT_NAME};
use crate::state::UpgradeState;
use crate::Error;

/// Handle the Uninitialized state.
///
/// - No deployment yet, or the last one failed: submit and wait for it
/// - Checksums unchanged: stay
/// - Only the worker count changed: resubmit and stay, no node replacement
/// - Anything else changed: resubmit and start replacing workers
pub async fn handle_uninitialized(
    cluster: &AzureCluster,
    ctx: &Context,
    status: &UpgradeStatus,
) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::Uninitialized);
    let Some(desired) = desired(cluster, ctx).await? else {
        return Ok(stay);
    };
    let resource_group = cluster.spec.resource_group();

    match ctx.deployments.get(resource_group, WORKER_DEPLOYMENT_NAME).await {
        Err(e) if e.is_not_found() => {
            info!("worker deployment does not exist yet");
            submit(cluster, ctx, &desired).await?;
            return Ok(Step::submitted(
                UpgradeState::DeploymentInitialized,
                desired.checksums,
            ));
        }
        Err(e) => return Err(e),
        Ok(current) if current.provisioning_state().is_final_failed() => {
            warn!(
                provisioning_state = %current.provisioning_state(),
                "worker deployment failed, resubmitting"
            );
            submit(cluster, ctx, &desired).await?;
            return Ok(Step::submitted(
                UpgradeState::DeploymentInitialized,
                desired.checksums,
            ));
        }
        Ok(_) => {}
    }

    if desired.checksums.matches(status) {
        debug!("worker deployment unchanged");
        return Ok(stay);
    }

    if is_pure_scale(cluster, ctx, status, &desired).await? {
        info!(
            workers = cluster.spec.workers.count,
            "worker count changed, resubmitting without node replacement"
        );
        submit(cluster, ctx, &desired).await?;
        return Ok(Step::submitted(UpgradeState::Uninitialized, desired.checksums));
    }

    info!("worker deployment drifted, starting rolling upgrade");
    submit(cluster, ctx, &desired).await?;
    Ok(Step::submitted(
        UpgradeState::ScaleUpWorkerPool,
        desired.checksums,
    ))
}

/// True if the drift disappears when the live worker capacity is used
async fn is_pure_scale(
    cluster: &AzureCluster,
    ctx: &Context,
    status: &UpgradeStatus,
    desired: &DesiredDeployment,
) -> Result<bool, Error> {
    let capacity = match ctx
        .scale_sets
        .get_capacity(cluster.spec.resource_group(), &cluster.spec.worker_scale_set())
        .await
    {
        Ok(capacity) => capacity,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(desired.checksums_with_worker_count(capacity).matches(status))
}

/// Handle the DeploymentInitialized state: wait for provisioning to finish
pub async fn handle_deployment_initialized(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::DeploymentInitialized);

    let deployment = match ctx
        .deployments
        .get(cluster.spec.resource_group(), WORKER_DEPLOYMENT_NAME)
        .await
    {
        Ok(d) => d,
        Err(e) if e.is_not_found() => {
            debug!("submitted deployment not visible yet");
            return Ok(stay);
        }
        Err(e) => return Err(e),
    };

    match deployment.provisioning_state() {
        ProvisioningState::Succeeded => Ok(Step::to(UpgradeState::ProvisioningSuccessful)),
        state if state.is_final_failed() => {
            warn!(provisioning_state = %state, "worker deployment failed");
            Ok(Step::to(UpgradeState::Uninitialized))
        }
        state => {
            debug!(provisioning_state = %state, "worker deployment still provisioning");
            Ok(stay)
        }
    }
}

/// Handle the ProvisioningSuccessful state
pub fn handle_provisioning_successful() -> Step {
    info!("worker deployment provisioned");
    Step::to(UpgradeState::UpgradeRequirementCheck)
}

/// Handle the DeploymentCompleted state: the steady state, watching for drift
pub async fn handle_deployment_completed(
    cluster: &AzureCluster,
    ctx: &Context,
    status: &UpgradeStatus,
) -> Result<Step, Error> {
    let stay = Step::to(UpgradeState::DeploymentCompleted);
    let reset = Step::to(UpgradeState::Uninitialized);

    let Some(desired) = desired(cluster, ctx).await? else {
        return Ok(stay);
    };

    let deployment = match ctx
        .deployments
        .get(cluster.spec.resource_group(), WORKER_DEPLOYMENT_NAME)
        .await
    {
        Ok(d) => d,
        Err(e) if e.is_not_found() => {
            warn!("worker deployment disappeared");
            return Ok(reset);
        }
        Err(e) => return Err(e),
    };

    match deployment.provisioning_state() {
        ProvisioningState::Succeeded if desired.checksums.matches(status) => Ok(stay),
        ProvisioningState::Succeeded => {
            info!("worker deployment drifted");
            Ok(reset)
        }
        state if state.is_final_failed() => {
            warn!(provisioning_state = %state, "worker deployment failed");
            Ok(reset)
        }
        state => {
            warn!(provisioning_state = %state, "unexpected provisioning state in steady state");
            Ok(reset)
        }
    }
}
