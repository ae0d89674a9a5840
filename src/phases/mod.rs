//! Transition handlers for the upgrade protocol.
//!
//! Every handler executes one step and returns the next state. Returning the
//! current state means "not ready yet"; handlers never wait in place.

mod deployment;
mod masters;
mod requirement;
mod workers;

pub use deployment::{
    handle_deployment_completed, handle_deployment_initialized, handle_provisioning_successful,
    handle_uninitialized,
};
pub use masters::handle_master_instances_upgrading;
pub use requirement::handle_upgrade_requirement_check;
pub use workers::{
    handle_cordon, handle_drain, handle_scale_down, handle_scale_up, handle_terminate,
    handle_wait_for_workers_ready,
};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::controller::{Context, Step};
use crate::crd::AzureCluster;
use crate::deployment::{desired_worker_deployment, DesiredDeployment, WORKER_DEPLOYMENT_NAME};
use crate::nodes::{node_name, NodeClient};
use crate::scale::VmssInstance;
use crate::state::UpgradeState;
use crate::Error;

/// Desired worker deployment, `None` while its inputs are not available
async fn desired(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Option<DesiredDeployment>, Error> {
    desired_worker_deployment(ctx.boot_config.as_ref(), cluster).await
}

/// Submit the desired worker deployment
async fn submit(
    cluster: &AzureCluster,
    ctx: &Context,
    desired: &DesiredDeployment,
) -> Result<(), Error> {
    info!(
        template = %desired.checksums.template,
        parameters = %desired.checksums.parameters,
        "submitting worker deployment"
    );
    ctx.deployments
        .create_or_update(
            cluster.spec.resource_group(),
            WORKER_DEPLOYMENT_NAME,
            &desired.deployment,
        )
        .await
}

/// Tenant node client, `None` while the tenant API is not available
async fn node_client(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Option<Arc<dyn NodeClient>>, Error> {
    let client = ctx.tenants.node_client(cluster).await?;
    if client.is_none() {
        debug!("tenant cluster client not available yet");
    }
    Ok(client)
}

/// Instances of the worker scale set.
///
/// A missing scale set means the infrastructure was changed out of band and
/// yields `Err(Step)` resetting the protocol.
async fn worker_instances(
    cluster: &AzureCluster,
    ctx: &Context,
) -> Result<Result<Vec<VmssInstance>, Step>, Error> {
    let scale_set = cluster.spec.worker_scale_set();
    match ctx
        .scale_sets
        .list_instances(cluster.spec.resource_group(), &scale_set)
        .await
    {
        Ok(instances) => Ok(Ok(instances)),
        Err(e) if e.is_not_found() => Ok(Err(reset_on_missing(&scale_set))),
        Err(e) => Err(e),
    }
}

/// Make sure each instance's node has a live DrainerConfig.
///
/// Timed out drains are requested again; the executor never retries them.
async fn request_drains(
    cluster: &AzureCluster,
    ctx: &Context,
    name_prefix: &str,
    instances: &[VmssInstance],
) -> Result<(), Error> {
    let cluster_id = &cluster.spec.cluster_id;
    for instance in instances {
        let node = node_name(name_prefix, instance);
        match ctx.drainers.get(cluster_id, &node).await? {
            None => {
                info!(node = %node, "requesting drain");
                ctx.drainers.create(cluster_id, &node).await?;
            }
            Some(dc) if dc.is_timed_out() => {
                warn!(node = %node, "drain timed out, retrying");
                ctx.drainers.delete(cluster_id, &node).await?;
                ctx.drainers.create(cluster_id, &node).await?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn reset_on_missing(scale_set: &str) -> Step {
    warn!(scale_set, "scale set not found, restarting upgrade");
    Step::to(UpgradeState::Uninitialized)
}
