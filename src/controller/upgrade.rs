//! AzureCluster upgrade controller implementation
//!
//! Each reconcile reads the persisted upgrade status, executes exactly one
//! transition of the upgrade protocol and persists the result. A changed state
//! is requeued immediately; an unchanged one waits for the poll interval.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::checksum::ChecksumPair;
use crate::crd::{AzureCluster, UpgradeStatus};
use crate::deployment::{BootConfigSource, DeploymentClient, SecretBootConfigSource};
use crate::drain::{DrainerClient, KubeDrainerClient};
use crate::nodes::{KubeTenantClients, TenantClients};
use crate::phases;
use crate::scale::{ScaleSetClient, ScaleStrategy};
use crate::state::UpgradeState;
use crate::status::{KubeStatusClient, StatusClient};
use crate::watchdog::{WatchdogConfig, WatchdogRegistry};
use crate::Error;

/// Tunables of the upgrade controller
#[derive(Clone, Debug, PartialEq)]
pub struct UpgraderConfig {
    /// Requeue delay when a reconcile did not change the state
    pub poll_interval: Duration,
    /// Requeue delay after a failed reconcile
    pub error_backoff: Duration,
    /// How worker capacity moves toward its target
    pub scale_strategy: ScaleStrategy,
    /// Instance watchdog timing
    pub watchdog: WatchdogConfig,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(30),
            scale_strategy: ScaleStrategy::Quick,
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// Controller context containing shared clients and the watchdog registry
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, arm)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// ARM deployments
    pub deployments: Arc<dyn DeploymentClient>,
    /// VM scale sets
    pub scale_sets: Arc<dyn ScaleSetClient>,
    /// Tenant cluster node access
    pub tenants: Arc<dyn TenantClients>,
    /// DrainerConfig store
    pub drainers: Arc<dyn DrainerClient>,
    /// Upgrade status persistence
    pub status: Arc<dyn StatusClient>,
    /// Worker boot configuration
    pub boot_config: Arc<dyn BootConfigSource>,
    /// Running instance watchdogs
    pub watchdogs: Arc<WatchdogRegistry>,
    /// Tunables
    pub config: UpgraderConfig,
}

impl Context {
    /// Create a builder; `cloud` serves both deployments and scale sets
    pub fn builder<C>(client: Client, cloud: Arc<C>) -> ContextBuilder
    where
        C: DeploymentClient + ScaleSetClient + 'static,
    {
        ContextBuilder::new(client, cloud.clone(), cloud)
    }

    /// Create a context for testing with custom clients
    #[cfg(test)]
    pub fn for_testing(
        deployments: Arc<dyn DeploymentClient>,
        scale_sets: Arc<dyn ScaleSetClient>,
        tenants: Arc<dyn TenantClients>,
        drainers: Arc<dyn DrainerClient>,
        status: Arc<dyn StatusClient>,
        boot_config: Arc<dyn BootConfigSource>,
    ) -> Self {
        let config = UpgraderConfig::default();
        Self {
            deployments,
            scale_sets,
            tenants,
            drainers,
            status,
            boot_config,
            watchdogs: Arc::new(WatchdogRegistry::new(config.watchdog.clone())),
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    deployments: Arc<dyn DeploymentClient>,
    scale_sets: Arc<dyn ScaleSetClient>,
    tenants: Option<Arc<dyn TenantClients>>,
    drainers: Option<Arc<dyn DrainerClient>>,
    status: Option<Arc<dyn StatusClient>>,
    boot_config: Option<Arc<dyn BootConfigSource>>,
    config: UpgraderConfig,
}

impl ContextBuilder {
    fn new(
        client: Client,
        deployments: Arc<dyn DeploymentClient>,
        scale_sets: Arc<dyn ScaleSetClient>,
    ) -> Self {
        Self {
            client,
            deployments,
            scale_sets,
            tenants: None,
            drainers: None,
            status: None,
            boot_config: None,
            config: UpgraderConfig::default(),
        }
    }

    /// Set the controller tunables
    pub fn config(mut self, config: UpgraderConfig) -> Self {
        self.config = config;
        self
    }

    /// Override tenant client resolution
    pub fn tenants(mut self, tenants: Arc<dyn TenantClients>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    /// Override the DrainerConfig store
    pub fn drainers(mut self, drainers: Arc<dyn DrainerClient>) -> Self {
        self.drainers = Some(drainers);
        self
    }

    /// Override status persistence
    pub fn status(mut self, status: Arc<dyn StatusClient>) -> Self {
        self.status = Some(status);
        self
    }

    /// Override the boot configuration source
    pub fn boot_config(mut self, boot_config: Arc<dyn BootConfigSource>) -> Self {
        self.boot_config = Some(boot_config);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            deployments: self.deployments,
            scale_sets: self.scale_sets,
            tenants: self
                .tenants
                .unwrap_or_else(|| Arc::new(KubeTenantClients::new(self.client.clone()))),
            drainers: self
                .drainers
                .unwrap_or_else(|| Arc::new(KubeDrainerClient::new(self.client.clone()))),
            status: self
                .status
                .unwrap_or_else(|| Arc::new(KubeStatusClient::new(self.client.clone()))),
            boot_config: self
                .boot_config
                .unwrap_or_else(|| Arc::new(SecretBootConfigSource::new(self.client.clone()))),
            watchdogs: Arc::new(WatchdogRegistry::new(self.config.watchdog.clone())),
            config: self.config,
        }
    }
}

/// Result of one transition
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    /// State to persist
    pub next: UpgradeState,
    /// Checksums of a deployment submitted during the transition
    pub submitted: Option<ChecksumPair>,
}

impl Step {
    /// Move to `next` without a submission
    pub fn to(next: UpgradeState) -> Self {
        Self {
            next,
            submitted: None,
        }
    }

    /// Move to `next` after submitting a deployment with `checksums`
    pub fn submitted(next: UpgradeState, checksums: ChecksumPair) -> Self {
        Self {
            next,
            submitted: Some(checksums),
        }
    }
}

/// Whether a reconcile changed the persisted state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new state was persisted
    Changed,
    /// Same state as before (waiting, or lost a write race)
    Unchanged,
}

/// Execute the transition registered for `status.state`
pub async fn execute(
    ctx: &Context,
    cluster: &AzureCluster,
    status: &UpgradeStatus,
) -> Result<Step, Error> {
    use UpgradeState::*;

    match status.state {
        Uninitialized => phases::handle_uninitialized(cluster, ctx, status).await,
        DeploymentInitialized => phases::handle_deployment_initialized(cluster, ctx).await,
        ProvisioningSuccessful => Ok(phases::handle_provisioning_successful()),
        UpgradeRequirementCheck => phases::handle_upgrade_requirement_check(cluster, ctx).await,
        MasterInstancesUpgrading => phases::handle_master_instances_upgrading(cluster, ctx).await,
        ScaleUpWorkerPool => phases::handle_scale_up(cluster, ctx).await,
        CordonOldWorkers => phases::handle_cordon(cluster, ctx).await,
        WaitForWorkersReady => phases::handle_wait_for_workers_ready(cluster, ctx).await,
        DrainOldWorkerNodes => phases::handle_drain(cluster, ctx).await,
        TerminateOldWorkerInstances => phases::handle_terminate(cluster, ctx).await,
        ScaleDownWorkerPool => phases::handle_scale_down(cluster, ctx).await,
        DeploymentCompleted => phases::handle_deployment_completed(cluster, ctx, status).await,
    }
}

/// Drive one transition and persist its result
pub async fn ensure_upgraded(cluster: &AzureCluster, ctx: &Context) -> Result<Outcome, Error> {
    let snapshot = ctx.status.read(cluster).await?;
    let persisted = snapshot.status;
    let step = execute(ctx, cluster, &persisted).await?;

    let mut status = persisted.clone();
    status.state = step.next;
    if let Some(pair) = step.submitted {
        status.template_checksum = Some(pair.template);
        status.parameters_checksum = Some(pair.parameters);
    }

    if status == persisted {
        debug!(state = %persisted.state, "no state change");
        return Ok(Outcome::Unchanged);
    }

    if !ctx
        .status
        .write(cluster, &snapshot.resource_version, &status)
        .await?
    {
        return Ok(Outcome::Unchanged);
    }

    if status.state == persisted.state {
        debug!(state = %status.state, "persisted new checksums");
        return Ok(Outcome::Unchanged);
    }

    info!(
        from = %persisted.state,
        to = %status.state,
        upgrading = status.state.is_upgrading(),
        "upgrade state changed"
    );
    Ok(Outcome::Changed)
}

/// Reconcile an AzureCluster resource
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<AzureCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    if let Err(e) = cluster.spec.validate() {
        warn!(error = %e, "cluster validation failed");
        // Needs a spec change, not a retry
        return Ok(Action::await_change());
    }

    match ensure_upgraded(&cluster, &ctx).await? {
        Outcome::Changed => Ok(Action::requeue(Duration::ZERO)),
        Outcome::Unchanged => Ok(Action::requeue(ctx.config.poll_interval)),
    }
}

/// Error policy for the controller
pub fn error_policy(cluster: Arc<AzureCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_backoff)
}
