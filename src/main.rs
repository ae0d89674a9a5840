//! vmss-upgrader - rolling upgrade controller for Azure VM scale sets

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmss_upgrader::azure::{ArmClient, ArmConfig, DEFAULT_ARM_ENDPOINT};
use vmss_upgrader::controller::{error_policy, reconcile, Context, UpgraderConfig};
use vmss_upgrader::crd::{AzureCluster, DrainerConfig};
use vmss_upgrader::scale::ScaleStrategy;
use vmss_upgrader::watchdog::WatchdogConfig;
use vmss_upgrader::FIELD_MANAGER;

/// Rolling, zero-downtime upgrades for Azure VM scale set node pools
#[derive(Parser, Debug)]
#[command(name = "vmss-upgrader", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Seconds between reconciles that did not change the upgrade state
    #[arg(long, env = "UPGRADER_POLL_INTERVAL_SECS", default_value = "60")]
    poll_interval_secs: u64,

    /// Seconds before retrying a failed reconcile
    #[arg(long, env = "UPGRADER_ERROR_BACKOFF_SECS", default_value = "30")]
    error_backoff_secs: u64,

    /// How the worker pool capacity moves toward its target
    #[arg(long, env = "UPGRADER_SCALE_STRATEGY", value_enum, default_value_t = StrategyArg::Quick)]
    scale_strategy: StrategyArg,

    /// Largest capacity change per loop with the staircase strategy
    #[arg(long, env = "UPGRADER_SCALE_STEP", default_value = "1")]
    scale_step: u32,

    /// Seconds between watchdog instance polls
    #[arg(long, env = "UPGRADER_WATCHDOG_INTERVAL_SECS", default_value = "30")]
    watchdog_interval_secs: u64,

    /// Reimage attempts per failed instance batch
    #[arg(long, env = "UPGRADER_WATCHDOG_ATTEMPTS", default_value = "3")]
    watchdog_attempts: u32,

    /// Azure subscription holding the cluster resource groups
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", required_unless_present = "crd")]
    azure_subscription_id: Option<String>,

    /// File containing an ARM bearer token, refreshed by the environment
    #[arg(long, env = "AZURE_TOKEN_FILE", required_unless_present = "crd")]
    azure_token_file: Option<PathBuf>,

    /// ARM base URL
    #[arg(long, env = "AZURE_ARM_ENDPOINT", default_value = DEFAULT_ARM_ENDPOINT)]
    arm_endpoint: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    /// Request the target capacity at once
    Quick,
    /// Move by `--scale-step` instances per loop
    Staircase,
}

impl Cli {
    fn upgrader_config(&self) -> UpgraderConfig {
        let scale_strategy = match self.scale_strategy {
            StrategyArg::Quick => ScaleStrategy::Quick,
            StrategyArg::Staircase => ScaleStrategy::Staircase {
                step: self.scale_step,
            },
        };
        let defaults = WatchdogConfig::default();
        UpgraderConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            scale_strategy,
            watchdog: WatchdogConfig {
                poll_interval: Duration::from_secs(self.watchdog_interval_secs),
                reimage_attempts: self.watchdog_attempts,
                ..defaults
            },
        }
    }

    fn arm_config(&self) -> anyhow::Result<ArmConfig> {
        let subscription_id = self
            .azure_subscription_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--azure-subscription-id is required"))?;
        let token_file = self
            .azure_token_file
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--azure-token-file is required"))?;
        Ok(ArmConfig {
            endpoint: self.arm_endpoint.clone(),
            subscription_id,
            token_file,
            timeout: Duration::from_secs(30),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and reqwest both pull in rustls; pin the process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [AzureCluster::crd(), DrainerConfig::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    run_controller(cli).await
}

/// Apply the controller's CRDs so upgrades ship schema changes with the binary
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [AzureCluster::crd(), DrainerConfig::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("vmss-upgrader starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let arm = Arc::new(
        ArmClient::new(cli.arm_config()?)
            .map_err(|e| anyhow::anyhow!("Failed to create ARM client: {}", e))?,
    );
    let ctx = Arc::new(
        Context::builder(client.clone(), arm)
            .config(cli.upgrader_config())
            .build(),
    );

    let clusters: Api<AzureCluster> = Api::all(client);

    tracing::info!(
        poll_interval = ?ctx.config.poll_interval,
        scale_strategy = ?ctx.config.scale_strategy,
        "Starting AzureCluster controller"
    );
    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Cluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Cluster reconciliation error");
                }
            }
        })
        .await;

    ctx.watchdogs.shutdown().await;

    tracing::info!("vmss-upgrader shutting down");
    Ok(())
}
