//! Persistence of the upgrade progress in `status.upgrade`.
//!
//! Writes carry the resourceVersion the status was read at. A concurrent
//! writer makes the API server answer 409, which is not an error here: the
//! next reconcile re-reads the object and repeats the step.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{AzureCluster, UpgradeStatus};
use crate::{Error, Result, FIELD_MANAGER};

/// Upgrade status together with the resourceVersion it was read at
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    /// Validated upgrade status
    pub status: UpgradeStatus,
    /// resourceVersion of the object the status came from
    pub resource_version: String,
}

/// Read and write the typed upgrade status of an AzureCluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Latest persisted upgrade status
    async fn read(&self, cluster: &AzureCluster) -> Result<StatusSnapshot>;

    /// Persist `status` unless the object moved past `resource_version`
    ///
    /// Returns `false` when the write lost an optimistic-concurrency race.
    async fn write(
        &self,
        cluster: &AzureCluster,
        resource_version: &str,
        status: &UpgradeStatus,
    ) -> Result<bool>;
}

/// Status store backed by the AzureCluster status subresource
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    /// Create a new KubeStatusClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, cluster: &AzureCluster) -> Api<AzureCluster> {
        match cluster.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn read(&self, cluster: &AzureCluster) -> Result<StatusSnapshot> {
        let latest = self.api(cluster).get_status(&cluster.name_any()).await?;
        let resource_version = latest.resource_version().ok_or_else(|| {
            Error::validation(format!("{} has no resourceVersion", latest.name_any()))
        })?;
        let status = latest.upgrade_status();
        status.validate()?;
        Ok(StatusSnapshot {
            status,
            resource_version,
        })
    }

    async fn write(
        &self,
        cluster: &AzureCluster,
        resource_version: &str,
        status: &UpgradeStatus,
    ) -> Result<bool> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": { "upgrade": status }
        });

        match self
            .api(cluster)
            .patch_status(
                &cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = Error::from(e);
                if e.is_conflict() {
                    debug!(state = %status.state, "status write conflicted, retrying next loop");
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}
