//! DrainerConfig store.
//!
//! Draining itself is done by a separate executor. This side only creates the
//! request objects, polls their conditions and cleans them up.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{DrainerConfig, DrainerConfigSpec, CLUSTER_LABEL};
use crate::Result;

/// Eviction budget handed to the drain executor
pub const DRAIN_TIMEOUT_SECONDS: u32 = 600;

/// Access to the DrainerConfigs of a cluster
///
/// DrainerConfigs live in the namespace named after the cluster id and are
/// keyed by node name.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DrainerClient: Send + Sync {
    /// Create a DrainerConfig for `node_name`
    async fn create(&self, cluster_id: &str, node_name: &str) -> Result<()>;

    /// Fetch the DrainerConfig for `node_name`, if any
    async fn get(&self, cluster_id: &str, node_name: &str) -> Result<Option<DrainerConfig>>;

    /// Delete the DrainerConfig for `node_name`; absent objects are ignored
    async fn delete(&self, cluster_id: &str, node_name: &str) -> Result<()>;

    /// All DrainerConfigs labelled with `cluster_id`
    async fn list(&self, cluster_id: &str) -> Result<Vec<DrainerConfig>>;
}

/// Build the DrainerConfig requesting a drain of `node_name`
pub fn drainer_config(cluster_id: &str, node_name: &str) -> DrainerConfig {
    let mut dc = DrainerConfig::new(
        node_name,
        DrainerConfigSpec {
            cluster_id: cluster_id.to_string(),
            node_name: node_name.to_string(),
            timeout_seconds: DRAIN_TIMEOUT_SECONDS,
        },
    );
    dc.metadata.namespace = Some(cluster_id.to_string());
    dc.labels_mut()
        .insert(CLUSTER_LABEL.to_string(), cluster_id.to_string());
    dc
}

/// DrainerConfig store backed by the management cluster API
pub struct KubeDrainerClient {
    client: Client,
}

impl KubeDrainerClient {
    /// Create a new KubeDrainerClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, cluster_id: &str) -> Api<DrainerConfig> {
        Api::namespaced(self.client.clone(), cluster_id)
    }
}

#[async_trait]
impl DrainerClient for KubeDrainerClient {
    async fn create(&self, cluster_id: &str, node_name: &str) -> Result<()> {
        let dc = drainer_config(cluster_id, node_name);
        match self
            .api(cluster_id)
            .create(&PostParams::default(), &dc)
            .await
        {
            Ok(_) => {
                info!(node = %node_name, "created DrainerConfig");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(node = %node_name, "DrainerConfig already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, cluster_id: &str, node_name: &str) -> Result<Option<DrainerConfig>> {
        Ok(self.api(cluster_id).get_opt(node_name).await?)
    }

    async fn delete(&self, cluster_id: &str, node_name: &str) -> Result<()> {
        match self
            .api(cluster_id)
            .delete(node_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(node = %node_name, "deleted DrainerConfig");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, cluster_id: &str) -> Result<Vec<DrainerConfig>> {
        let params = ListParams::default().labels(&format!("{CLUSTER_LABEL}={cluster_id}"));
        Ok(self.api(cluster_id).list(&params).await?.items)
    }
}
