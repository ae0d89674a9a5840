//! AzureCluster Custom Resource Definition
//!
//! An AzureCluster describes one tenant Kubernetes cluster whose masters and
//! workers run in Azure VM scale sets. The controller reads the spec to compute
//! the desired worker deployment and keeps its own progress in
//! `status.upgrade`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{condition_is_true, Condition, ImageReference, NodePoolSpec, UpgradeStatus};

/// Condition type set by the cluster lifecycle while it is first created
pub const CONDITION_CREATING: &str = "Creating";

/// Specification for an AzureCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "upgrade.vmss.dev",
    version = "v1alpha1",
    kind = "AzureCluster",
    plural = "azureclusters",
    shortname = "azc",
    status = "AzureClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.upgrade.state"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.operatorVersion"}"#,
    printcolumn = r#"{"name":"Workers","type":"integer","jsonPath":".spec.workers.count"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterSpec {
    /// Unique cluster identifier, used to name Azure resources
    pub cluster_id: String,

    /// Resource group holding the scale sets (defaults to the cluster id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,

    /// Azure region
    pub location: String,

    /// Version of the operator that rendered the node configuration
    pub operator_version: String,

    /// OS image for all nodes
    pub image: ImageReference,

    /// Master pool
    pub masters: NodePoolSpec,

    /// Worker pool
    pub workers: NodePoolSpec,

    /// Subnet the worker instances attach to
    pub worker_subnet_id: String,
}

impl AzureClusterSpec {
    /// Resource group holding the cluster's scale sets
    pub fn resource_group(&self) -> &str {
        self.resource_group.as_deref().unwrap_or(&self.cluster_id)
    }

    /// Name of the worker scale set
    pub fn worker_scale_set(&self) -> String {
        format!("{}-worker", self.cluster_id)
    }

    /// Name of the master scale set
    pub fn master_scale_set(&self) -> String {
        format!("{}-master", self.cluster_id)
    }

    /// Computer name prefix of worker instances
    pub fn worker_name_prefix(&self) -> String {
        format!("{}-worker-", self.cluster_id)
    }

    /// Computer name prefix of master instances
    pub fn master_name_prefix(&self) -> String {
        format!("{}-master-", self.cluster_id)
    }

    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cluster_id.trim().is_empty() {
            return Err(crate::Error::validation("clusterId must not be empty"));
        }
        if self.operator_version.trim().is_empty() {
            return Err(crate::Error::validation("operatorVersion must not be empty"));
        }
        self.masters.validate("masters")?;
        self.workers.validate("workers")?;
        Ok(())
    }
}

/// Status for an AzureCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureClusterStatus {
    /// Cluster lifecycle conditions, owned by the cluster lifecycle controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Upgrade state machine progress, owned by this controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeStatus>,
}

impl AzureCluster {
    /// Cluster lifecycle conditions (empty before the first status write)
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// True while the cluster is being created for the first time
    pub fn is_creating(&self) -> bool {
        condition_is_true(self.conditions(), CONDITION_CREATING)
    }

    /// Persisted upgrade progress (default when never written)
    pub fn upgrade_status(&self) -> UpgradeStatus {
        self.status
            .as_ref()
            .and_then(|s| s.upgrade.clone())
            .unwrap_or_default()
    }
}
