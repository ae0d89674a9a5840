//! DrainerConfig Custom Resource Definition
//!
//! A DrainerConfig asks a separate drain executor to evict workloads from one
//! node. The executor reports back through the `Drained` and `Timeout`
//! conditions; this controller only creates, polls and deletes the objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{condition_is_true, Condition};

/// Condition type set by the drain executor once the node is empty
pub const CONDITION_DRAINED: &str = "Drained";

/// Condition type set by the drain executor when eviction took too long
pub const CONDITION_TIMEOUT: &str = "Timeout";

/// Label carrying the cluster id on every DrainerConfig
pub const CLUSTER_LABEL: &str = "upgrade.vmss.dev/cluster";

/// Specification for a DrainerConfig
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "upgrade.vmss.dev",
    version = "v1alpha1",
    kind = "DrainerConfig",
    plural = "drainerconfigs",
    status = "DrainerConfigStatus",
    namespaced,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DrainerConfigSpec {
    /// Cluster the node belongs to
    pub cluster_id: String,

    /// Kubernetes node to drain
    pub node_name: String,

    /// Eviction budget before the executor reports Timeout
    pub timeout_seconds: u32,
}

/// Status for a DrainerConfig, written by the drain executor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DrainerConfigStatus {
    /// Drained / Timeout conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl DrainerConfig {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// True once the executor finished evicting the node
    pub fn is_drained(&self) -> bool {
        condition_is_true(self.conditions(), CONDITION_DRAINED)
    }

    /// True when the executor gave up on the node
    pub fn is_timed_out(&self) -> bool {
        condition_is_true(self.conditions(), CONDITION_TIMEOUT)
    }
}
