//! Custom Resource Definitions read and written by the upgrade controller.

mod cluster;
mod drainer;
mod types;

pub use cluster::{AzureCluster, AzureClusterSpec, AzureClusterStatus, CONDITION_CREATING};
pub use drainer::{
    DrainerConfig, DrainerConfigSpec, DrainerConfigStatus, CLUSTER_LABEL, CONDITION_DRAINED,
    CONDITION_TIMEOUT,
};
pub use types::{
    condition_is_true, Condition, ConditionStatus, ImageReference, NodePoolSpec, UpgradeStatus,
};
