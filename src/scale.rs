//! Scale set capacity and instance operations.
//!
//! Capacity changes go through a [`ScaleStrategy`] so that large jumps can be
//! spread over several reconcile loops. Whether the scale set is itself busy is
//! checked by callers with [`all_instances_succeeded`] before they scale.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::deployment::ProvisioningState;
use crate::Result;

/// A member of a VM scale set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmssInstance {
    /// Scale-set local instance id (decimal string)
    pub instance_id: String,
    /// Whether the instance runs the scale set's latest model
    pub latest_model_applied: bool,
    /// Provisioning state of the instance
    pub provisioning_state: ProvisioningState,
    /// OS computer name, when reported
    pub computer_name: Option<String>,
}

/// Client for VM scale sets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleSetClient: Send + Sync {
    /// Current `sku.capacity` of the scale set
    async fn get_capacity(&self, resource_group: &str, scale_set: &str) -> Result<u32>;

    /// Request a new capacity
    async fn set_capacity(&self, resource_group: &str, scale_set: &str, capacity: u32)
        -> Result<()>;

    /// All instances of the scale set, following every result page
    async fn list_instances(&self, resource_group: &str, scale_set: &str)
        -> Result<Vec<VmssInstance>>;

    /// Apply the latest model to the given instances
    async fn update_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_ids: &[String],
    ) -> Result<()>;

    /// Reimage the given instances
    async fn reimage_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_ids: &[String],
    ) -> Result<()>;

    /// Delete the given instances
    async fn delete_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_ids: &[String],
    ) -> Result<()>;
}

/// How capacity moves toward its target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScaleStrategy {
    /// Request the target in one step
    #[default]
    Quick,
    /// Move by at most `step` instances per loop
    Staircase {
        /// Largest change per loop
        step: u32,
    },
}

impl ScaleStrategy {
    /// Next capacity to request when `current` should become `target`
    pub fn next_capacity(&self, current: u32, target: u32) -> u32 {
        match *self {
            Self::Quick => target,
            Self::Staircase { step } => {
                let step = step.max(1);
                if current < target {
                    current.saturating_add(step).min(target)
                } else {
                    current.saturating_sub(step).max(target)
                }
            }
        }
    }
}

/// Move a scale set one strategy step toward `target`.
///
/// Returns the capacity that was requested, or the live capacity when it
/// already equals the target.
pub async fn scale(
    client: &dyn ScaleSetClient,
    strategy: ScaleStrategy,
    resource_group: &str,
    scale_set: &str,
    target: u32,
) -> Result<u32> {
    let current = client.get_capacity(resource_group, scale_set).await?;
    let next = strategy.next_capacity(current, target);

    if next == current {
        debug!(scale_set, capacity = current, "scale set already at target");
        return Ok(current);
    }

    info!(scale_set, from = current, to = next, target, "scaling scale set");
    client.set_capacity(resource_group, scale_set, next).await?;
    Ok(next)
}

/// True when every instance finished provisioning successfully
pub fn all_instances_succeeded(instances: &[VmssInstance]) -> bool {
    instances
        .iter()
        .all(|i| i.provisioning_state == ProvisioningState::Succeeded)
}
