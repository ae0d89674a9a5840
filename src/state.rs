//! Upgrade protocol states.
//!
//! The protocol is a closed set of steps. Dispatch over it is an exhaustive
//! `match` (see [`crate::controller::execute`]), so a state without a
//! transition cannot compile.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A step of the worker pool upgrade protocol
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    /// Initial state and reset target
    #[default]
    Uninitialized,
    /// A deployment was submitted and is being provisioned
    DeploymentInitialized,
    /// The deployment reported Succeeded
    ProvisioningSuccessful,
    /// Decide whether nodes must be replaced
    UpgradeRequirementCheck,
    /// Replace master instances one at a time
    MasterInstancesUpgrading,
    /// Double the worker pool capacity
    ScaleUpWorkerPool,
    /// Mark old worker nodes unschedulable
    CordonOldWorkers,
    /// Wait for every worker node to report Ready
    WaitForWorkersReady,
    /// Drain old worker nodes through DrainerConfigs
    DrainOldWorkerNodes,
    /// Delete the old worker instances
    TerminateOldWorkerInstances,
    /// Return the worker pool to its desired capacity
    ScaleDownWorkerPool,
    /// Steady state; watches for drift
    DeploymentCompleted,
}

impl UpgradeState {
    /// Every state, in protocol order
    pub const ALL: [UpgradeState; 12] = [
        Self::Uninitialized,
        Self::DeploymentInitialized,
        Self::ProvisioningSuccessful,
        Self::UpgradeRequirementCheck,
        Self::MasterInstancesUpgrading,
        Self::ScaleUpWorkerPool,
        Self::CordonOldWorkers,
        Self::WaitForWorkersReady,
        Self::DrainOldWorkerNodes,
        Self::TerminateOldWorkerInstances,
        Self::ScaleDownWorkerPool,
        Self::DeploymentCompleted,
    ];

    /// The persisted name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::DeploymentInitialized => "DeploymentInitialized",
            Self::ProvisioningSuccessful => "ProvisioningSuccessful",
            Self::UpgradeRequirementCheck => "UpgradeRequirementCheck",
            Self::MasterInstancesUpgrading => "MasterInstancesUpgrading",
            Self::ScaleUpWorkerPool => "ScaleUpWorkerPool",
            Self::CordonOldWorkers => "CordonOldWorkers",
            Self::WaitForWorkersReady => "WaitForWorkersReady",
            Self::DrainOldWorkerNodes => "DrainOldWorkerNodes",
            Self::TerminateOldWorkerInstances => "TerminateOldWorkerInstances",
            Self::ScaleDownWorkerPool => "ScaleDownWorkerPool",
            Self::DeploymentCompleted => "DeploymentCompleted",
        }
    }

    /// True while nodes are being replaced
    pub fn is_upgrading(&self) -> bool {
        matches!(
            self,
            Self::MasterInstancesUpgrading
                | Self::ScaleUpWorkerPool
                | Self::CordonOldWorkers
                | Self::WaitForWorkersReady
                | Self::DrainOldWorkerNodes
                | Self::TerminateOldWorkerInstances
                | Self::ScaleDownWorkerPool
        )
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| crate::Error::validation(format!("unknown upgrade state: {s:?}")))
    }
}
