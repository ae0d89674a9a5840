//! Upgrade controller for AzureCluster resources
//!
//! The reconcile loop drives one transition of the upgrade state machine per
//! pass. Per-state behavior lives in [`crate::phases`].

#[cfg(test)]
mod fakes;
mod upgrade;

pub use upgrade::{
    ensure_upgraded, error_policy, execute, reconcile, Context, ContextBuilder, Outcome, Step,
    UpgraderConfig,
};
