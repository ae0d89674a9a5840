//! vmss-upgrader - rolling upgrades for Azure VM scale set node pools
//!
//! The controller watches `AzureCluster` resources and keeps their worker pool
//! on the desired ARM deployment. Changes that need new machines are rolled
//! out without downtime: the pool is doubled, old nodes are cordoned and
//! drained, old instances are deleted and the pool is shrunk back.
//!
//! # Architecture
//!
//! Every reconcile performs exactly one transition of a persisted state
//! machine, so the controller can be restarted at any point:
//! - The state lives in the `AzureCluster` status next to the checksums of the
//!   last submitted deployment
//! - Cloud and cluster access goes through traits so each transition can be
//!   tested in isolation
//! - The only long-lived work is the instance watchdog, which retries failed
//!   reimages in the background
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (AzureCluster, DrainerConfig)
//! - [`controller`] - Reconcile loop and transition dispatch
//! - [`phases`] - Per-state transition handlers
//! - [`state`] - Upgrade states
//! - [`checksum`] - Deployment drift detection
//! - [`deployment`] - Worker ARM deployment and boot configuration
//! - [`scale`] - Scale set access and capacity stepping
//! - [`nodes`] - Tenant node access and instance classification
//! - [`drain`] - DrainerConfig management
//! - [`status`] - Upgrade status persistence
//! - [`watchdog`] - Background instance repair
//! - [`azure`] - ARM REST client
//! - [`retry`] - Retry with backoff
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod azure;
pub mod checksum;
pub mod controller;
pub mod crd;
pub mod deployment;
pub mod drain;
pub mod error;
pub mod nodes;
pub mod phases;
pub mod retry;
pub mod scale;
pub mod state;
pub mod status;
pub mod watchdog;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager for every object the controller writes
pub const FIELD_MANAGER: &str = "vmss-upgrader";
