//! Supporting types shared by the custom resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::state::UpgradeState;

/// Marketplace image the scale set instances boot from
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ImageReference {
    /// Image publisher (e.g. "kinvolk")
    pub publisher: String,
    /// Image offer (e.g. "flatcar-container-linux-free")
    pub offer: String,
    /// Image SKU
    pub sku: String,
    /// Image version
    pub version: String,
}

/// Size and count of one node pool
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Azure VM size (e.g. "Standard_D4s_v3")
    pub vm_size: String,
    /// Desired number of instances
    pub count: u32,
}

impl NodePoolSpec {
    /// Validate the pool specification
    pub fn validate(&self, pool: &str) -> Result<(), crate::Error> {
        if self.count == 0 {
            return Err(crate::Error::validation(format!(
                "{pool} count must be at least 1"
            )));
        }
        if self.vm_size.trim().is_empty() {
            return Err(crate::Error::validation(format!(
                "{pool} vmSize must not be empty"
            )));
        }
        Ok(())
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. Creating, Drained)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Shorthand for a `True` condition without reason or message
    pub fn active(type_: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::True, "", "")
    }
}

/// True if `conditions` holds a `True` condition of the given type
pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
}

/// Persisted progress of the upgrade state machine.
///
/// Written only by this controller. The checksums are those of the last
/// deployment it submitted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    /// Current protocol step
    #[serde(default)]
    pub state: UpgradeState,

    /// Checksum of the submitted deployment template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_checksum: Option<String>,

    /// Checksum of the submitted deployment parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_checksum: Option<String>,
}

impl UpgradeStatus {
    /// Validate the persisted block
    ///
    /// Checksums are written together; one without the other means the block
    /// was edited by hand.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.template_checksum.is_some() != self.parameters_checksum.is_some() {
            return Err(crate::Error::validation(
                "upgrade status must carry both checksums or neither",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_validation() {
        let pool = NodePoolSpec {
            vm_size: "Standard_D4s_v3".to_string(),
            count: 3,
        };
        assert!(pool.validate("workers").is_ok());

        let empty = NodePoolSpec { count: 0, ..pool.clone() };
        assert!(empty
            .validate("workers")
            .unwrap_err()
            .to_string()
            .contains("workers count"));

        let unsized_pool = NodePoolSpec {
            vm_size: " ".to_string(),
            ..pool
        };
        assert!(unsized_pool.validate("masters").is_err());
    }

    #[test]
    fn test_condition_lookup_requires_true_status() {
        let conditions = vec![
            Condition::active("Created"),
            Condition::new("Updating", ConditionStatus::False, "", ""),
        ];
        assert!(condition_is_true(&conditions, "Created"));
        assert!(!condition_is_true(&conditions, "Updating"));
        assert!(!condition_is_true(&conditions, "Creating"));
    }

    #[test]
    fn test_upgrade_status_reads_with_missing_fields() {
        let status: UpgradeStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status, UpgradeStatus::default());
        assert!(status.validate().is_ok());
    }

    #[test]
    fn test_half_written_checksums_are_rejected() {
        let status = UpgradeStatus {
            state: UpgradeState::DeploymentCompleted,
            template_checksum: Some("abc".to_string()),
            parameters_checksum: None,
        };
        assert!(status.validate().is_err());
    }
}
