//! Worker pool deployment: model, gateway trait and desired-state templating.
//!
//! The worker scale set is provisioned by a declarative ARM deployment. This
//! module builds the deployment the cluster spec asks for and defines the
//! client used to submit and poll it.

use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::checksum::{ChecksumPair, BOOT_CONFIG_PARAMETER};
use crate::crd::{AzureCluster, AzureClusterSpec};
use crate::{Error, Result};

/// Name of the deployment that owns the worker scale set
pub const WORKER_DEPLOYMENT_NAME: &str = "workers-vmss-template";

/// Parameter holding the worker capacity
pub const WORKER_COUNT_PARAMETER: &str = "workerCount";

/// Key of the boot configuration inside its Secret
pub const BOOT_CONFIG_SECRET_KEY: &str = "cloudConfig";

const WORKER_TEMPLATE: &str = include_str!("../templates/worker-vmss.json");

/// Azure provisioning state of a deployment or scale set instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProvisioningState {
    /// Provisioning finished successfully
    Succeeded,
    /// Provisioning failed
    Failed,
    /// Provisioning was canceled
    Canceled,
    /// Provisioning is in progress
    Running,
    /// Request accepted, not yet started
    Accepted,
    /// Resource is being created
    Creating,
    /// Resource is being updated
    Updating,
    /// Resource is being deleted
    Deleting,
    /// Any other value reported by the API
    Other(String),
}

impl ProvisioningState {
    /// Failed or Canceled: the deployment will not make further progress
    pub fn is_final_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// Succeeded, Failed or Canceled
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded) || self.is_final_failed()
    }
}

impl From<String> for ProvisioningState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Canceled" => Self::Canceled,
            "Running" => Self::Running,
            "Accepted" => Self::Accepted,
            "Creating" => Self::Creating,
            "Updating" => Self::Updating,
            "Deleting" => Self::Deleting,
            _ => Self::Other(s),
        }
    }
}

impl From<ProvisioningState> for String {
    fn from(state: ProvisioningState) -> Self {
        state.to_string()
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("Succeeded"),
            Self::Failed => f.write_str("Failed"),
            Self::Canceled => f.write_str("Canceled"),
            Self::Running => f.write_str("Running"),
            Self::Accepted => f.write_str("Accepted"),
            Self::Creating => f.write_str("Creating"),
            Self::Updating => f.write_str("Updating"),
            Self::Deleting => f.write_str("Deleting"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// An ARM deployment
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment properties
    pub properties: DeploymentProperties,
}

/// Properties of an ARM deployment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProperties {
    /// Deployment mode; always "Incremental" for submissions
    #[serde(default = "incremental")]
    pub mode: String,

    /// Template body (absent on reads)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub template: Value,

    /// Parameters in `{ name: { value } }` form
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,

    /// Provisioning state (reads only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<ProvisioningState>,
}

impl Default for DeploymentProperties {
    fn default() -> Self {
        Self {
            mode: incremental(),
            template: Value::Null,
            parameters: Map::new(),
            provisioning_state: None,
        }
    }
}

fn incremental() -> String {
    "Incremental".to_string()
}

impl Deployment {
    /// Provisioning state, treating a missing value as still running
    pub fn provisioning_state(&self) -> ProvisioningState {
        self.properties
            .provisioning_state
            .clone()
            .unwrap_or(ProvisioningState::Running)
    }
}

/// Client for ARM deployments
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Fetch a deployment; absent deployments yield [`Error::NotFound`]
    async fn get(&self, resource_group: &str, name: &str) -> Result<Deployment>;

    /// Submit a deployment without waiting for it to finish
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<()>;
}

/// Source of the rendered worker boot configuration
///
/// Rendering is done elsewhere; this only fetches the uploaded result.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootConfigSource: Send + Sync {
    /// Base64 boot configuration, or `None` if it has not been uploaded yet
    async fn worker_boot_config(&self, cluster: &AzureCluster) -> Result<Option<String>>;
}

/// The deployment the cluster spec currently asks for
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredDeployment {
    /// Deployment to submit
    pub deployment: Deployment,
    /// Checksums of `deployment`
    pub checksums: ChecksumPair,
}

impl DesiredDeployment {
    /// Build the desired deployment from the spec and boot configuration
    pub fn build(spec: &AzureClusterSpec, boot_config: &str) -> Result<Self> {
        let template: Value = serde_json::from_str(WORKER_TEMPLATE)
            .map_err(|e| Error::serialization(format!("worker template: {e}")))?;
        let parameters = worker_parameters(spec, boot_config);
        let checksums = ChecksumPair::compute(&template, &parameters);

        Ok(Self {
            deployment: Deployment {
                properties: DeploymentProperties {
                    template,
                    parameters,
                    ..Default::default()
                },
            },
            checksums,
        })
    }

    /// Checksums this deployment would have with a different worker count
    pub fn checksums_with_worker_count(&self, count: u32) -> ChecksumPair {
        let mut parameters = self.deployment.properties.parameters.clone();
        parameters.insert(WORKER_COUNT_PARAMETER.to_string(), json!({ "value": count }));
        ChecksumPair::compute(&self.deployment.properties.template, &parameters)
    }
}

/// Compute the desired worker deployment.
///
/// Returns `Ok(None)` while the boot configuration is not available; callers
/// wait instead of failing.
pub async fn desired_worker_deployment(
    boot: &dyn BootConfigSource,
    cluster: &AzureCluster,
) -> Result<Option<DesiredDeployment>> {
    let Some(boot_config) = boot.worker_boot_config(cluster).await? else {
        debug!("worker boot configuration not uploaded yet");
        return Ok(None);
    };
    DesiredDeployment::build(&cluster.spec, &boot_config).map(Some)
}

/// Reads the worker boot configuration from the `<cluster>-worker-boot-config`
/// Secret, written by whatever renders it
pub struct SecretBootConfigSource {
    client: Client,
}

impl SecretBootConfigSource {
    /// Create a new SecretBootConfigSource wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BootConfigSource for SecretBootConfigSource {
    async fn worker_boot_config(&self, cluster: &AzureCluster) -> Result<Option<String>> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = format!("{}-worker-boot-config", cluster.spec.cluster_id);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let content = api
            .get_opt(&name)
            .await?
            .and_then(|secret| secret.data)
            .and_then(|mut data| data.remove(BOOT_CONFIG_SECRET_KEY))
            .filter(|bytes| !bytes.0.is_empty());

        Ok(content.map(|bytes| STANDARD.encode(bytes.0)))
    }
}

fn worker_parameters(spec: &AzureClusterSpec, boot_config: &str) -> Map<String, Value> {
    let values = [
        ("clusterID", json!(spec.cluster_id)),
        ("location", json!(spec.location)),
        ("vmssName", json!(spec.worker_scale_set())),
        ("computerNamePrefix", json!(spec.worker_name_prefix())),
        ("vmSize", json!(spec.workers.vm_size)),
        (WORKER_COUNT_PARAMETER, json!(spec.workers.count)),
        ("osImagePublisher", json!(spec.image.publisher)),
        ("osImageOffer", json!(spec.image.offer)),
        ("osImageSku", json!(spec.image.sku)),
        ("osImageVersion", json!(spec.image.version)),
        ("subnetID", json!(spec.worker_subnet_id)),
        ("operatorVersion", json!(spec.operator_version)),
        (BOOT_CONFIG_PARAMETER, json!(boot_config)),
    ];

    values
        .into_iter()
        .map(|(name, value)| (name.to_string(), json!({ "value": value })))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ImageReference, NodePoolSpec};

    fn spec() -> AzureClusterSpec {
        AzureClusterSpec {
            cluster_id: "c7x2p".to_string(),
            resource_group: None,
            location: "westeurope".to_string(),
            operator_version: "4.2.0".to_string(),
            image: ImageReference {
                publisher: "kinvolk".to_string(),
                offer: "flatcar-container-linux-free".to_string(),
                sku: "stable".to_string(),
                version: "2605.12.0".to_string(),
            },
            masters: NodePoolSpec {
                vm_size: "Standard_D4s_v3".to_string(),
                count: 1,
            },
            workers: NodePoolSpec {
                vm_size: "Standard_D4s_v3".to_string(),
                count: 3,
            },
            worker_subnet_id: "/subscriptions/s/subnets/worker".to_string(),
        }
    }

    #[test]
    fn test_template_parses_and_declares_every_parameter() {
        let desired = DesiredDeployment::build(&spec(), "Ym9vdA==").unwrap();
        let declared = desired.deployment.properties.template["parameters"]
            .as_object()
            .unwrap();
        for name in desired.deployment.properties.parameters.keys() {
            assert!(declared.contains_key(name), "{name} is not declared");
        }
    }

    #[test]
    fn test_parameters_follow_spec() {
        let desired = DesiredDeployment::build(&spec(), "Ym9vdA==").unwrap();
        let params = &desired.deployment.properties.parameters;
        assert_eq!(params["workerCount"]["value"], 3);
        assert_eq!(params["vmssName"]["value"], "c7x2p-worker");
        assert_eq!(params["vmSize"]["value"], "Standard_D4s_v3");
        assert_eq!(params[BOOT_CONFIG_PARAMETER]["value"], "Ym9vdA==");
        assert_eq!(desired.deployment.properties.mode, "Incremental");
    }

    /// Story: Changing only the worker count is recognisable as a scale event
    #[test]
    fn story_worker_count_change_is_isolated() {
        let three = DesiredDeployment::build(&spec(), "Ym9vdA==").unwrap();
        let mut five_spec = spec();
        five_spec.workers.count = 5;
        let five = DesiredDeployment::build(&five_spec, "Ym9vdA==").unwrap();

        assert_ne!(three.checksums, five.checksums);
        assert_eq!(five.checksums_with_worker_count(3), three.checksums);
    }

    #[test]
    fn test_provisioning_state_parsing() {
        let d: Deployment =
            serde_json::from_str(r#"{"properties":{"provisioningState":"Canceled"}}"#).unwrap();
        assert_eq!(d.provisioning_state(), ProvisioningState::Canceled);
        assert!(d.provisioning_state().is_final_failed());

        let d: Deployment =
            serde_json::from_str(r#"{"properties":{"provisioningState":"Validating"}}"#).unwrap();
        assert_eq!(
            d.provisioning_state(),
            ProvisioningState::Other("Validating".to_string())
        );
        assert!(!d.provisioning_state().is_final());

        let d: Deployment = serde_json::from_str(r#"{"properties":{}}"#).unwrap();
        assert_eq!(d.provisioning_state(), ProvisioningState::Running);
    }

    #[test]
    fn test_submission_body_omits_read_only_fields() {
        let desired = DesiredDeployment::build(&spec(), "Ym9vdA==").unwrap();
        let body = serde_json::to_value(&desired.deployment).unwrap();
        assert!(body["properties"].get("provisioningState").is_none());
        assert!(body["properties"]["template"].is_object());
    }

    #[tokio::test]
    async fn test_missing_boot_config_yields_no_deployment() {
        let mut boot = MockBootConfigSource::new();
        boot.expect_worker_boot_config().returning(|_| Ok(None));

        let cluster = AzureCluster::new("c7x2p", spec());
        let desired = desired_worker_deployment(&boot, &cluster).await.unwrap();
        assert!(desired.is_none());
    }
}
