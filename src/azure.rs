//! Azure Resource Manager REST client.
//!
//! Implements [`DeploymentClient`] and [`ScaleSetClient`] over plain HTTPS.
//! The bearer token is read from a file on every request so that an external
//! refresher can rotate it; acquiring the token is not this crate's concern.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::deployment::{Deployment, DeploymentClient, ProvisioningState};
use crate::scale::{ScaleSetClient, VmssInstance};
use crate::{Error, Result};

/// Default public-cloud ARM endpoint
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

const DEPLOYMENTS_API_VERSION: &str = "2021-04-01";
const COMPUTE_API_VERSION: &str = "2023-03-01";

/// Connection settings for [`ArmClient`]
#[derive(Clone, Debug)]
pub struct ArmConfig {
    /// ARM base URL
    pub endpoint: String,
    /// Subscription holding the cluster resource groups
    pub subscription_id: String,
    /// File containing a bearer token for ARM
    pub token_file: PathBuf,
    /// Per-request timeout
    pub timeout: Duration,
}

/// ARM client for deployments and VM scale sets
pub struct ArmClient {
    http: reqwest::Client,
    config: ArmConfig,
}

impl ArmClient {
    /// Build a client from its configuration
    pub fn new(config: ArmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                Error::internal("arm_client", format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { http, config })
    }

    fn resource_url(&self, resource_group: &str, provider_path: &str, api_version: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.subscription_id,
            resource_group,
            provider_path,
            api_version
        )
    }

    fn scale_set_url(&self, resource_group: &str, scale_set: &str, suffix: &str) -> String {
        self.resource_url(
            resource_group,
            &format!("Microsoft.Compute/virtualMachineScaleSets/{scale_set}{suffix}"),
            COMPUTE_API_VERSION,
        )
    }

    async fn token(&self) -> Result<String> {
        let token = tokio::fs::read_to_string(&self.config.token_file)
            .await
            .map_err(|e| {
                Error::internal(
                    "arm_token",
                    format!("failed to read {}: {e}", self.config.token_file.display()),
                )
            })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::internal("arm_token", "token file is empty"));
        }
        Ok(token.to_string())
    }

    /// Send a request and turn non-success responses into [`Error::Cloud`]
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let token = self.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::cloud(operation, None, e.to_string()))?;

        let status = response.status();
        trace!(operation, %status, "ARM response");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::cloud(operation, Some(status.as_u16()), body))
    }

    async fn instance_action(
        &self,
        operation: &str,
        resource_group: &str,
        scale_set: &str,
        action: &str,
        instance_ids: &[String],
    ) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let url = self.scale_set_url(resource_group, scale_set, &format!("/{action}"));
        let body = json!({ "instanceIds": instance_ids });
        self.send(operation, self.http.request(Method::POST, url).json(&body))
            .await?;
        debug!(scale_set, action, instances = ?instance_ids, "submitted instance action");
        Ok(())
    }
}

#[async_trait]
impl DeploymentClient for ArmClient {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Deployment> {
        let url = self.resource_url(
            resource_group,
            &format!("Microsoft.Resources/deployments/{name}"),
            DEPLOYMENTS_API_VERSION,
        );
        let response = self
            .send("get deployment", self.http.get(url))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::not_found("deployment", name)
                } else {
                    e
                }
            })?;
        response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("deployment {name}: {e}")))
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        deployment: &Deployment,
    ) -> Result<()> {
        let url = self.resource_url(
            resource_group,
            &format!("Microsoft.Resources/deployments/{name}"),
            DEPLOYMENTS_API_VERSION,
        );
        self.send("create deployment", self.http.put(url).json(deployment))
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ArmScaleSet {
    sku: ArmSku,
}

#[derive(Deserialize)]
struct ArmSku {
    #[serde(default)]
    capacity: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancePage {
    #[serde(default)]
    value: Vec<ArmInstance>,
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmInstance {
    instance_id: String,
    #[serde(default)]
    properties: ArmInstanceProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmInstanceProperties {
    #[serde(default)]
    latest_model_applied: bool,
    provisioning_state: Option<ProvisioningState>,
    os_profile: Option<ArmOsProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmOsProfile {
    computer_name: Option<String>,
}

impl From<ArmInstance> for VmssInstance {
    fn from(instance: ArmInstance) -> Self {
        let props = instance.properties;
        Self {
            instance_id: instance.instance_id,
            latest_model_applied: props.latest_model_applied,
            provisioning_state: props
                .provisioning_state
                .unwrap_or(ProvisioningState::Running),
            computer_name: props.os_profile.and_then(|p| p.computer_name),
        }
    }
}

fn scale_set_not_found(e: Error, scale_set: &str) -> Error {
    if e.is_not_found() {
        Error::not_found("scale set", scale_set)
    } else {
        e
    }
}

#[async_trait]
impl ScaleSetClient for ArmClient {
    async fn get_capacity(&self, resource_group: &str, scale_set: &str) -> Result<u32> {
        let url = self.scale_set_url(resource_group, scale_set, "");
        let response = self
            .send("get scale set", self.http.get(url))
            .await
            .map_err(|e| scale_set_not_found(e, scale_set))?;
        let vmss: ArmScaleSet = response
            .json()
            .await
            .map_err(|e| Error::serialization(format!("scale set {scale_set}: {e}")))?;
        Ok(vmss.sku.capacity)
    }

    async fn set_capacity(
        &self,
        resource_group: &str,
        scale_set: &str,
        capacity: u32,
    ) -> Result<()> {
        let url = self.scale_set_url(resource_group, scale_set, "");
        let body = json!({ "sku": { "capacity": capacity } });
        self.send("set capacity", self.http.patch(url).json(&body))
            .await
            .map_err(|e| scale_set_not_found(e, scale_set))?;
        Ok(())
    }

    async fn list_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
    ) -> Result<Vec<VmssInstance>> {
        let mut instances = Vec::new();
        let mut next = Some(self.scale_set_url(resource_group, scale_set, "/virtualMachines"));

        while let Some(url) = next {
            let response = self
                .send("list instances", self.http.get(url))
                .await
                .map_err(|e| scale_set_not_found(e, scale_set))?;
            let page: InstancePage = response
                .json()
                .await
                .map_err(|e| Error::serialization(format!("instances of {scale_set}: {e}")))?;
            instances.extend(page.value.into_iter().map(VmssInstance::from));
            next = page.next_link.filter(|l| !l.is_empty());
        }

        Ok(instances)
    }

    async fn update_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_ids: &[String],
    ) -> Result<()> {
        self.instance_action(
            "update instances",
            resource_group,
            scale_set,
            "manualupgrade",
            instance_ids,
        )
        .await
        .map_err(|e| scale_set_not_found(e, scale_set))
    }

    async fn reimage_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_ids: &[String],
    ) -> Result<()> {
        self.instance_action(
            "reimage instances",
            resource_group,
            scale_set,
            "reimage",
            instance_ids,
        )
        .await
        .map_err(|e| scale_set_not_found(e, scale_set))
    }

    async fn delete_instances(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_ids: &[String],
    ) -> Result<()> {
        self.instance_action(
            "delete instances",
            resource_group,
            scale_set,
            "delete",
            instance_ids,
        )
        .await
        .map_err(|e| scale_set_not_found(e, scale_set))
    }
}
