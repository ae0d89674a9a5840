//! In-memory collaborators for multi-loop controller tests.
//!
//! Mocks verify single calls well; these fakes keep state between reconciles
//! so whole upgrade stories can be replayed loop by loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::{ensure_upgraded, Context, Outcome};
use crate::crd::{
    AzureCluster, AzureClusterSpec, AzureClusterStatus, Condition, DrainerConfig, ImageReference,
    NodePoolSpec, UpgradeStatus, CLUSTER_LABEL,
};
use crate::deployment::{
    BootConfigSource, Deployment, DeploymentClient, DesiredDeployment, ProvisioningState,
};
use crate::drain::{drainer_config, DrainerClient};
use crate::nodes::{NodeClient, TenantClients, NODE_VERSION_LABEL};
use crate::scale::{ScaleSetClient, VmssInstance};
use crate::state::UpgradeState;
use crate::status::{StatusClient, StatusSnapshot};
use crate::{Error, Result};

pub const WORKERS: &str = "c7x2p-worker";
pub const MASTERS: &str = "c7x2p-master";

pub fn sample_cluster() -> AzureCluster {
    let mut cluster = AzureCluster::new(
        "c7x2p",
        AzureClusterSpec {
            cluster_id: "c7x2p".to_string(),
            resource_group: None,
            location: "westeurope".to_string(),
            operator_version: "2.0.0".to_string(),
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
        },
    );
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.resource_version = Some("1".to_string());
    cluster.status = Some(AzureClusterStatus {
        conditions: vec![Condition::active("Ready")],
        upgrade: None,
    });
    cluster
}

/// Base64 boot configuration carrying a signed blob URL
pub fn boot_config(signature: &str) -> String {
    let config = serde_json::json!({
        "ignition": {
            "version": "2.2.0",
            "config": {
                "append": [{ "source": format!("https://blob/worker?sig={signature}") }]
            }
        }
    });
    STANDARD.encode(config.to_string())
}

pub fn instance(id: u32, latest: bool) -> VmssInstance {
    VmssInstance {
        instance_id: id.to_string(),
        latest_model_applied: latest,
        provisioning_state: ProvisioningState::Succeeded,
        computer_name: None,
    }
}

pub fn node(name: &str, version: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                [(NODE_VERSION_LABEL.to_string(), version.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn worker_node_name(id: u32) -> String {
    format!("{WORKERS}-{id:06}")
}

// =============================================================================
// Cloud
// =============================================================================

#[derive(Default)]
pub struct CloudState {
    pub deployment: Option<Deployment>,
    pub submissions: usize,
    pub capacity: HashMap<String, u32>,
    pub instances: HashMap<String, Vec<VmssInstance>>,
    pub capacity_requests: Vec<u32>,
    pub updated: Vec<String>,
    pub reimaged: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Default)]
pub struct FakeCloud(Mutex<CloudState>);

impl FakeCloud {
    pub fn state(&self) -> MutexGuard<'_, CloudState> {
        self.0.lock().unwrap()
    }

    pub fn set_provisioning_state(&self, state: ProvisioningState) {
        if let Some(d) = self.state().deployment.as_mut() {
            d.properties.provisioning_state = Some(state);
        }
    }

    pub fn set_instances(&self, scale_set: &str, instances: Vec<VmssInstance>) {
        let mut state = self.state();
        state
            .capacity
            .insert(scale_set.to_string(), instances.len() as u32);
        state.instances.insert(scale_set.to_string(), instances);
    }

    fn missing(scale_set: &str) -> Error {
        Error::not_found("scale set", scale_set)
    }
}

#[async_trait]
impl DeploymentClient for FakeCloud {
    async fn get(&self, _resource_group: &str, name: &str) -> Result<Deployment> {
        self.state()
            .deployment
            .clone()
            .ok_or_else(|| Error::not_found("deployment", name))
    }

    async fn create_or_update(&self, _: &str, _: &str, deployment: &Deployment) -> Result<()> {
        let mut state = self.state();
        let mut stored = deployment.clone();
        stored.properties.provisioning_state = Some(ProvisioningState::Accepted);
        state.deployment = Some(stored);
        state.submissions += 1;
        Ok(())
    }
}

#[async_trait]
impl ScaleSetClient for FakeCloud {
    async fn get_capacity(&self, _: &str, scale_set: &str) -> Result<u32> {
        self.state()
            .capacity
            .get(scale_set)
            .copied()
            .ok_or_else(|| Self::missing(scale_set))
    }

    async fn set_capacity(&self, _: &str, scale_set: &str, capacity: u32) -> Result<()> {
        let mut state = self.state();
        if !state.capacity.contains_key(scale_set) {
            return Err(Self::missing(scale_set));
        }
        state.capacity.insert(scale_set.to_string(), capacity);
        state.capacity_requests.push(capacity);
        Ok(())
    }

    async fn list_instances(&self, _: &str, scale_set: &str) -> Result<Vec<VmssInstance>> {
        self.state()
            .instances
            .get(scale_set)
            .cloned()
            .ok_or_else(|| Self::missing(scale_set))
    }

    async fn update_instances(&self, _: &str, scale_set: &str, ids: &[String]) -> Result<()> {
        let mut state = self.state();
        let Some(instances) = state.instances.get_mut(scale_set) else {
            return Err(Self::missing(scale_set));
        };
        for i in instances.iter_mut().filter(|i| ids.contains(&i.instance_id)) {
            i.provisioning_state = ProvisioningState::Updating;
        }
        state.updated.extend(ids.iter().cloned());
        Ok(())
    }

    async fn reimage_instances(&self, _: &str, scale_set: &str, ids: &[String]) -> Result<()> {
        let mut state = self.state();
        if !state.instances.contains_key(scale_set) {
            return Err(Self::missing(scale_set));
        }
        state.reimaged.extend(ids.iter().cloned());
        Ok(())
    }

    async fn delete_instances(&self, _: &str, scale_set: &str, ids: &[String]) -> Result<()> {
        let mut state = self.state();
        let Some(instances) = state.instances.get_mut(scale_set) else {
            return Err(Self::missing(scale_set));
        };
        instances.retain(|i| !ids.contains(&i.instance_id));
        let remaining = instances.len() as u32;
        state.capacity.insert(scale_set.to_string(), remaining);
        state.deleted.extend(ids.iter().cloned());
        Ok(())
    }
}

// =============================================================================
// Tenant cluster
// =============================================================================

#[derive(Default)]
pub struct FakeNodes {
    pub nodes: Mutex<Vec<Node>>,
    pub cordoned: Mutex<Vec<String>>,
    /// Nodes that vanish between list and cordon
    pub vanishing: Mutex<Vec<String>>,
}

#[async_trait]
impl NodeClient for FakeNodes {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn cordon(&self, name: &str) -> Result<()> {
        if self.vanishing.lock().unwrap().iter().any(|n| n == name) {
            return Err(Error::not_found("node", name));
        }
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .iter_mut()
            .find(|n| n.name_any() == name)
            .ok_or_else(|| Error::not_found("node", name))?;
        node.spec.get_or_insert_with(Default::default).unschedulable = Some(true);
        self.cordoned.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTenant {
    pub nodes: Arc<FakeNodes>,
    pub unavailable: Mutex<bool>,
}

#[async_trait]
impl TenantClients for FakeTenant {
    async fn node_client(&self, _: &AzureCluster) -> Result<Option<Arc<dyn NodeClient>>> {
        if *self.unavailable.lock().unwrap() {
            return Ok(None);
        }
        let nodes: Arc<dyn NodeClient> = self.nodes.clone();
        Ok(Some(nodes))
    }
}

// =============================================================================
// Management cluster
// =============================================================================

#[derive(Default)]
pub struct FakeDrainers(pub Mutex<BTreeMap<String, DrainerConfig>>);

impl FakeDrainers {
    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().keys().cloned().collect()
    }

    pub fn set_condition(&self, node: &str, condition: &str) {
        if let Some(dc) = self.0.lock().unwrap().get_mut(node) {
            dc.status.get_or_insert_with(Default::default).conditions =
                vec![Condition::active(condition)];
        }
    }
}

#[async_trait]
impl DrainerClient for FakeDrainers {
    async fn create(&self, cluster_id: &str, node_name: &str) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .entry(node_name.to_string())
            .or_insert_with(|| drainer_config(cluster_id, node_name));
        Ok(())
    }

    async fn get(&self, _: &str, node_name: &str) -> Result<Option<DrainerConfig>> {
        Ok(self.0.lock().unwrap().get(node_name).cloned())
    }

    async fn delete(&self, _: &str, node_name: &str) -> Result<()> {
        self.0.lock().unwrap().remove(node_name);
        Ok(())
    }

    async fn list(&self, cluster_id: &str) -> Result<Vec<DrainerConfig>> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .values()
            .filter(|dc| dc.labels().get(CLUSTER_LABEL).map(String::as_str) == Some(cluster_id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeStatus {
    pub status: Mutex<UpgradeStatus>,
    /// Bumped on every successful write, like a resourceVersion
    pub version: Mutex<u64>,
    pub writes: Mutex<usize>,
    pub conflict: Mutex<bool>,
}

#[async_trait]
impl StatusClient for FakeStatus {
    async fn read(&self, _: &AzureCluster) -> Result<StatusSnapshot> {
        Ok(StatusSnapshot {
            status: self.status.lock().unwrap().clone(),
            resource_version: self.version.lock().unwrap().to_string(),
        })
    }

    async fn write(
        &self,
        _: &AzureCluster,
        resource_version: &str,
        status: &UpgradeStatus,
    ) -> Result<bool> {
        let mut version = self.version.lock().unwrap();
        if *self.conflict.lock().unwrap() || resource_version != version.to_string() {
            return Ok(false);
        }
        *version += 1;
        *self.status.lock().unwrap() = status.clone();
        *self.writes.lock().unwrap() += 1;
        Ok(true)
    }
}

pub struct FakeBoot(pub Mutex<Option<String>>);

#[async_trait]
impl BootConfigSource for FakeBoot {
    async fn worker_boot_config(&self, _: &AzureCluster) -> Result<Option<String>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

// =============================================================================
// World
// =============================================================================

/// All fakes wired into one controller context
pub struct World {
    pub cluster: AzureCluster,
    pub cloud: Arc<FakeCloud>,
    pub tenant: Arc<FakeTenant>,
    pub drainers: Arc<FakeDrainers>,
    pub status: Arc<FakeStatus>,
    pub boot: Arc<FakeBoot>,
    pub ctx: Context,
}

impl World {
    pub fn new() -> Self {
        let cloud = Arc::new(FakeCloud::default());
        let tenant = Arc::new(FakeTenant::default());
        let drainers = Arc::new(FakeDrainers::default());
        let status = Arc::new(FakeStatus::default());
        let boot = Arc::new(FakeBoot(Mutex::new(Some(boot_config("aaa")))));
        let ctx = Context::for_testing(
            cloud.clone(),
            cloud.clone(),
            tenant.clone(),
            drainers.clone(),
            status.clone(),
            boot.clone(),
        );
        Self {
            cluster: sample_cluster(),
            cloud,
            tenant,
            drainers,
            status,
            boot,
            ctx,
        }
    }

    /// Persist `state` together with the checksums of the current desired deployment
    pub fn persist_current(&self, state: UpgradeState) {
        let boot = self.boot.0.lock().unwrap().clone().unwrap_or_default();
        let desired = DesiredDeployment::build(&self.cluster.spec, &boot).unwrap();
        *self.status.status.lock().unwrap() = UpgradeStatus {
            state,
            template_checksum: Some(desired.checksums.template),
            parameters_checksum: Some(desired.checksums.parameters),
        };
    }

    /// Store the current desired deployment as provisioned
    pub fn deploy_current(&self) {
        let boot = self.boot.0.lock().unwrap().clone().unwrap_or_default();
        let desired = DesiredDeployment::build(&self.cluster.spec, &boot).unwrap();
        let mut deployment = desired.deployment;
        deployment.properties.provisioning_state = Some(ProvisioningState::Succeeded);
        self.cloud.state().deployment = Some(deployment);
    }

    pub fn set_boot_config(&self, encoded: String) {
        *self.boot.0.lock().unwrap() = Some(encoded);
    }

    pub fn set_state(&self, state: UpgradeState) {
        self.status.status.lock().unwrap().state = state;
    }

    pub fn state(&self) -> UpgradeState {
        self.status.status.lock().unwrap().state
    }

    pub async fn reconcile(&self) -> Outcome {
        ensure_upgraded(&self.cluster, &self.ctx).await.unwrap()
    }

    /// Deployed and healthy: worker pool of `count` old-version instances
    /// with registered nodes, masters up to date
    pub fn steady_pool(&self, count: u32, worker_version: &str) {
        self.cloud.set_instances(WORKERS, (0..count).map(|i| instance(i, true)).collect());
        self.cloud.set_instances(MASTERS, vec![instance(0, true)]);
        let mut nodes: Vec<Node> = (0..count)
            .map(|i| node(&worker_node_name(i), worker_version))
            .collect();
        nodes.push(node(&format!("{MASTERS}-000000"), "2.0.0"));
        *self.tenant.nodes.nodes.lock().unwrap() = nodes;
    }
}
