//! Node lifecycle: correlating scale set instances with tenant cluster nodes.
//!
//! Instances and nodes are matched by name. A node's name is the instance's
//! computer name, which Azure derives from the scale set's computer name
//! prefix and the base-36 instance id.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{AzureCluster, DrainerConfig};
use crate::scale::VmssInstance;
use crate::{Error, Result, FIELD_MANAGER};

/// Label carrying the operator version a node was provisioned with
pub const NODE_VERSION_LABEL: &str = "upgrade.vmss.dev/operator-version";

/// Label marking control plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Node operations against a tenant cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// All nodes of the tenant cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Mark a node unschedulable
    async fn cordon(&self, name: &str) -> Result<()>;
}

/// Resolves a node client for a tenant cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantClients: Send + Sync {
    /// `None` while the tenant API is not reachable yet
    async fn node_client(&self, cluster: &AzureCluster) -> Result<Option<Arc<dyn NodeClient>>>;
}

/// Node name of a scale set instance.
///
/// Uses the reported computer name when present, else derives it the way
/// Azure does: prefix followed by the instance id in six base-36 digits.
pub fn node_name(name_prefix: &str, instance: &VmssInstance) -> String {
    if let Some(name) = instance.computer_name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_lowercase();
    }
    let id = instance.instance_id.parse::<u64>().unwrap_or_default();
    format!("{}{}", name_prefix, base36(id, 6))
}

fn base36(mut value: u64, width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// True if the node reports `Ready=True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// True if the node is already cordoned
pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// True for nodes without the control plane role
pub fn is_worker(node: &Node) -> bool {
    !node
        .metadata
        .labels
        .as_ref()
        .map(|l| l.contains_key(CONTROL_PLANE_LABEL))
        .unwrap_or(false)
}

/// Operator version of each node, keyed by node name
pub fn node_versions(nodes: &[Node]) -> BTreeMap<String, String> {
    nodes
        .iter()
        .filter_map(|n| {
            let version = n.labels().get(NODE_VERSION_LABEL)?;
            Some((n.name_any(), version.clone()))
        })
        .collect()
}

/// Worker instances split by whether they run the latest model
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classification {
    /// Instances on an outdated model
    pub old: Vec<VmssInstance>,
    /// Instances on the latest model
    pub new: Vec<VmssInstance>,
}

impl Classification {
    /// Split instances into old and new
    pub fn of(instances: &[VmssInstance]) -> Self {
        let (new, old): (Vec<_>, Vec<_>) = instances
            .iter()
            .cloned()
            .partition(|i| i.latest_model_applied);
        Self { old, new }
    }

    /// Instance ids of the old instances
    pub fn old_instance_ids(&self) -> Vec<String> {
        self.old.iter().map(|i| i.instance_id.clone()).collect()
    }

    /// Number of (old, new) instances whose node has registered
    pub fn registered_counts(&self, name_prefix: &str, nodes: &[Node]) -> (usize, usize) {
        let registered: HashSet<String> = nodes.iter().map(|n| n.name_any()).collect();
        let count = |set: &[VmssInstance]| {
            set.iter()
                .filter(|i| registered.contains(&node_name(name_prefix, i)))
                .count()
        };
        (count(&self.old), count(&self.new))
    }
}

/// Instances to act on during one loop.
///
/// At most one kind of action is selected per loop. Each variant carries at
/// most the batch size of instances.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkingSet {
    /// Nothing left to replace
    Idle,
    /// Instances still provisioning; nothing else may start
    InProgress(Vec<VmssInstance>),
    /// Instances that must get the latest model
    Update(Vec<VmssInstance>),
    /// Outdated nodes that need a DrainerConfig
    Drain(Vec<VmssInstance>),
    /// Drained outdated instances, ready to be reimaged or removed
    Reimage(Vec<VmssInstance>),
}

impl WorkingSet {
    /// Instances carried by this working set
    pub fn instances(&self) -> &[VmssInstance] {
        match self {
            Self::Idle => &[],
            Self::InProgress(v) | Self::Update(v) | Self::Drain(v) | Self::Reimage(v) => v,
        }
    }
}

/// How outdated instances of a pool get replaced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replacement {
    /// Update the model, drain, reimage. An instance is outdated when its
    /// node runs another operator version. A drained batch is reimaged before
    /// the next batch is drained.
    InPlace {
        /// Instances per loop
        batch: usize,
    },
    /// Replacements already run next to the old instances. An instance is
    /// outdated when it misses the latest model, and every outdated node is
    /// drained before any of them is handed out for removal.
    Surge {
        /// Instances per loop
        batch: usize,
    },
}

impl Replacement {
    fn batch(&self) -> usize {
        match *self {
            Self::InPlace { batch } | Self::Surge { batch } => batch.max(1),
        }
    }
}

/// Pick the instances to act on this loop.
///
/// Priority: instances still provisioning block everything, then (in place
/// only) instances without the latest model, then outdated instances
/// (reimaged once drained, drained otherwise). With [`Replacement::InPlace`]
/// instances whose node has not registered a version are skipped.
pub fn select_working_set(
    instances: &[VmssInstance],
    drainers: &[DrainerConfig],
    desired_version: &str,
    versions: &BTreeMap<String, String>,
    name_prefix: &str,
    replacement: Replacement,
) -> WorkingSet {
    let batch = replacement.batch();
    let take = |it: Vec<&VmssInstance>| -> Vec<VmssInstance> {
        it.into_iter().take(batch).cloned().collect()
    };

    let in_progress: Vec<_> = instances
        .iter()
        .filter(|i| !i.provisioning_state.is_final())
        .collect();
    if !in_progress.is_empty() {
        return WorkingSet::InProgress(take(in_progress));
    }

    if let Replacement::InPlace { .. } = replacement {
        let outdated_model: Vec<_> = instances
            .iter()
            .filter(|i| !i.latest_model_applied)
            .collect();
        if !outdated_model.is_empty() {
            return WorkingSet::Update(take(outdated_model));
        }
    }

    let drained: HashSet<String> = drainers
        .iter()
        .filter(|d| d.is_drained())
        .map(|d| d.spec.node_name.clone())
        .collect();

    let mut to_reimage = Vec::new();
    let mut to_drain = Vec::new();
    for instance in instances {
        let name = node_name(name_prefix, instance);
        let outdated = match replacement {
            Replacement::InPlace { .. } => {
                matches!(versions.get(&name), Some(version) if version != desired_version)
            }
            Replacement::Surge { .. } => !instance.latest_model_applied,
        };
        if !outdated {
            continue;
        }
        if drained.contains(&name) {
            to_reimage.push(instance);
        } else {
            to_drain.push(instance);
        }
    }

    match replacement {
        Replacement::InPlace { .. } if !to_reimage.is_empty() => {
            WorkingSet::Reimage(take(to_reimage))
        }
        _ if !to_drain.is_empty() => WorkingSet::Drain(take(to_drain)),
        _ if !to_reimage.is_empty() => WorkingSet::Reimage(take(to_reimage)),
        _ => WorkingSet::Idle,
    }
}

// =============================================================================
// Kubernetes-backed implementations
// =============================================================================

/// Node client backed by a tenant cluster kube client
pub struct KubeNodeClient {
    client: Client,
}

impl KubeNodeClient {
    /// Create a new KubeNodeClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn cordon(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "unschedulable": true } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Builds tenant clients from the `<cluster>-kubeconfig` Secret
pub struct KubeTenantClients {
    client: Client,
}

impl KubeTenantClients {
    /// Create a new KubeTenantClients reading Secrets through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TenantClients for KubeTenantClients {
    async fn node_client(&self, cluster: &AzureCluster) -> Result<Option<Arc<dyn NodeClient>>> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let secret_name = format!("{}-kubeconfig", cluster.spec.cluster_id);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let Some(secret) = api.get_opt(&secret_name).await? else {
            debug!(secret = %secret_name, "tenant kubeconfig not available yet");
            return Ok(None);
        };

        let Some(data) = secret
            .data
            .as_ref()
            .and_then(|d| d.get("kubeconfig").or_else(|| d.get("value")))
        else {
            warn!(secret = %secret_name, "tenant kubeconfig secret has no kubeconfig key");
            return Ok(None);
        };

        let yaml = String::from_utf8(data.0.clone())
            .map_err(|e| Error::serialization(format!("tenant kubeconfig: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| Error::serialization(format!("tenant kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::internal("tenant_client", format!("failed to load kubeconfig: {e}"))
            })?;
        let client = Client::try_from(config).map_err(|e| {
            Error::internal("tenant_client", format!("failed to create client: {e}"))
        })?;

        let nodes: Arc<dyn NodeClient> = Arc::new(KubeNodeClient::new(client));
        Ok(Some(nodes))
    }
}
