//! Cluster views derived from the runtime
//!
//! Nothing here is persisted. A view is valid at the moment it was fetched and
//! must be re-fetched before every mutating step.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use admin_api::models::NodeInfo;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::admin::AdminConnector;
use crate::errors::Result;
use crate::models::cluster::{NodeMeta, NodeRole, ProvisionedNode};
use crate::runtime::{NodeFilter, RuntimeBackend, RuntimeNode};

/// All live nodes sharing one cluster id
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    pub cluster_id: String,
    pub nodes: Vec<ProvisionedNode>,
}

impl ClusterView {
    pub fn members(&self) -> impl Iterator<Item = &ProvisionedNode> {
        self.nodes.iter().filter(|n| n.is_member())
    }

    pub fn load_balancer(&self) -> Option<&ProvisionedNode> {
        self.nodes.iter().find(|n| n.role == NodeRole::LoadBalancer)
    }

    pub fn node(&self, node_id: &str) -> Option<&ProvisionedNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Earliest expiry of any node
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.nodes.iter().filter_map(|n| n.expiry).min()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry().map(|e| e <= now).unwrap_or(false)
    }

    fn first_node(&self) -> Option<&ProvisionedNode> {
        self.members().next().or_else(|| self.nodes.first())
    }

    pub fn purpose(&self) -> &str {
        self.first_node().map(|n| n.purpose.as_str()).unwrap_or("")
    }

    pub fn uses_custom_ca(&self) -> bool {
        self.first_node().map(|n| n.custom_ca).unwrap_or(false)
    }

    pub fn uses_dns(&self) -> bool {
        self.first_node().map(|n| n.use_dns).unwrap_or(false)
    }
}

fn into_provisioned(node: RuntimeNode) -> Option<ProvisionedNode> {
    let meta = NodeMeta::from_labels(&node.labels)?;
    Some(ProvisionedNode::new(
        node.resource_id,
        node.ip_address.unwrap_or_default(),
        meta,
    ))
}

/// Group runtime nodes by their cluster label, ordered by cluster id
pub fn group_nodes(nodes: Vec<RuntimeNode>) -> Vec<ClusterView> {
    let mut clusters: BTreeMap<String, Vec<ProvisionedNode>> = BTreeMap::new();
    for node in nodes.into_iter().filter_map(into_provisioned) {
        clusters.entry(node.cluster_id.clone()).or_default().push(node);
    }

    clusters
        .into_iter()
        .map(|(cluster_id, mut nodes)| {
            nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            ClusterView { cluster_id, nodes }
        })
        .collect()
}

pub async fn list_clusters(runtime: &dyn RuntimeBackend) -> Result<Vec<ClusterView>> {
    let nodes = runtime.list_nodes(&NodeFilter::all()).await?;
    Ok(group_nodes(nodes))
}

/// `None` when no node carries the cluster id
pub async fn fetch_view(runtime: &dyn RuntimeBackend, cluster_id: &str) -> Result<Option<ClusterView>> {
    let nodes = runtime.list_nodes(&NodeFilter::cluster(cluster_id)).await?;
    Ok(group_nodes(nodes)
        .into_iter()
        .find(|v| v.cluster_id == cluster_id))
}

/// Live administrative status of one member
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    /// Internal identity; `None` before the node joined a cluster
    pub otp_node: Option<String>,

    /// As reported by the node itself; may be empty
    pub health: String,

    pub membership: String,

    /// Added but not yet rebalanced in, or the cluster reports itself unbalanced
    pub needs_rebalance: bool,

    /// Members as seen by this node
    pub cluster_nodes: Vec<NodeInfo>,
}

/// Why a member's status could not be fetched
#[derive(Debug, Clone, Serialize)]
pub struct StatusUnknown {
    pub reason: String,
}

/// Lifecycle state, derived from a view and never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Members exist but none answers yet
    Provisioning,
    Ready,
    /// A rebalance is pending or running
    Reconciling,
    /// Some member is unreachable or unhealthy
    Degraded,
    /// No node is left
    Removed,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterState::Provisioning => "provisioning",
            ClusterState::Ready => "ready",
            ClusterState::Reconciling => "reconciling",
            ClusterState::Degraded => "degraded",
            ClusterState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A view enriched with every member's live status
#[derive(Debug, Clone, Serialize)]
pub struct ClusterViewEx {
    pub view: ClusterView,

    /// Keyed by node id; members only
    #[serde(serialize_with = "serialize_statuses")]
    pub statuses: BTreeMap<String, std::result::Result<NodeStatus, StatusUnknown>>,
}

fn serialize_statuses<S>(
    statuses: &BTreeMap<String, std::result::Result<NodeStatus, StatusUnknown>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(statuses.len()))?;
    for (node_id, status) in statuses {
        match status {
            Ok(status) => map.serialize_entry(node_id, status)?,
            Err(unknown) => map.serialize_entry(node_id, unknown)?,
        }
    }
    map.end()
}

impl ClusterViewEx {
    pub fn status(&self, node_id: &str) -> Option<&NodeStatus> {
        self.statuses.get(node_id).and_then(|s| s.as_ref().ok())
    }

    pub fn state(&self) -> ClusterState {
        let members: Vec<&ProvisionedNode> = self.view.members().collect();
        if self.view.nodes.is_empty() {
            return ClusterState::Removed;
        }
        if !members.is_empty() && members.iter().all(|m| self.status(&m.node_id).is_none()) {
            return ClusterState::Provisioning;
        }
        if members
            .iter()
            .filter_map(|m| self.status(&m.node_id))
            .any(|s| s.needs_rebalance)
        {
            return ClusterState::Reconciling;
        }
        let degraded = members.iter().any(|m| match self.status(&m.node_id) {
            None => true,
            Some(s) => !(s.health.is_empty() || s.health == "healthy"),
        });
        if degraded {
            ClusterState::Degraded
        } else {
            ClusterState::Ready
        }
    }
}

async fn fetch_status(
    connector: &dyn AdminConnector,
    node: &ProvisionedNode,
) -> std::result::Result<NodeStatus, StatusUnknown> {
    let unknown = |reason: String| StatusUnknown { reason };

    if node.ip_address.is_empty() {
        return Err(unknown("no network address".to_string()));
    }
    let admin = connector
        .connect(&node.ip_address)
        .map_err(|e| unknown(e.to_string()))?;
    let pool = admin
        .pool_default()
        .await
        .map_err(|e| unknown(e.to_string()))?;

    let this_node = pool.this_node().cloned().unwrap_or_default();
    Ok(NodeStatus {
        otp_node: Some(this_node.otp_node.clone()).filter(|o| !o.is_empty()),
        health: this_node.status.clone(),
        membership: this_node.cluster_membership.clone(),
        needs_rebalance: this_node.is_pending_rebalance() || !pool.balanced,
        cluster_nodes: pool.nodes,
    })
}

/// Fetch a view and every member's status concurrently.
///
/// A member that does not answer is recorded as [`StatusUnknown`]; it never
/// fails the fetch. Only the runtime listing itself can fail.
pub async fn fetch_view_ex(
    runtime: &dyn RuntimeBackend,
    connector: &Arc<dyn AdminConnector>,
    cluster_id: &str,
) -> Result<ClusterViewEx> {
    let view = fetch_view(runtime, cluster_id)
        .await?
        .unwrap_or_else(|| ClusterView {
            cluster_id: cluster_id.to_string(),
            nodes: Vec::new(),
        });

    let members: Vec<&ProvisionedNode> = view.members().collect();
    let results = join_all(members.iter().map(|m| fetch_status(connector.as_ref(), m))).await;

    let mut statuses = BTreeMap::new();
    for (member, status) in members.iter().zip(results) {
        if let Err(unknown) = &status {
            debug!("Status of {} unknown: {}", member.node_id, unknown.reason);
        }
        statuses.insert(member.node_id.clone(), status);
    }

    Ok(ClusterViewEx { view, statuses })
}
