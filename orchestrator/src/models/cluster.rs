//! Cluster and node models

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::image::Variant;

/// Runtime labels carried by every node. All durable cluster state lives here.
pub mod labels {
    pub const CLUSTER_ID: &str = "ephemera.cluster-id";
    pub const NODE_ID: &str = "ephemera.node-id";
    pub const PURPOSE: &str = "ephemera.purpose";
    pub const CREATOR: &str = "ephemera.creator";
    pub const EXPIRY: &str = "ephemera.expiry";
    pub const ROLE: &str = "ephemera.role";
    pub const INITIAL_VERSION: &str = "ephemera.initial-version";
    pub const VARIANT: &str = "ephemera.variant";
    pub const DNS_NAME: &str = "ephemera.dns-name";
    pub const SERVICES: &str = "ephemera.services";
    pub const SERVER_GROUP: &str = "ephemera.server-group";
    pub const CUSTOM_CA: &str = "ephemera.custom-ca";
    pub const USE_DNS: &str = "ephemera.use-dns";
}

/// Role of a node within its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ClusterMember,
    LoadBalancer,
    BlobStoreMock,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ClusterMember => "cluster-member",
            NodeRole::LoadBalancer => "load-balancer",
            NodeRole::BlobStoreMock => "blob-store-mock",
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster-member" => Ok(NodeRole::ClusterMember),
            "load-balancer" => Ok(NodeRole::LoadBalancer),
            "blob-store-mock" => Ok(NodeRole::BlobStoreMock),
            other => Err(format!("unknown node role: {}", other)),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database service enabled on a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Kv,
    Query,
    Index,
    Search,
    Analytics,
    Eventing,
    Backup,
}

impl Service {
    /// Name used by the administrative API
    pub fn admin_name(&self) -> &'static str {
        match self {
            Service::Kv => "kv",
            Service::Query => "n1ql",
            Service::Index => "index",
            Service::Search => "fts",
            Service::Analytics => "cbas",
            Service::Eventing => "eventing",
            Service::Backup => "backup",
        }
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "kv" | "data" => Ok(Service::Kv),
            "n1ql" | "query" => Ok(Service::Query),
            "index" => Ok(Service::Index),
            "fts" | "search" => Ok(Service::Search),
            "cbas" | "analytics" => Ok(Service::Analytics),
            "eventing" => Ok(Service::Eventing),
            "backup" => Ok(Service::Backup),
            other => Err(format!("unknown service: {}", other)),
        }
    }
}

pub fn default_services() -> Vec<Service> {
    vec![Service::Kv, Service::Query, Service::Index, Service::Search]
}

/// Comma-separated admin names, as the administrative API expects them
pub fn admin_service_list<'a>(services: impl IntoIterator<Item = &'a Service>) -> String {
    services
        .into_iter()
        .map(|s| s.admin_name())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_service_list(value: &str) -> Vec<Service> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// One group of identical nodes in a topology request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupSpec {
    pub count: u32,

    /// Version specifier, see [`crate::image::ImageDef::parse`]
    pub version: String,

    #[serde(default = "default_services")]
    pub services: Vec<Service>,

    #[serde(default)]
    pub server_group: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Ordered node groups of a cluster
pub type TopologyRequest = Vec<NodeGroupSpec>;

/// A complete cluster request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDef {
    #[serde(default)]
    pub purpose: String,

    /// Lifetime in seconds; the configured default when absent
    #[serde(default)]
    pub expiry_secs: Option<u64>,

    pub groups: TopologyRequest,

    #[serde(default)]
    pub load_balancer: bool,

    #[serde(default)]
    pub blob_store_mock: bool,

    /// Issue every member a certificate from a per-cluster CA
    #[serde(default)]
    pub use_custom_ca: bool,

    #[serde(default)]
    pub use_dns: bool,
}

impl ClusterDef {
    /// Union of the services of every group
    pub fn cluster_services(&self) -> BTreeSet<Service> {
        self.groups
            .iter()
            .flat_map(|g| g.services.iter().copied())
            .collect()
    }

    pub fn member_count(&self) -> u32 {
        self.groups.iter().map(|g| g.count).sum()
    }
}

/// Metadata written to a node's labels at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub cluster_id: String,
    pub node_id: String,
    pub role: NodeRole,
    pub purpose: String,
    pub creator: String,
    pub expiry: Option<DateTime<Utc>>,
    pub initial_version: String,
    pub variant: Variant,
    pub dns_name: Option<String>,
    pub services: Vec<Service>,
    pub server_group: Option<String>,
    pub custom_ca: bool,
    pub use_dns: bool,
}

impl NodeMeta {
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(labels::CLUSTER_ID.to_string(), self.cluster_id.clone());
        out.insert(labels::NODE_ID.to_string(), self.node_id.clone());
        out.insert(labels::ROLE.to_string(), self.role.to_string());
        out.insert(labels::PURPOSE.to_string(), self.purpose.clone());
        out.insert(labels::CREATOR.to_string(), self.creator.clone());
        if let Some(expiry) = &self.expiry {
            out.insert(labels::EXPIRY.to_string(), expiry.to_rfc3339());
        }
        out.insert(
            labels::INITIAL_VERSION.to_string(),
            self.initial_version.clone(),
        );
        let variant = if self.variant.is_serverless() {
            "serverless"
        } else {
            "standard"
        };
        out.insert(labels::VARIANT.to_string(), variant.to_string());
        if let Some(dns_name) = &self.dns_name {
            out.insert(labels::DNS_NAME.to_string(), dns_name.clone());
        }
        if !self.services.is_empty() {
            out.insert(
                labels::SERVICES.to_string(),
                admin_service_list(&self.services),
            );
        }
        if let Some(group) = &self.server_group {
            out.insert(labels::SERVER_GROUP.to_string(), group.clone());
        }
        out.insert(labels::CUSTOM_CA.to_string(), self.custom_ca.to_string());
        out.insert(labels::USE_DNS.to_string(), self.use_dns.to_string());
        out
    }

    /// `None` when the labels do not describe one of our nodes
    pub fn from_labels(labels: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| labels.get(key).cloned();
        let flag = |key: &str| labels.get(key).map(|v| v == "true").unwrap_or(false);

        Some(Self {
            cluster_id: get(labels::CLUSTER_ID)?,
            node_id: get(labels::NODE_ID)?,
            role: labels
                .get(labels::ROLE)
                .and_then(|r| r.parse().ok())
                .unwrap_or(NodeRole::ClusterMember),
            purpose: get(labels::PURPOSE).unwrap_or_default(),
            creator: get(labels::CREATOR).unwrap_or_default(),
            expiry: labels
                .get(labels::EXPIRY)
                .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
                .map(|e| e.with_timezone(&Utc)),
            initial_version: get(labels::INITIAL_VERSION).unwrap_or_default(),
            variant: match labels.get(labels::VARIANT).map(String::as_str) {
                Some("serverless") => Variant::Serverless,
                _ => Variant::Standard,
            },
            dns_name: get(labels::DNS_NAME),
            services: labels
                .get(labels::SERVICES)
                .map(|s| parse_service_list(s))
                .unwrap_or_default(),
            server_group: get(labels::SERVER_GROUP),
            custom_ca: flag(labels::CUSTOM_CA),
            use_dns: flag(labels::USE_DNS),
        })
    }
}

/// A node that exists in the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedNode {
    /// Assigned at creation, never reused
    pub node_id: String,

    /// Runtime handle of the backing resource
    pub resource_id: String,

    pub ip_address: String,
    pub role: NodeRole,
    pub initial_version: String,
    pub dns_name: Option<String>,

    pub cluster_id: String,
    pub purpose: String,
    pub creator: String,
    pub expiry: Option<DateTime<Utc>>,
    pub variant: Variant,
    pub services: Vec<Service>,
    pub server_group: Option<String>,
    pub custom_ca: bool,
    pub use_dns: bool,
}

impl ProvisionedNode {
    pub fn new(resource_id: String, ip_address: String, meta: NodeMeta) -> Self {
        Self {
            node_id: meta.node_id,
            resource_id,
            ip_address,
            role: meta.role,
            initial_version: meta.initial_version,
            dns_name: meta.dns_name,
            cluster_id: meta.cluster_id,
            purpose: meta.purpose,
            creator: meta.creator,
            expiry: meta.expiry,
            variant: meta.variant,
            services: meta.services,
            server_group: meta.server_group,
            custom_ca: meta.custom_ca,
            use_dns: meta.use_dns,
        }
    }

    pub fn is_member(&self) -> bool {
        self.role == NodeRole::ClusterMember
    }

    /// Whether `hostname` (`host[:port]`, as reported by the admin API) names this node
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let host = if let Some(rest) = hostname.strip_prefix('[') {
            rest.split(']').next().unwrap_or(rest)
        } else if hostname.matches(':').count() == 1 {
            hostname.split(':').next().unwrap_or(hostname)
        } else {
            hostname
        };
        host == self.ip_address
    }
}

/// Requested topology change of a running cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalancePlan {
    #[serde(default)]
    pub node_groups_to_add: Vec<NodeGroupSpec>,

    /// Node ids to eject and destroy
    #[serde(default)]
    pub nodes_to_remove: Vec<String>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.node_groups_to_add.is_empty() && self.nodes_to_remove.is_empty()
    }
}
