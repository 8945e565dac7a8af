//! API models

use serde::{Deserialize, Serialize};

/// `GET /pools` response, answered even before the node is initialized
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolsResponse {
    #[serde(default)]
    pub implementation_version: String,
    #[serde(default)]
    pub is_admin_creds: bool,
}

/// One member as reported by `GET /pools/default`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Internal node identity, e.g. `ns_1@10.0.0.2`
    #[serde(default)]
    pub otp_node: String,

    /// `host:port` the member is reachable on
    #[serde(default)]
    pub hostname: String,

    /// `healthy`, `unhealthy`, `warmup` or empty
    #[serde(default)]
    pub status: String,

    /// `active`, `inactiveAdded` or `inactiveFailed`
    #[serde(default)]
    pub cluster_membership: String,

    /// Set on the entry describing the node that answered the request
    #[serde(default)]
    pub this_node: bool,

    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default)]
    pub version: String,
}

impl NodeInfo {
    /// Added to the cluster but not yet rebalanced in
    pub fn is_pending_rebalance(&self) -> bool {
        self.cluster_membership == "inactiveAdded"
    }
}

/// `GET /pools/default` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDefaultResponse {
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,

    /// False while the cluster still needs a rebalance
    #[serde(default = "default_true")]
    pub balanced: bool,
}

fn default_true() -> bool {
    true
}

impl PoolDefaultResponse {
    /// The entry describing the answering node
    pub fn this_node(&self) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.this_node)
    }
}

/// One entry of `GET /pools/default/tasks`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    #[serde(rename = "type", default)]
    pub task_type: String,

    /// `running` while in progress, `notRunning` otherwise
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub progress: Option<f64>,
}

impl TaskInfo {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// One entry of `GET /pools/default/trustedCAs`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedCa {
    pub id: i64,

    #[serde(default)]
    pub subject: String,

    /// `generated` for the node's own self-signed anchor
    #[serde(rename = "type", default)]
    pub ca_type: String,

    #[serde(default)]
    pub pem: String,
}

/// Form body for `POST /pools/default`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQuotaRequest {
    pub memory_quota: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub index_memory_quota: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub fts_memory_quota: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub cbas_memory_quota: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub eventing_memory_quota: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Form body for `POST /controller/addNode`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub hostname: String,
    pub user: String,
    pub password: String,
    pub services: String,
    #[serde(rename = "groupName", skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// Form body for `POST /controller/rebalance`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequest {
    /// Comma-separated OTP identities of every member
    pub known_nodes: String,

    /// Comma-separated OTP identities to eject
    pub ejected_nodes: String,
}

/// Error body returned by most failing admin endpoints.
///
/// `errors` is either a list of messages or an object keyed by the
/// offending field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub errors: serde_json::Value,
}

impl ErrorResponse {
    /// Flatten the reported errors into one line, `None` when there are none
    pub fn message(&self) -> Option<String> {
        let text = |v: &serde_json::Value| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let parts: Vec<String> = match &self.errors {
            serde_json::Value::Array(items) => items.iter().map(text).collect(),
            serde_json::Value::Object(fields) => fields
                .iter()
                .map(|(field, v)| format!("{}: {}", field, text(v)))
                .collect(),
            serde_json::Value::String(s) => vec![s.clone()],
            _ => Vec::new(),
        };
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}
