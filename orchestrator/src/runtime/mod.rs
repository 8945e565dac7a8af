//! Runtime backends
//!
//! A backend owns the compute resources nodes run on. Every backend can list,
//! create and remove nodes; optional operations are advertised through
//! [`Capabilities`] and fail with [`OrchestratorError::Unsupported`] when absent.

pub mod docker;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;

use crate::errors::{OrchestratorError, Result};
use crate::models::cluster::labels;

/// Optional backend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Copy files into and out of a running node
    CopyFiles,

    /// Build images locally from another image
    DerivedImages,

    /// Restart a node in place, keeping its address
    Restart,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::CopyFiles => f.write_str("copy-files"),
            Capability::DerivedImages => f.write_str("derived-images"),
            Capability::Restart => f.write_str("restart"),
        }
    }
}

/// Set of capabilities a backend supports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self::none()
            .with(Capability::CopyFiles)
            .with(Capability::DerivedImages)
            .with(Capability::Restart)
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

pub fn unsupported(backend: &str, capability: Capability) -> OrchestratorError {
    OrchestratorError::Unsupported {
        backend: backend.to_string(),
        capability: capability.to_string(),
    }
}

/// Fail with `Unsupported` unless the backend advertises `capability`
pub fn require(backend: &dyn RuntimeBackend, capability: Capability) -> Result<()> {
    if backend.capabilities().supports(capability) {
        Ok(())
    } else {
        Err(unsupported(backend.name(), capability))
    }
}

/// Label selector for [`RuntimeBackend::list_nodes`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    pub cluster_id: Option<String>,
    pub node_id: Option<String>,
}

impl NodeFilter {
    /// Every node carrying our labels
    pub fn all() -> Self {
        Self::default()
    }

    pub fn cluster(cluster_id: &str) -> Self {
        Self {
            cluster_id: Some(cluster_id.to_string()),
            node_id: None,
        }
    }

    pub fn node(node_id: &str) -> Self {
        Self {
            cluster_id: None,
            node_id: Some(node_id.to_string()),
        }
    }

    pub fn matches(&self, node_labels: &HashMap<String, String>) -> bool {
        let matches = |key: &str, want: &Option<String>| match want {
            Some(want) => node_labels.get(key) == Some(want),
            None => true,
        };
        node_labels.contains_key(labels::CLUSTER_ID)
            && matches(labels::CLUSTER_ID, &self.cluster_id)
            && matches(labels::NODE_ID, &self.node_id)
    }
}

/// Everything needed to create and start one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNodeSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

/// A node as the runtime reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeNode {
    pub resource_id: String,
    pub name: String,
    /// Assigned once the node is attached to its network
    pub ip_address: Option<String>,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<RuntimeNode>>;

    /// Create and start a node
    async fn create_node(&self, spec: &CreateNodeSpec) -> Result<RuntimeNode>;

    /// Remove a node; removing an absent node succeeds
    async fn remove_node(&self, resource_id: &str) -> Result<()>;

    async fn restart_node(&self, _resource_id: &str) -> Result<()> {
        Err(unsupported(self.name(), Capability::Restart))
    }

    async fn copy_to_node(&self, _resource_id: &str, _path: &str, _contents: &[u8]) -> Result<()> {
        Err(unsupported(self.name(), Capability::CopyFiles))
    }

    /// `None` when the file does not exist on the node
    async fn copy_from_node(&self, _resource_id: &str, _path: &str) -> Result<Option<Vec<u8>>> {
        Err(unsupported(self.name(), Capability::CopyFiles))
    }
}
