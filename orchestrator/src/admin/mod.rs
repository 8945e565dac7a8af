//! Per-node administrative API

pub mod client;

use std::sync::Arc;

use admin_api::models::{
    AddNodeRequest, MemoryQuotaRequest, PoolDefaultResponse, PoolsResponse, RebalanceRequest,
    TaskInfo, TrustedCa,
};
use async_trait::async_trait;

use crate::errors::Result;

/// Administrative operations on one node
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Address this client talks to
    fn address(&self) -> &str;

    /// Answers as soon as the node's management endpoint is up
    async fn ping(&self) -> Result<PoolsResponse>;

    async fn set_memory_quotas(&self, quotas: &MemoryQuotaRequest) -> Result<()>;

    /// `services` is the comma-separated admin service list
    async fn setup_services(&self, services: &str) -> Result<()>;

    /// `ipv4` or `ipv6`
    async fn setup_net_config(&self, address_family: &str) -> Result<()>;

    async fn set_index_storage_mode(&self, mode: &str) -> Result<()>;

    /// Install the administrative credentials, finishing node initialization
    async fn set_web_credentials(&self) -> Result<()>;

    async fn add_node(&self, request: &AddNodeRequest) -> Result<()>;

    async fn rebalance(&self, request: &RebalanceRequest) -> Result<()>;

    async fn tasks(&self) -> Result<Vec<TaskInfo>>;

    /// Cluster membership as seen by this node
    async fn pool_default(&self) -> Result<PoolDefaultResponse>;

    /// Load CA certificates dropped in the node's inbox
    async fn load_trusted_cas(&self) -> Result<()>;

    /// Reload the node certificate and key from the inbox
    async fn reload_certificate(&self) -> Result<()>;

    async fn trusted_cas(&self) -> Result<Vec<TrustedCa>>;

    async fn delete_trusted_ca(&self, id: i64) -> Result<()>;
}

/// Opens an administrative client for a node address
pub trait AdminConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn AdminApi>>;
}
