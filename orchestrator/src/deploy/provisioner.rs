//! Node provisioner
//!
//! Creates one runtime resource per job and waits until it is reachable.
//! A failed job removes the resource it created; a failed batch also removes
//! every node the batch already brought up.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::converge::{wait_for, wait_until, Check};
use crate::deploy::{Backends, Options};
use crate::errors::{Context, OrchestratorError, Result};
use crate::image::Variant;
use crate::models::cluster::{NodeMeta, NodeRole, ProvisionedNode, Service};
use crate::runtime::{CreateNodeSpec, NodeFilter, RuntimeNode};
use crate::utils::generate_short_id;
use crate::wiring::dns::node_name;

/// Cluster-wide properties every node of a cluster carries
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTraits {
    pub cluster_id: String,
    pub purpose: String,
    pub expiry: Option<DateTime<Utc>>,
    pub custom_ca: bool,
    pub use_dns: bool,
}

impl ClusterTraits {
    /// Traits of the cluster `node` belongs to
    pub fn of_node(node: &ProvisionedNode) -> Self {
        Self {
            cluster_id: node.cluster_id.clone(),
            purpose: node.purpose.clone(),
            expiry: node.expiry,
            custom_ca: node.custom_ca,
            use_dns: node.use_dns,
        }
    }
}

/// One node to create
#[derive(Debug, Clone)]
pub struct NodeJob {
    /// Position in the request, starting at 1
    pub number: u32,
    pub role: NodeRole,
    pub image: String,
    /// Version the node starts on; empty for auxiliary nodes
    pub initial_version: String,
    pub variant: Variant,
    pub services: Vec<Service>,
    pub server_group: Option<String>,
    pub env: BTreeMap<String, String>,
    pub traits: ClusterTraits,
}

#[derive(Clone)]
pub struct Provisioner {
    backends: Backends,
    options: Arc<Options>,
}

impl Provisioner {
    pub fn new(backends: Backends, options: Arc<Options>) -> Self {
        Self { backends, options }
    }

    fn node_meta(&self, job: &NodeJob, node_id: String) -> NodeMeta {
        let dns_name = match (&self.backends.dns, job.traits.use_dns) {
            (Some(dns), true) => Some(node_name(&node_id, &job.traits.cluster_id, dns.hostname())),
            _ => None,
        };

        NodeMeta {
            cluster_id: job.traits.cluster_id.clone(),
            node_id,
            role: job.role,
            purpose: job.traits.purpose.clone(),
            creator: self.options.creator.clone(),
            expiry: job.traits.expiry,
            initial_version: job.initial_version.clone(),
            variant: job.variant,
            dns_name,
            services: job.services.clone(),
            server_group: job.server_group.clone(),
            custom_ca: job.traits.custom_ca,
            use_dns: job.traits.use_dns,
        }
    }

    /// Create one node and wait until it answers.
    ///
    /// The node id is fresh for every call. Readiness is polled without a
    /// deadline; cancel `cancel` to give up.
    pub async fn provision_node(
        &self,
        cancel: &CancellationToken,
        job: &NodeJob,
    ) -> Result<ProvisionedNode> {
        let node_id = generate_short_id();
        let meta = self.node_meta(job, node_id.clone());
        let spec = CreateNodeSpec {
            name: format!("ephemera-{}-{}-{}", job.traits.cluster_id, job.number, node_id),
            image: job.image.clone(),
            labels: meta.to_labels(),
            env: job.env.clone(),
        };

        info!(
            "Provisioning node {} ({}) #{} of cluster {}",
            node_id, job.role, job.number, job.traits.cluster_id
        );
        let created = self
            .backends
            .runtime
            .create_node(&spec)
            .await
            .with_context(|| format!("failed to create node {}", node_id))?;

        match self.await_ready(cancel, &created, meta).await {
            Ok(node) => {
                info!("Node {} is ready at {}", node.node_id, node.ip_address);
                Ok(node)
            }
            Err(e) => {
                warn!("Node {} failed to come up, removing it: {}", node_id, e);
                if let Err(remove_err) = self.backends.runtime.remove_node(&created.resource_id).await {
                    error!("Failed to remove node {}: {}", node_id, remove_err);
                }
                Err(e)
            }
        }
    }

    async fn await_ready(
        &self,
        cancel: &CancellationToken,
        created: &RuntimeNode,
        meta: NodeMeta,
    ) -> Result<ProvisionedNode> {
        let ip_address = match &created.ip_address {
            Some(ip) => ip.clone(),
            None => self.await_address(cancel, &meta.node_id).await?,
        };
        let node = ProvisionedNode::new(created.resource_id.clone(), ip_address, meta);

        if node.is_member() {
            let admin = self.backends.admin.connect(&node.ip_address)?;
            let what = format!("node {} to answer", node.node_id);
            wait_until(cancel, &self.options.readiness_poll, &what, || {
                let admin = admin.clone();
                async move { admin.ping().await.map(|_| true) }
            })
            .await?;
        }

        Ok(node)
    }

    async fn await_address(&self, cancel: &CancellationToken, node_id: &str) -> Result<String> {
        let runtime = self.backends.runtime.clone();
        let filter = NodeFilter::node(node_id);
        let what = format!("address of node {}", node_id);

        let found = wait_for(
            cancel,
            &self.options.readiness_poll,
            &what,
            || {
                let runtime = runtime.clone();
                let filter = filter.clone();
                async move { Ok(runtime.list_nodes(&filter).await?.into_iter().next()) }
            },
            |node: &Option<RuntimeNode>| match node {
                None => Check::Fail(OrchestratorError::ResourceVanished {
                    what: format!("node {}", node_id),
                    desired: "running".to_string(),
                }),
                Some(n) if n.ip_address.is_some() => Check::Converged,
                Some(_) => Check::Pending,
            },
        )
        .await?;

        found
            .and_then(|n| n.ip_address)
            .ok_or_else(|| OrchestratorError::Internal(format!("node {} has no address", node_id)))
    }

    /// Provision every job concurrently.
    ///
    /// The first failure cancels the remaining jobs, waits for all of them to
    /// finish and removes every node that did come up. Nodes are returned in
    /// completion order.
    pub async fn provision_many(
        &self,
        cancel: &CancellationToken,
        jobs: Vec<NodeJob>,
    ) -> Result<Vec<ProvisionedNode>> {
        let batch = cancel.child_token();
        let mut tasks = JoinSet::new();
        for job in jobs {
            let provisioner = self.clone();
            let token = batch.clone();
            tasks.spawn(async move { provisioner.provision_node(&token, &job).await });
        }

        let mut nodes = Vec::new();
        let mut first_error: Option<OrchestratorError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| {
                OrchestratorError::Internal(format!("provisioning task failed: {}", e))
            });
            match result.and_then(|r| r) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    if first_error.is_none() {
                        error!("Provisioning failed, cancelling remaining nodes: {}", e);
                        batch.cancel();
                        first_error = Some(e);
                    } else {
                        debug!("Provisioning task ended after cancellation: {}", e);
                    }
                }
            }
        }

        match first_error {
            None => Ok(nodes),
            Some(e) => {
                self.destroy(&nodes).await;
                Err(e)
            }
        }
    }

    /// Best-effort removal of `nodes`
    pub async fn destroy(&self, nodes: &[ProvisionedNode]) {
        for node in nodes {
            if let Err(e) = self.backends.runtime.remove_node(&node.resource_id).await {
                error!("Failed to remove node {}: {}", node.node_id, e);
            }
        }
    }
}
