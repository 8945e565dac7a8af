//! Cluster bootstrapper
//!
//! Turns a set of ready, unconfigured nodes into one cluster:
//! initialize the first node, add the others to it, rebalance, and wait for
//! the rebalance to finish. Cleanup on failure is left to the caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use admin_api::models::{AddNodeRequest, MemoryQuotaRequest, RebalanceRequest};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admin::AdminApi;
use crate::converge::{wait_until, PollOptions};
use crate::deploy::fsm::{BootstrapEvent, BootstrapFsm, BootstrapState};
use crate::deploy::{Backends, Options};
use crate::errors::{Context, OrchestratorError, Result};
use crate::models::cluster::{admin_service_list, ProvisionedNode, Service};
use crate::storage::settings::MemoryQuotaSettings;

const MIN_KV_QUOTA: u64 = 256;
const MIN_INDEX_QUOTA: u64 = 256;
const MIN_FTS_QUOTA: u64 = 256;
const MIN_CBAS_QUOTA: u64 = 1024;
const MIN_EVENTING_QUOTA: u64 = 256;

fn quota_for(
    service: Service,
    configured: u64,
    minimum: u64,
    cluster_services: &BTreeSet<Service>,
) -> u64 {
    if !cluster_services.contains(&service) {
        return 0;
    }
    if configured < minimum {
        warn!(
            "Memory quota of {} raised from {} to the minimum of {} MiB",
            service.admin_name(),
            configured,
            minimum
        );
        return minimum;
    }
    configured
}

/// Per-service quotas with minimums enforced; services absent from the
/// cluster get no quota
pub fn memory_quotas(
    configured: &MemoryQuotaSettings,
    cluster_services: &BTreeSet<Service>,
) -> MemoryQuotaRequest {
    MemoryQuotaRequest {
        memory_quota: quota_for(Service::Kv, configured.kv, MIN_KV_QUOTA, cluster_services),
        index_memory_quota: quota_for(
            Service::Index,
            configured.index,
            MIN_INDEX_QUOTA,
            cluster_services,
        ),
        fts_memory_quota: quota_for(Service::Search, configured.fts, MIN_FTS_QUOTA, cluster_services),
        cbas_memory_quota: quota_for(
            Service::Analytics,
            configured.cbas,
            MIN_CBAS_QUOTA,
            cluster_services,
        ),
        eventing_memory_quota: quota_for(
            Service::Eventing,
            configured.eventing,
            MIN_EVENTING_QUOTA,
            cluster_services,
        ),
    }
}

/// Poll `admin` until no background task reports `running`
pub async fn wait_for_idle(
    cancel: &CancellationToken,
    admin: &Arc<dyn AdminApi>,
    poll: &PollOptions,
    what: &str,
) -> Result<()> {
    wait_until(cancel, poll, what, || {
        let admin = admin.clone();
        async move {
            let tasks = admin.tasks().await?;
            Ok(!tasks.iter().any(|t| t.is_running()))
        }
    })
    .await
}

pub struct Bootstrapper {
    backends: Backends,
    options: Arc<Options>,
}

impl Bootstrapper {
    pub fn new(backends: Backends, options: Arc<Options>) -> Self {
        Self { backends, options }
    }

    /// Bootstrap `members`, which must already be in bootstrap order
    pub async fn bootstrap(
        &self,
        cancel: &CancellationToken,
        members: &[ProvisionedNode],
        cluster_services: &BTreeSet<Service>,
    ) -> Result<()> {
        let mut fsm = BootstrapFsm::new();
        let result = self.run(cancel, &mut fsm, members, cluster_services).await;
        if let Err(e) = &result {
            error!("Bootstrap failed in state {:?}: {}", fsm.state(), e);
            mark_failed(&mut fsm, e);
        }
        result
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        fsm: &mut BootstrapFsm,
        members: &[ProvisionedNode],
        cluster_services: &BTreeSet<Service>,
    ) -> Result<()> {
        let (first, others) = members
            .split_first()
            .ok_or_else(|| OrchestratorError::ConfigError("a cluster needs at least one member".to_string()))?;
        let admin = self.backends.admin.connect(&first.ip_address)?;

        info!("Initializing cluster {} on node {}", first.cluster_id, first.node_id);
        self.init_first_node(admin.as_ref(), first, cluster_services)
            .await
            .context("failed to configure the first node")?;
        advance(fsm, BootstrapEvent::FirstNodeInitialized)?;

        for node in others {
            info!("Adding node {} to cluster {}", node.node_id, node.cluster_id);
            admin
                .add_node(&add_node_request(&self.options, node))
                .await
                .with_context(|| format!("failed to add node {}", node.node_id))?;
        }
        advance(fsm, BootstrapEvent::NodesJoined)?;

        let pool = admin
            .pool_default()
            .await
            .context("failed to list cluster nodes")?;
        let known: Vec<String> = pool.nodes.iter().map(|n| n.otp_node.clone()).collect();
        admin
            .rebalance(&RebalanceRequest {
                known_nodes: known.join(","),
                ejected_nodes: String::new(),
            })
            .await
            .context("failed to start the initial rebalance")?;
        advance(fsm, BootstrapEvent::RebalanceStarted)?;

        let what = format!("initial rebalance of cluster {}", first.cluster_id);
        wait_for_idle(cancel, &admin, &self.options.tasks_poll, &what).await?;
        advance(fsm, BootstrapEvent::TasksDrained)?;

        info!("Cluster {} is ready with {} members", first.cluster_id, members.len());
        Ok(())
    }

    async fn init_first_node(
        &self,
        admin: &dyn AdminApi,
        first: &ProvisionedNode,
        cluster_services: &BTreeSet<Service>,
    ) -> Result<()> {
        let quotas = memory_quotas(&self.options.memory_quotas, cluster_services);
        admin
            .set_memory_quotas(&quotas)
            .await
            .context("failed to configure memory quotas")?;
        admin
            .setup_services(&admin_service_list(&first.services))
            .await
            .context("failed to enable services")?;
        admin
            .setup_net_config(&self.options.address_family)
            .await
            .context("failed to configure the network mode")?;
        if cluster_services.contains(&Service::Index) {
            admin
                .set_index_storage_mode(&self.options.index_storage_mode)
                .await
                .context("failed to set the index storage mode")?;
        }
        admin
            .set_web_credentials()
            .await
            .context("failed to set administrative credentials")?;
        Ok(())
    }
}

/// Add-node request registering `node` with its intended services
pub fn add_node_request(options: &Options, node: &ProvisionedNode) -> AddNodeRequest {
    AddNodeRequest {
        hostname: node.ip_address.clone(),
        user: options.admin_username.clone(),
        password: options.admin_password.expose_secret().to_string(),
        services: admin_service_list(&node.services),
        group_name: node.server_group.clone(),
    }
}

fn advance(fsm: &mut BootstrapFsm, event: BootstrapEvent) -> Result<BootstrapState> {
    fsm.process(event).map_err(OrchestratorError::Internal)
}

/// Move the FSM to `Failed`, warning when it has already settled
fn mark_failed(fsm: &mut BootstrapFsm, cause: &OrchestratorError) -> BootstrapState {
    match fsm.process(BootstrapEvent::Failed(cause.to_string())) {
        Ok(state) => state,
        Err(rejected) => {
            warn!("Could not record the bootstrap failure: {}", rejected);
            fsm.state()
        }
    }
}
