//! Cluster lifecycle operations
//!
//! Every mutating operation holds the cluster's writer lock from start to
//! finish, so at most one deployment, reconciliation or removal runs per
//! cluster at a time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::locks::ClusterLocks;
use crate::cluster::view::{self, fetch_view, fetch_view_ex, ClusterView, ClusterViewEx};
use crate::deploy::bootstrap::Bootstrapper;
use crate::deploy::planner::{order_for_bootstrap, Planner};
use crate::deploy::provisioner::{ClusterTraits, Provisioner};
use crate::deploy::reconciler::{Reconciled, Reconciler, StatusPolicy};
use crate::deploy::{Backends, Options};
use crate::errors::{Context, OrchestratorError, Result};
use crate::image::resolver::ImageResolver;
use crate::models::cluster::{ClusterDef, ProvisionedNode, RebalancePlan};
use crate::runtime::NodeFilter;
use crate::utils::generate_short_id;
use crate::wiring::AncillaryWiring;

pub struct Orchestrator {
    backends: Backends,
    options: Arc<Options>,
    locks: ClusterLocks,
    planner: Arc<Planner>,
    provisioner: Provisioner,
    bootstrapper: Bootstrapper,
    reconciler: Reconciler,
    wiring: Arc<AncillaryWiring>,
}

impl Orchestrator {
    pub fn new(backends: Backends, resolver: Arc<ImageResolver>, options: Options) -> Self {
        let options = Arc::new(options);
        let planner = Arc::new(Planner::new(
            resolver,
            backends.fetcher.clone(),
            backends.runtime.clone(),
            options.clone(),
        ));
        let wiring = Arc::new(AncillaryWiring::new(
            backends.runtime.clone(),
            backends.admin.clone(),
            backends.dns.clone(),
            backends.load_balancer.clone(),
            backends.root_ca.clone(),
        ));

        Self {
            provisioner: Provisioner::new(backends.clone(), options.clone()),
            bootstrapper: Bootstrapper::new(backends.clone(), options.clone()),
            reconciler: Reconciler::new(backends.clone(), options.clone(), planner.clone(), wiring.clone()),
            locks: ClusterLocks::new(),
            backends,
            options,
            planner,
            wiring,
        }
    }

    /// Judge member health after a rebalance with `policy`
    pub fn with_status_policy(mut self, policy: StatusPolicy) -> Self {
        self.reconciler = self.reconciler.with_policy(policy);
        self
    }

    fn check_definition(&self, def: &ClusterDef) -> Result<()> {
        if def.member_count() == 0 {
            return Err(OrchestratorError::ConfigError(
                "a cluster needs at least one member".to_string(),
            ));
        }
        if def.use_dns && self.backends.dns.is_none() {
            return Err(OrchestratorError::ConfigError(
                "DNS records requested but no DNS zone is configured".to_string(),
            ));
        }
        if def.use_custom_ca && self.backends.root_ca.is_none() {
            return Err(OrchestratorError::ConfigError(
                "custom certificates requested but no root CA is configured".to_string(),
            ));
        }
        Ok(())
    }

    fn expiry_of(&self, def: &ClusterDef) -> Result<DateTime<Utc>> {
        let lifetime = def
            .expiry_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or(self.options.default_expiry);
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| OrchestratorError::ConfigError(format!("invalid expiry: {}", e)))?;
        Ok(Utc::now() + lifetime)
    }

    /// Deploy a new cluster and return its view once it is ready.
    ///
    /// On failure every node carrying the new cluster id is removed again.
    pub async fn new_cluster(&self, cancel: &CancellationToken, def: &ClusterDef) -> Result<ClusterView> {
        self.check_definition(def)?;

        let cluster_id = generate_short_id();
        let guard = self.locks.lock(&cluster_id).await;
        let result = self.deploy_new(cancel, def, &cluster_id).await;
        drop(guard);
        self.locks.prune().await;
        result
    }

    async fn deploy_new(
        &self,
        cancel: &CancellationToken,
        def: &ClusterDef,
        cluster_id: &str,
    ) -> Result<ClusterView> {
        let traits = ClusterTraits {
            cluster_id: cluster_id.to_string(),
            purpose: def.purpose.clone(),
            expiry: Some(self.expiry_of(def)?),
            custom_ca: def.use_custom_ca,
            use_dns: def.use_dns,
        };

        info!(
            "Deploying cluster {} with {} members",
            cluster_id,
            def.member_count()
        );
        match self.deploy(cancel, def, &traits).await {
            Ok(view) => {
                info!("Cluster {} deployed", cluster_id);
                Ok(view)
            }
            Err(e) => {
                error!("Deployment of cluster {} failed, cleaning up: {}", cluster_id, e);
                if let Err(cleanup_err) = self.teardown(cluster_id).await {
                    error!("Cleanup of cluster {} failed: {}", cluster_id, cleanup_err);
                }
                Err(e)
            }
        }
    }

    async fn deploy(
        &self,
        cancel: &CancellationToken,
        def: &ClusterDef,
        traits: &ClusterTraits,
    ) -> Result<ClusterView> {
        let plan = self.planner.plan(def, traits).await?;
        let nodes = self
            .provisioner
            .provision_many(cancel, plan.into_jobs())
            .await
            .context("failed to provision nodes")?;

        let (members, _auxiliary): (Vec<ProvisionedNode>, Vec<ProvisionedNode>) =
            nodes.into_iter().partition(|n| n.is_member());
        let members = order_for_bootstrap(members);

        if traits.custom_ca {
            let ca = self.wiring.cluster_ca(&traits.cluster_id)?;
            let refs: Vec<&ProvisionedNode> = members.iter().collect();
            self.wiring
                .installer()
                .install_missing(ca.as_ref(), self.backends.admin.as_ref(), &refs)
                .await
                .context("failed to install certificates")?;
        }

        self.bootstrapper
            .bootstrap(cancel, &members, &def.cluster_services())
            .await
            .context("failed to bootstrap the cluster")?;

        let view = self.get_cluster(&traits.cluster_id).await?;
        self.wiring.apply(&view, &[]).await?;
        Ok(view)
    }

    /// Add and remove nodes of a running cluster
    pub async fn modify_cluster(
        &self,
        cancel: &CancellationToken,
        cluster_id: &str,
        plan: &RebalancePlan,
    ) -> Result<Reconciled> {
        let guard = self.locks.lock(cluster_id).await;
        if plan.is_empty() {
            info!("Empty plan for cluster {}, rebalancing only", cluster_id);
        }
        let result = self
            .reconciler
            .apply(cancel, cluster_id, plan)
            .await
            .with_context(|| format!("failed to modify cluster {}", cluster_id));
        drop(guard);
        self.locks.prune().await;
        result
    }

    /// Remove a cluster with its DNS records. Removing a cluster that does
    /// not exist succeeds. Returns the number of nodes removed.
    pub async fn remove_cluster(&self, cluster_id: &str) -> Result<usize> {
        let guard = self.locks.lock(cluster_id).await;
        let result = self.teardown(cluster_id).await;
        drop(guard);
        self.locks.prune().await;
        result
    }

    /// Writer locks currently tracked, held or not
    pub async fn tracked_locks(&self) -> usize {
        self.locks.len().await
    }

    async fn teardown(&self, cluster_id: &str) -> Result<usize> {
        let nodes = self
            .backends
            .runtime
            .list_nodes(&NodeFilter::cluster(cluster_id))
            .await?;
        let grouped = view::group_nodes(nodes.clone());
        if let Some(view) = grouped.iter().find(|v| v.cluster_id == cluster_id) {
            self.wiring.remove(view).await?;
        }

        let mut first_error = None;
        let mut removed = 0;
        for node in &nodes {
            match self.backends.runtime.remove_node(&node.resource_id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!("Failed to remove {} of cluster {}: {}", node.name, cluster_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e).with_context(|| format!("failed to remove cluster {}", cluster_id)),
            None => {
                info!("Removed cluster {} ({} nodes)", cluster_id, removed);
                Ok(removed)
            }
        }
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterView>> {
        view::list_clusters(self.backends.runtime.as_ref()).await
    }

    pub async fn get_cluster(&self, cluster_id: &str) -> Result<ClusterView> {
        fetch_view(self.backends.runtime.as_ref(), cluster_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("cluster {}", cluster_id)))
    }

    /// The cluster with the live status of every member
    pub async fn get_cluster_ex(&self, cluster_id: &str) -> Result<ClusterViewEx> {
        let ex = fetch_view_ex(self.backends.runtime.as_ref(), &self.backends.admin, cluster_id).await?;
        if ex.view.nodes.is_empty() {
            return Err(OrchestratorError::NotFound(format!("cluster {}", cluster_id)));
        }
        Ok(ex)
    }

    /// Remove every cluster whose expiry passed before `now`; returns the
    /// ids removed.
    ///
    /// A cluster that fails to tear down does not stop the sweep. The
    /// remaining expired clusters are still removed and the first failure
    /// is returned afterwards.
    pub async fn remove_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut failed = 0;
        let mut first_error = None;
        for cluster in self.list_clusters().await? {
            if !cluster.is_expired(now) {
                continue;
            }
            info!("Cluster {} expired, removing it", cluster.cluster_id);
            match self.remove_cluster(&cluster.cluster_id).await {
                Ok(_) => removed.push(cluster.cluster_id),
                Err(e) => {
                    warn!("Failed to remove expired cluster {}: {}", cluster.cluster_id, e);
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e).with_context(|| {
                format!(
                    "failed to remove {} of {} expired clusters (removed: {:?})",
                    failed,
                    failed + removed.len(),
                    removed
                )
            }),
            None => Ok(removed),
        }
    }
}
