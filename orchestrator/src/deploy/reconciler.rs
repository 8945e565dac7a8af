//! Rebalance reconciler
//!
//! Applies a [`RebalancePlan`] to a running cluster. A rebalance can report
//! completion while the cluster still needs another one, or while an ejected
//! node is still a member, so every attempt starts from a fresh view and the
//! removal set is recomputed from what is actually still present.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use admin_api::models::{NodeInfo, RebalanceRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::view::{fetch_view, fetch_view_ex, ClusterView, ClusterViewEx, NodeStatus};
use crate::deploy::bootstrap::{add_node_request, wait_for_idle};
use crate::deploy::planner::Planner;
use crate::deploy::provisioner::{ClusterTraits, Provisioner};
use crate::deploy::{Backends, Options};
use crate::errors::{Context, OrchestratorError, Result};
use crate::models::cluster::{NodeGroupSpec, ProvisionedNode, RebalancePlan};
use crate::wiring::AncillaryWiring;

/// How a member's self-reported health is judged after a rebalance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusPolicy {
    /// `healthy` passes; an empty status is inconclusive and also passes
    #[default]
    EmptyIsInconclusive,

    /// Only `healthy` passes
    RequireHealthy,
}

impl StatusPolicy {
    pub fn accepts(self, health: &str) -> bool {
        match self {
            StatusPolicy::EmptyIsInconclusive => health.is_empty() || health == "healthy",
            StatusPolicy::RequireHealthy => health == "healthy",
        }
    }
}

/// Outcome of a successful reconciliation
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// Attempts used, starting at 1
    pub attempts: u32,

    /// Nodes ejected and destroyed
    pub removed: Vec<ProvisionedNode>,

    /// Nodes provisioned and rebalanced in
    pub added: Vec<ProvisionedNode>,

    /// The cluster after removal of the ejected nodes
    pub view: ClusterView,
}

/// A member with a known identity that is not being removed, with its status
pub fn select_control_node<'a>(
    ex: &'a ClusterViewEx,
    removals: &BTreeSet<String>,
) -> Option<(&'a ProvisionedNode, &'a NodeStatus)> {
    ex.view
        .members()
        .filter(|m| !removals.contains(&m.node_id))
        .find_map(|m| match ex.status(&m.node_id) {
            Some(status) if status.otp_node.is_some() => Some((m, status)),
            _ => None,
        })
}

fn identity_of<'a>(node: &ProvisionedNode, identity: &'a [NodeInfo]) -> Option<&'a NodeInfo> {
    identity.iter().find(|i| node.matches_hostname(&i.hostname))
}

/// Keep only the removals whose node still exists and is still part of the
/// cluster's identity set. Everything else already left.
pub fn narrow_removals(
    removals: &BTreeSet<String>,
    view: &ClusterView,
    identity: &[NodeInfo],
) -> BTreeSet<String> {
    removals
        .iter()
        .filter(|id| {
            view.node(id)
                .map(|n| identity_of(n, identity).is_some())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Problems that keep a post-rebalance view from counting as converged.
/// Empty means converged.
pub fn validate(ex: &ClusterViewEx, removals: &BTreeSet<String>, policy: StatusPolicy) -> Vec<String> {
    let Some((_, control)) = select_control_node(ex, removals) else {
        return vec!["no member with a known identity answered".to_string()];
    };

    let mut problems = Vec::new();
    for member in ex.view.members().filter(|m| !removals.contains(&m.node_id)) {
        let Some(status) = ex.status(&member.node_id) else {
            continue;
        };
        if status.otp_node.is_none() {
            continue;
        }
        if status.needs_rebalance {
            problems.push(format!("node {} still needs a rebalance", member.node_id));
        }
        if !policy.accepts(&status.health) {
            problems.push(format!("node {} reports status {:?}", member.node_id, status.health));
        }
    }

    for id in removals {
        if let Some(node) = ex.view.node(id) {
            if identity_of(node, &control.cluster_nodes).is_some() {
                problems.push(format!("node {} is still a member", id));
            }
        }
    }

    problems
}

pub struct Reconciler {
    backends: Backends,
    options: Arc<Options>,
    planner: Arc<Planner>,
    provisioner: Provisioner,
    wiring: Arc<AncillaryWiring>,
    policy: StatusPolicy,
}

impl Reconciler {
    pub fn new(
        backends: Backends,
        options: Arc<Options>,
        planner: Arc<Planner>,
        wiring: Arc<AncillaryWiring>,
    ) -> Self {
        Self {
            provisioner: Provisioner::new(backends.clone(), options.clone()),
            backends,
            options,
            planner,
            wiring,
            policy: StatusPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: StatusPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply `plan` to the running cluster `cluster_id`.
    ///
    /// Callers must hold the cluster's writer lock.
    pub async fn apply(
        &self,
        cancel: &CancellationToken,
        cluster_id: &str,
        plan: &RebalancePlan,
    ) -> Result<Reconciled> {
        let view = fetch_view(self.backends.runtime.as_ref(), cluster_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("cluster {}", cluster_id)))?;
        let removals: BTreeSet<String> = plan.nodes_to_remove.iter().cloned().collect();

        let added = if plan.node_groups_to_add.is_empty() {
            Vec::new()
        } else {
            self.add_nodes(cancel, &view, &plan.node_groups_to_add, &removals)
                .await
                .context("failed to add nodes")?
        };

        let (attempts, departing) = match self.reconcile(cancel, cluster_id, &removals).await {
            Ok(done) => done,
            Err(e) => {
                error!("Reconciliation of cluster {} failed: {}", cluster_id, e);
                return Err(e);
            }
        };

        let removed: Vec<ProvisionedNode> = departing.into_values().collect();
        self.provisioner.destroy(&removed).await;

        let view = fetch_view(self.backends.runtime.as_ref(), cluster_id)
            .await?
            .unwrap_or_else(|| ClusterView {
                cluster_id: cluster_id.to_string(),
                nodes: Vec::new(),
            });
        let departed: Vec<&ProvisionedNode> = removed.iter().collect();
        self.wiring.apply(&view, &departed).await?;

        info!(
            "Cluster {} reconciled in {} attempts: {} added, {} removed",
            cluster_id,
            attempts,
            added.len(),
            removed.len()
        );
        Ok(Reconciled {
            attempts,
            removed,
            added,
            view,
        })
    }

    /// Provision new members and register them through a control node.
    /// New nodes are destroyed again if registration fails.
    async fn add_nodes(
        &self,
        cancel: &CancellationToken,
        view: &ClusterView,
        groups: &[NodeGroupSpec],
        removals: &BTreeSet<String>,
    ) -> Result<Vec<ProvisionedNode>> {
        let first = view
            .members()
            .next()
            .ok_or_else(|| OrchestratorError::NotFound(format!("members of cluster {}", view.cluster_id)))?;
        let traits = ClusterTraits::of_node(first);

        let jobs = self
            .planner
            .plan_groups(groups, &traits, view.nodes.len() as u32 + 1)
            .await?;
        let nodes = self.provisioner.provision_many(cancel, jobs).await?;

        if let Err(e) = self.register(&traits, &nodes, removals).await {
            warn!("Registration of new nodes failed, removing them: {}", e);
            self.provisioner.destroy(&nodes).await;
            return Err(e);
        }
        Ok(nodes)
    }

    async fn register(
        &self,
        traits: &ClusterTraits,
        nodes: &[ProvisionedNode],
        removals: &BTreeSet<String>,
    ) -> Result<()> {
        if traits.custom_ca {
            let ca = self.wiring.cluster_ca(&traits.cluster_id)?;
            let members: Vec<&ProvisionedNode> = nodes.iter().collect();
            self.wiring
                .installer()
                .install_missing(ca.as_ref(), self.backends.admin.as_ref(), &members)
                .await?;
        }

        let ex = fetch_view_ex(
            self.backends.runtime.as_ref(),
            &self.backends.admin,
            &traits.cluster_id,
        )
        .await?;
        let mut excluded = removals.clone();
        excluded.extend(nodes.iter().map(|n| n.node_id.clone()));
        let (control, _) = select_control_node(&ex, &excluded).ok_or_else(|| {
            OrchestratorError::NoControlNodeAvailable {
                cluster_id: traits.cluster_id.clone(),
            }
        })?;

        let admin = self.backends.admin.connect(&control.ip_address)?;
        for node in nodes {
            info!("Adding node {} through control node {}", node.node_id, control.node_id);
            admin
                .add_node(&add_node_request(&self.options, node))
                .await
                .with_context(|| format!("failed to add node {}", node.node_id))?;
        }
        Ok(())
    }

    /// Rebalance until the cluster converges without the removed nodes.
    ///
    /// Returns the attempts used and the nodes that left, keyed by node id.
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        cluster_id: &str,
        requested: &BTreeSet<String>,
    ) -> Result<(u32, BTreeMap<String, ProvisionedNode>)> {
        let mut removals = requested.clone();
        let mut departing: BTreeMap<String, ProvisionedNode> = BTreeMap::new();
        let attempts = self.options.reconcile_attempts.max(1);

        for attempt in 1..=attempts {
            let ex = fetch_view_ex(self.backends.runtime.as_ref(), &self.backends.admin, cluster_id).await?;
            for id in &removals {
                match ex.view.node(id) {
                    Some(node) => {
                        departing.entry(id.clone()).or_insert_with(|| node.clone());
                    }
                    None => warn!("Node {} of cluster {} no longer exists", id, cluster_id),
                }
            }
            removals.retain(|id| ex.view.node(id).is_some());

            let (control, status) = select_control_node(&ex, &removals).ok_or_else(|| {
                OrchestratorError::NoControlNodeAvailable {
                    cluster_id: cluster_id.to_string(),
                }
            })?;

            let identity = &status.cluster_nodes;
            let known: Vec<&str> = identity.iter().map(|n| n.otp_node.as_str()).collect();
            let ejected: Vec<&str> = removals
                .iter()
                .filter_map(|id| ex.view.node(id))
                .filter_map(|n| identity_of(n, identity))
                .map(|n| n.otp_node.as_str())
                .collect();

            info!(
                "Rebalancing cluster {} through node {} (attempt {}/{}, ejecting {:?})",
                cluster_id, control.node_id, attempt, attempts, ejected
            );
            let admin = self.backends.admin.connect(&control.ip_address)?;
            let request = RebalanceRequest {
                known_nodes: known.join(","),
                ejected_nodes: ejected.join(","),
            };
            if let Err(e) = admin.rebalance(&request).await {
                if e.is_terminal() {
                    return Err(e);
                }
                warn!("Rebalance request of cluster {} failed: {}", cluster_id, e);
            }

            let what = format!("rebalance of cluster {}", cluster_id);
            wait_for_idle(cancel, &admin, &self.options.tasks_poll, &what).await?;

            let after = fetch_view_ex(self.backends.runtime.as_ref(), &self.backends.admin, cluster_id).await?;
            let problems = validate(&after, &removals, self.policy);
            if problems.is_empty() {
                departing.retain(|id, _| requested.contains(id));
                return Ok((attempt, departing));
            }

            warn!(
                "Cluster {} has not converged after attempt {}: {}",
                cluster_id,
                attempt,
                problems.join("; ")
            );
            let identity_after = select_control_node(&after, &removals)
                .map(|(_, s)| s.cluster_nodes.as_slice())
                .unwrap_or(identity.as_slice());
            let narrowed = narrow_removals(&removals, &after.view, identity_after);
            debug!("Removal set narrowed from {:?} to {:?}", removals, narrowed);
            removals = narrowed;
        }

        Err(OrchestratorError::RebalanceReconciliationExhausted {
            cluster_id: cluster_id.to_string(),
            attempts,
        })
    }
}
