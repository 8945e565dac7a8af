//! Topology planner

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::deploy::provisioner::{ClusterTraits, NodeJob};
use crate::deploy::Options;
use crate::errors::{Context, Result};
use crate::image::provider::ImageFetcher;
use crate::image::resolver::ImageResolver;
use crate::image::{compare_versions, ImageDef, ImageSource, ResolvedImage, Variant};
use crate::models::cluster::{ClusterDef, NodeGroupSpec, NodeRole, ProvisionedNode};
use crate::runtime::{require, Capability, RuntimeBackend};

/// Jobs of one request
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub members: Vec<NodeJob>,
    pub auxiliary: Vec<NodeJob>,
}

impl Plan {
    pub fn into_jobs(self) -> Vec<NodeJob> {
        let mut jobs = self.members;
        jobs.extend(self.auxiliary);
        jobs
    }
}

pub struct Planner {
    resolver: Arc<ImageResolver>,
    fetcher: Arc<dyn ImageFetcher>,
    runtime: Arc<dyn RuntimeBackend>,
    options: Arc<Options>,
}

impl Planner {
    pub fn new(
        resolver: Arc<ImageResolver>,
        fetcher: Arc<dyn ImageFetcher>,
        runtime: Arc<dyn RuntimeBackend>,
        options: Arc<Options>,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            runtime,
            options,
        }
    }

    /// Plan a new cluster: every member plus the requested auxiliary nodes
    pub async fn plan(&self, def: &ClusterDef, traits: &ClusterTraits) -> Result<Plan> {
        let members = self.plan_groups(&def.groups, traits, 1).await?;

        let mut auxiliary = Vec::new();
        let mut number = members.len() as u32 + 1;
        if def.load_balancer {
            auxiliary.push(self.auxiliary_job(
                NodeRole::LoadBalancer,
                &self.options.load_balancer_image,
                number,
                traits,
            ));
            number += 1;
        }
        if def.blob_store_mock {
            auxiliary.push(self.auxiliary_job(
                NodeRole::BlobStoreMock,
                &self.options.blob_store_mock_image,
                number,
                traits,
            ));
        }

        info!(
            "Planned {} members and {} auxiliary nodes for cluster {}",
            members.len(),
            auxiliary.len(),
            traits.cluster_id
        );
        Ok(Plan { members, auxiliary })
    }

    /// Expand groups into member jobs numbered from `first_number`.
    ///
    /// Each distinct image definition is resolved and fetched once.
    pub async fn plan_groups(
        &self,
        groups: &[NodeGroupSpec],
        traits: &ClusterTraits,
        first_number: u32,
    ) -> Result<Vec<NodeJob>> {
        let mut resolved: BTreeMap<ImageDef, ResolvedImage> = BTreeMap::new();
        let mut jobs = Vec::new();
        let mut number = first_number;

        for group in groups {
            let def = ImageDef::parse(&group.version)?;
            let image = match resolved.get(&def) {
                Some(image) => {
                    debug!("Reusing resolution of {} for group {}", def, group.version);
                    image.clone()
                }
                None => {
                    let image = self.resolver.resolve(&def)?;
                    resolved.insert(def, image.clone());
                    image
                }
            };

            for _ in 0..group.count {
                jobs.push(NodeJob {
                    number,
                    role: NodeRole::ClusterMember,
                    image: image.artifact_path.clone(),
                    initial_version: image.version.clone(),
                    variant: image.variant,
                    services: group.services.clone(),
                    server_group: group.server_group.clone(),
                    env: group.env.clone(),
                    traits: traits.clone(),
                });
                number += 1;
            }
        }

        if resolved
            .values()
            .any(|image| matches!(image.source, ImageSource::Derived { .. }))
        {
            require(self.runtime.as_ref(), Capability::DerivedImages)?;
        }

        let mut fetched = BTreeSet::new();
        for image in resolved.values() {
            if fetched.insert(image.artifact_path.clone()) {
                self.fetcher
                    .ensure_available(image)
                    .await
                    .with_context(|| format!("failed to fetch image {}", image.artifact_path))?;
            }
        }

        Ok(jobs)
    }

    fn auxiliary_job(&self, role: NodeRole, image: &str, number: u32, traits: &ClusterTraits) -> NodeJob {
        NodeJob {
            number,
            role,
            image: image.to_string(),
            initial_version: String::new(),
            variant: Variant::Standard,
            services: Vec::new(),
            server_group: None,
            env: BTreeMap::new(),
            traits: traits.clone(),
        }
    }
}

fn compare_addresses(a: &str, b: &str) -> Ordering {
    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Order members for bootstrap: oldest initial version first, then by
/// address. The first node initializes the cluster, so this order is
/// required regardless of the order provisioning completed in.
pub fn order_for_bootstrap(mut nodes: Vec<ProvisionedNode>) -> Vec<ProvisionedNode> {
    nodes.sort_by(|a, b| {
        compare_versions(&a.initial_version, &b.initial_version)
            .then_with(|| compare_addresses(&a.ip_address, &b.ip_address))
    });
    nodes
}
