//! Ancillary wiring: DNS, load balancer and certificates
//!
//! Applied only to a validated member list, always in the order
//! DNS, load balancer, certificates.

pub mod certs;
pub mod dns;
pub mod lb;

use std::sync::Arc;

use tracing::{debug, info};

use crate::admin::AdminConnector;
use crate::cluster::view::ClusterView;
use crate::errors::{Context, OrchestratorError, Result};
use crate::models::cluster::ProvisionedNode;
use crate::runtime::RuntimeBackend;

use certs::{CertificateAuthority, CertificateInstaller};
use dns::{cluster_record_names, cluster_records, node_name, DnsProvider};
use lb::{LbTarget, LoadBalancerController};

pub struct AncillaryWiring {
    admin: Arc<dyn AdminConnector>,
    dns: Option<Arc<dyn DnsProvider>>,
    load_balancer: Arc<dyn LoadBalancerController>,
    root_ca: Option<Arc<dyn CertificateAuthority>>,
    installer: CertificateInstaller,
}

impl AncillaryWiring {
    pub fn new(
        runtime: Arc<dyn RuntimeBackend>,
        admin: Arc<dyn AdminConnector>,
        dns: Option<Arc<dyn DnsProvider>>,
        load_balancer: Arc<dyn LoadBalancerController>,
        root_ca: Option<Arc<dyn CertificateAuthority>>,
    ) -> Self {
        Self {
            admin,
            dns,
            load_balancer,
            root_ca,
            installer: CertificateInstaller::new(runtime),
        }
    }

    pub fn installer(&self) -> &CertificateInstaller {
        &self.installer
    }

    fn dns_provider(&self) -> Result<&Arc<dyn DnsProvider>> {
        self.dns
            .as_ref()
            .ok_or_else(|| OrchestratorError::ConfigError("no DNS provider is configured".to_string()))
    }

    /// Intermediate CA of one cluster
    pub fn cluster_ca(&self, cluster_id: &str) -> Result<Arc<dyn CertificateAuthority>> {
        let root = self.root_ca.as_ref().ok_or_else(|| {
            OrchestratorError::ConfigError("no root certificate authority is configured".to_string())
        })?;
        root.make_intermediary_ca(cluster_id)
    }

    /// Bring DNS, the load balancer and member certificates in line with the
    /// members of `view`. `departed` are nodes that just left the cluster;
    /// their DNS names are dropped first.
    pub async fn apply(&self, view: &ClusterView, departed: &[&ProvisionedNode]) -> Result<()> {
        let members: Vec<&ProvisionedNode> = view
            .members()
            .filter(|m| !departed.iter().any(|d| d.node_id == m.node_id))
            .collect();

        if view.uses_dns() {
            self.apply_dns(&view.cluster_id, &members, departed)
                .await
                .context("failed to update DNS records")?;
        }

        if let Some(lb_node) = view.load_balancer() {
            let targets: Vec<LbTarget> = members.iter().map(|m| LbTarget::from_member(m)).collect();
            let variant_flag = targets.iter().any(|t| t.serverless);
            self.load_balancer
                .update_config(lb_node, &targets, view.uses_custom_ca(), variant_flag)
                .await
                .context("failed to update the load balancer")?;
        }

        if view.uses_custom_ca() {
            let ca = self.cluster_ca(&view.cluster_id)?;
            self.installer
                .install_missing(ca.as_ref(), self.admin.as_ref(), &members)
                .await
                .context("failed to install certificates")?;
        }

        info!("Wiring of cluster {} is up to date", view.cluster_id);
        Ok(())
    }

    async fn apply_dns(
        &self,
        cluster_id: &str,
        members: &[&ProvisionedNode],
        departed: &[&ProvisionedNode],
    ) -> Result<()> {
        let dns = self.dns_provider()?;
        let zone = dns.hostname();

        if !departed.is_empty() {
            let names: Vec<String> = departed
                .iter()
                .map(|n| {
                    n.dns_name
                        .clone()
                        .unwrap_or_else(|| node_name(&n.node_id, cluster_id, zone))
                })
                .collect();
            debug!("Dropping DNS names of departed nodes: {:?}", names);
            dns.remove_records(&names, false, false).await?;
        }

        let records = cluster_records(cluster_id, zone, members);
        dns.update_records(&records, false, false).await
    }

    /// Remove every DNS record any node of `view` may own
    pub async fn remove(&self, view: &ClusterView) -> Result<()> {
        if !view.uses_dns() {
            return Ok(());
        }
        let dns = self.dns_provider()?;
        let nodes: Vec<&ProvisionedNode> = view.nodes.iter().collect();
        let names = cluster_record_names(&view.cluster_id, dns.hostname(), &nodes);
        dns.remove_records(&names, false, false)
            .await
            .context("failed to remove DNS records")
    }
}
