//! Load balancer in front of a cluster
//!
//! The configuration is always recomputed from the live member list and
//! replaced as a whole.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::errors::{Context, OrchestratorError, Result};
use crate::models::cluster::ProvisionedNode;
use crate::runtime::{require, Capability, RuntimeBackend};

const HAPROXY_CONFIG_PATH: &str = "/usr/local/etc/haproxy/haproxy.cfg";

const STANDARD_PORTS: [u16; 7] = [8091, 8092, 8093, 8094, 8095, 8096, 11210];
const STANDARD_TLS_PORTS: [u16; 7] = [18091, 18092, 18093, 18094, 18095, 18096, 11207];
const SERVERLESS_PORTS: [u16; 3] = [8091, 8093, 11210];
const SERVERLESS_TLS_PORTS: [u16; 3] = [18091, 18093, 11207];

/// One backend of the load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbTarget {
    pub address: String,
    pub serverless: bool,
}

impl LbTarget {
    pub fn from_member(member: &ProvisionedNode) -> Self {
        Self {
            address: member.ip_address.clone(),
            serverless: member.variant.is_serverless(),
        }
    }
}

#[async_trait]
pub trait LoadBalancerController: Send + Sync {
    /// Replace the whole configuration of `lb_node`
    async fn update_config(
        &self,
        lb_node: &ProvisionedNode,
        targets: &[LbTarget],
        tls_enabled: bool,
        variant_flag: bool,
    ) -> Result<()>;
}

/// Exposed ports for a cluster flavour
pub fn exposed_ports(tls_enabled: bool, serverless: bool) -> Vec<u16> {
    let mut ports = match serverless {
        true => SERVERLESS_PORTS.to_vec(),
        false => STANDARD_PORTS.to_vec(),
    };
    if tls_enabled {
        match serverless {
            true => ports.extend(SERVERLESS_TLS_PORTS),
            false => ports.extend(STANDARD_TLS_PORTS),
        }
    }
    ports
}

/// Render an HAProxy configuration forwarding every exposed port to every target
pub fn render_haproxy_config(targets: &[LbTarget], tls_enabled: bool, variant_flag: bool) -> String {
    let mut cfg = String::new();
    let _ = writeln!(cfg, "global\n    maxconn 4096\n");
    let _ = writeln!(
        cfg,
        "defaults\n    mode tcp\n    timeout connect 5s\n    timeout client 1h\n    timeout server 1h\n"
    );

    for port in exposed_ports(tls_enabled, variant_flag) {
        let _ = writeln!(cfg, "frontend port_{port}\n    bind *:{port}\n    default_backend nodes_{port}\n");
        let _ = writeln!(cfg, "backend nodes_{port}\n    balance roundrobin");
        for (i, target) in targets.iter().enumerate() {
            let _ = writeln!(cfg, "    server node{} {}:{} check", i, target.address, port);
        }
        cfg.push('\n');
    }
    cfg
}

/// Pushes HAProxy configuration into the load balancer node and restarts it
pub struct HaproxyController {
    runtime: Arc<dyn RuntimeBackend>,
}

impl HaproxyController {
    pub fn new(runtime: Arc<dyn RuntimeBackend>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl LoadBalancerController for HaproxyController {
    async fn update_config(
        &self,
        lb_node: &ProvisionedNode,
        targets: &[LbTarget],
        tls_enabled: bool,
        variant_flag: bool,
    ) -> Result<()> {
        require(self.runtime.as_ref(), Capability::CopyFiles)?;
        require(self.runtime.as_ref(), Capability::Restart)?;
        if targets.iter().any(|t| t.address.is_empty()) {
            return Err(OrchestratorError::LoadBalancerError(
                "target without an address".to_string(),
            ));
        }

        info!(
            "Updating load balancer {} with {} targets",
            lb_node.node_id,
            targets.len()
        );
        let config = render_haproxy_config(targets, tls_enabled, variant_flag);
        self.runtime
            .copy_to_node(&lb_node.resource_id, HAPROXY_CONFIG_PATH, config.as_bytes())
            .await
            .context("failed to upload the load balancer configuration")?;
        self.runtime
            .restart_node(&lb_node.resource_id)
            .await
            .context("failed to restart the load balancer")
    }
}
