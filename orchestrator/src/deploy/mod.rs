//! Cluster deployment: planning, provisioning, bootstrap and reconciliation

pub mod bootstrap;
pub mod fsm;
pub mod orchestrator;
pub mod planner;
pub mod provisioner;
pub mod reconciler;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::admin::AdminConnector;
use crate::converge::PollOptions;
use crate::image::provider::ImageFetcher;
use crate::runtime::RuntimeBackend;
use crate::storage::settings::{MemoryQuotaSettings, Settings};
use crate::wiring::certs::CertificateAuthority;
use crate::wiring::dns::DnsProvider;
use crate::wiring::lb::LoadBalancerController;

/// Deployment options
#[derive(Debug, Clone)]
pub struct Options {
    /// Recorded on every node as its creator
    pub creator: String,

    /// Interval of node readiness probes
    pub readiness_poll: PollOptions,

    /// Interval of background task probes
    pub tasks_poll: PollOptions,

    /// Attempt budget of one reconciliation
    pub reconcile_attempts: u32,

    /// Lifetime of a cluster whose request does not specify one
    pub default_expiry: Duration,

    pub admin_username: String,
    pub admin_password: SecretString,

    pub memory_quotas: MemoryQuotaSettings,
    pub index_storage_mode: String,
    pub address_family: String,

    pub load_balancer_image: String,
    pub blob_store_mock_image: String,
}

impl Options {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            creator: settings.creator.clone(),
            readiness_poll: PollOptions::every(Duration::from_millis(
                settings.polling.readiness_interval_ms,
            )),
            tasks_poll: PollOptions::every(Duration::from_millis(
                settings.polling.tasks_interval_ms,
            )),
            reconcile_attempts: settings.reconcile_attempts,
            default_expiry: Duration::from_secs(settings.default_expiry_secs),
            admin_username: settings.admin.username.clone(),
            admin_password: settings.admin.password.clone(),
            memory_quotas: settings.cluster.memory_quotas.clone(),
            index_storage_mode: settings.cluster.index_storage_mode.clone(),
            address_family: settings.cluster.address_family.clone(),
            load_balancer_image: settings.images.load_balancer_image.clone(),
            blob_store_mock_image: settings.images.blob_store_mock_image.clone(),
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// External collaborators of a deployment
#[derive(Clone)]
pub struct Backends {
    pub runtime: Arc<dyn RuntimeBackend>,
    pub admin: Arc<dyn AdminConnector>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub load_balancer: Arc<dyn LoadBalancerController>,

    /// Clusters requesting DNS fail to deploy without a provider
    pub dns: Option<Arc<dyn DnsProvider>>,

    /// Root every per-cluster CA chains to
    pub root_ca: Option<Arc<dyn CertificateAuthority>>,
}
