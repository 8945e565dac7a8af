//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::admin::client::HttpAdminConnector;
use crate::app::options::AppOptions;
use crate::deploy::orchestrator::Orchestrator;
use crate::deploy::Backends;
use crate::errors::Result;
use crate::image::resolver::ImageResolver;
use crate::runtime::docker::{DockerBackend, DockerImageFetcher};
use crate::runtime::RuntimeBackend;
use crate::wiring::certs::{CertificateAuthority, RootCa};
use crate::wiring::dns::{DnsProvider, ZoneFileDnsProvider};
use crate::wiring::lb::HaproxyController;

/// Main application state
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Build the Docker-backed orchestrator described by `options`
    pub async fn init(options: &AppOptions) -> Result<Self> {
        info!("Initializing application state...");
        let layout = &options.storage.layout;

        let runtime: Arc<dyn RuntimeBackend> =
            Arc::new(DockerBackend::new(options.docker.network.clone()));

        let dns: Option<Arc<dyn DnsProvider>> = options.dns.zone.as_ref().map(|zone| {
            Arc::new(ZoneFileDnsProvider::new(zone.clone(), layout.dns_zone_file()))
                as Arc<dyn DnsProvider>
        });

        let root_ca: Arc<dyn CertificateAuthority> = RootCa::get_or_init(layout).await?;

        let backends = Backends {
            runtime: runtime.clone(),
            admin: Arc::new(HttpAdminConnector::new(options.admin.clone())?),
            fetcher: Arc::new(DockerImageFetcher::new(
                options.images.build_repository.clone(),
                options.images.build_registry_token.clone(),
            )),
            load_balancer: Arc::new(HaproxyController::new(runtime)),
            dns,
            root_ca: Some(root_ca),
        };

        let resolver = Arc::new(ImageResolver::from_settings(&options.images));
        let orchestrator = Arc::new(Orchestrator::new(backends, resolver, options.deploy.clone()));

        Ok(Self { orchestrator })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down application state...");
        Ok(())
    }
}
