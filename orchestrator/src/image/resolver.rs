//! Provider chain

use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::{OrchestratorError, Result};
use crate::image::provider::{
    BuildRegistryProvider, GeneralRegistryProvider, ImageProvider, ServerlessVariantProvider,
};
use crate::image::{ImageDef, ResolvedImage};
use crate::storage::settings::ImageSettings;

/// Resolves image definitions against an ordered provider chain
pub struct ImageResolver {
    providers: Vec<Arc<dyn ImageProvider>>,
}

impl ImageResolver {
    pub fn new(providers: Vec<Arc<dyn ImageProvider>>) -> Self {
        Self { providers }
    }

    /// Default chain: general registry, build registry, serverless builder
    pub fn from_settings(settings: &ImageSettings) -> Self {
        let general: Arc<dyn ImageProvider> =
            Arc::new(GeneralRegistryProvider::new(&settings.general_repository));
        let builds: Arc<dyn ImageProvider> = Arc::new(BuildRegistryProvider::new(
            &settings.build_repository,
            settings.build_registry_token.is_some(),
        ));
        let serverless: Arc<dyn ImageProvider> = Arc::new(ServerlessVariantProvider::new(
            &settings.serverless_repository,
            vec![general.clone(), builds.clone()],
        ));

        Self::new(vec![general, builds, serverless])
    }

    /// Pick the first provider that supports `def`
    pub fn resolve(&self, def: &ImageDef) -> Result<ResolvedImage> {
        for provider in &self.providers {
            match provider.supports(def) {
                Ok(()) => {
                    let image = provider.select(def);
                    info!(
                        "Resolved {} to {} via {}",
                        def,
                        image.artifact_path,
                        provider.name()
                    );
                    return Ok(image);
                }
                Err(reason) => {
                    debug!("{} rejected {}: {}", provider.name(), def, reason);
                }
            }
        }

        Err(OrchestratorError::NoImageProvider(def.to_string()))
    }

    /// Parse and resolve a version specifier
    pub fn resolve_spec(&self, spec: &str) -> Result<ResolvedImage> {
        self.resolve(&ImageDef::parse(spec)?)
    }
}
