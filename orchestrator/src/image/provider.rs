//! Image providers
//!
//! Each provider serves a fixed support matrix of image definitions and maps
//! a supported definition to an artifact path. Providers are tried in order
//! by the resolver; the first that accepts a definition wins.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Result;
use crate::image::{Edition, ImageDef, ImageSource, ResolvedImage};

/// A source of deployable artifacts
pub trait ImageProvider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// `Err(reason)` when the definition is outside this provider's matrix
    fn supports(&self, def: &ImageDef) -> std::result::Result<(), String>;

    /// Map a supported definition to its artifact
    fn select(&self, def: &ImageDef) -> ResolvedImage;
}

/// Makes a resolved artifact available to the runtime (pull or build).
///
/// The download and build mechanics live behind this trait.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn ensure_available(&self, image: &ResolvedImage) -> Result<()>;
}

/// Public registry serving released builds of both editions
pub struct GeneralRegistryProvider {
    repository: String,
}

impl GeneralRegistryProvider {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
        }
    }
}

impl ImageProvider for GeneralRegistryProvider {
    fn name(&self) -> &str {
        "general-registry"
    }

    fn supports(&self, def: &ImageDef) -> std::result::Result<(), String> {
        if def.build_number != 0 {
            return Err("only released builds are published".to_string());
        }
        if def.owner.is_some() {
            return Err("owner-scoped builds are not published".to_string());
        }
        if def.serverless {
            return Err("serverless variants are not published".to_string());
        }
        Ok(())
    }

    fn select(&self, def: &ImageDef) -> ResolvedImage {
        let path = format!("{}:{}-{}", self.repository, def.edition, def.version);
        ResolvedImage::from_def(def, path, ImageSource::Registry { authenticated: false })
    }
}

/// Authenticated registry holding unreleased builds
pub struct BuildRegistryProvider {
    repository: String,
    has_credentials: bool,
}

impl BuildRegistryProvider {
    pub fn new(repository: impl Into<String>, has_credentials: bool) -> Self {
        Self {
            repository: repository.into(),
            has_credentials,
        }
    }
}

impl ImageProvider for BuildRegistryProvider {
    fn name(&self) -> &str {
        "build-registry"
    }

    fn supports(&self, def: &ImageDef) -> std::result::Result<(), String> {
        if def.build_number == 0 {
            return Err("only unreleased builds are served".to_string());
        }
        if def.serverless {
            return Err("serverless variants are built locally".to_string());
        }
        if !self.has_credentials {
            return Err("no registry credentials configured".to_string());
        }
        Ok(())
    }

    fn select(&self, def: &ImageDef) -> ResolvedImage {
        let mut tag = format!("{}-{}", def.version, def.build_number);
        if let Some(owner) = &def.owner {
            tag = format!("{}-{}", owner, tag);
        }
        if def.is_community() {
            tag.push_str("-community");
        }
        let path = format!("{}:{}", self.repository, tag);
        ResolvedImage::from_def(def, path, ImageSource::Registry { authenticated: true })
    }
}

/// Builds the serverless variant locally from a standard base image
pub struct ServerlessVariantProvider {
    repository: String,
    base_providers: Vec<Arc<dyn ImageProvider>>,
}

impl ServerlessVariantProvider {
    pub fn new(repository: impl Into<String>, base_providers: Vec<Arc<dyn ImageProvider>>) -> Self {
        Self {
            repository: repository.into(),
            base_providers,
        }
    }

    fn base_provider(&self, def: &ImageDef) -> Option<&Arc<dyn ImageProvider>> {
        self.base_providers
            .iter()
            .find(|p| p.supports(def).is_ok())
    }

    fn base_def(def: &ImageDef) -> ImageDef {
        ImageDef {
            serverless: false,
            ..def.clone()
        }
    }
}

impl ImageProvider for ServerlessVariantProvider {
    fn name(&self) -> &str {
        "serverless-builder"
    }

    fn supports(&self, def: &ImageDef) -> std::result::Result<(), String> {
        if !def.serverless {
            return Err("only serverless variants are built".to_string());
        }
        if def.edition != Edition::Enterprise {
            return Err("serverless is enterprise-only".to_string());
        }
        match self.base_provider(&Self::base_def(def)) {
            Some(_) => Ok(()),
            None => Err("no provider can serve the base image".to_string()),
        }
    }

    fn select(&self, def: &ImageDef) -> ResolvedImage {
        let base_def = Self::base_def(def);
        let base = self
            .base_provider(&base_def)
            .map(|p| p.select(&base_def).artifact_path)
            .unwrap_or_default();

        let mut tag = format!("{}-{}", def.version, def.build_number);
        if let Some(owner) = &def.owner {
            tag = format!("{}-{}", owner, tag);
        }
        let path = format!("{}:{}", self.repository, tag);
        ResolvedImage::from_def(def, path, ImageSource::Derived { base })
    }
}
