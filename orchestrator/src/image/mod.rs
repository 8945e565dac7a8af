//! Version and image resolution

pub mod provider;
pub mod resolver;
pub mod version;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub use version::{compare_versions, identify, Edition, ImageDef, Variant};

/// How a resolved artifact becomes available locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Pulled from a registry, optionally authenticated
    Registry { authenticated: bool },

    /// Built locally on top of another artifact
    Derived { base: String },
}

/// A concrete deployable artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedImage {
    pub artifact_path: String,
    pub version: String,
    pub build_number: u64,
    pub edition: Edition,
    pub variant: Variant,
    pub source: ImageSource,
}

impl ResolvedImage {
    pub fn from_def(def: &ImageDef, artifact_path: String, source: ImageSource) -> Self {
        Self {
            artifact_path,
            version: def.version.clone(),
            build_number: def.build_number,
            edition: def.edition,
            variant: def.variant(),
            source,
        }
    }
}

// Ordered by version, build, edition, then variant. The artifact path and
// source do not take part, so two equal images can share one artifact.
impl Ord for ResolvedImage {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(&self.version, &other.version)
            .then(self.build_number.cmp(&other.build_number))
            .then(self.edition.cmp(&other.edition))
            .then(self.variant.cmp(&other.variant))
    }
}

impl PartialOrd for ResolvedImage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ResolvedImage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ResolvedImage {}
