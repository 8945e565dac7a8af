//! Application configuration options

use std::time::Duration;

use crate::deploy;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{AdminSettings, DnsSettings, DockerSettings, ImageSettings, Settings};
use crate::workers::reaper;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Deployment options shared by every cluster operation
    pub deploy: deploy::Options,

    /// Admin API connection settings
    pub admin: AdminSettings,

    /// Image repositories and registry credentials
    pub images: ImageSettings,

    /// Docker runtime configuration
    pub docker: DockerSettings,

    /// DNS zone configuration
    pub dns: DnsSettings,

    /// Enable the expiry reaper
    pub enable_reaper: bool,

    /// Reaper worker options
    pub reaper: reaper::Options,
}

impl AppOptions {
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions { layout },
            deploy: deploy::Options::from_settings(settings),
            admin: settings.admin.clone(),
            images: settings.images.clone(),
            docker: settings.docker.clone(),
            dns: settings.dns.clone(),
            enable_reaper: true,
            reaper: reaper::Options {
                interval: Duration::from_secs(settings.reaper_interval_secs),
                ..Default::default()
            },
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(StorageLayout::default(), &Settings::default())
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}
