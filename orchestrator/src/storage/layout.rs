//! Storage layout configuration

use std::path::PathBuf;

use tracing::info;

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::utils::generate_short_id;

/// Storage layout for the orchestrator
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Fallback machine identity when the host does not provide one
    pub fn machine_id_file(&self) -> File {
        File::new(self.base_dir.join("machine-id"))
    }

    /// Records of the local DNS zone
    pub fn dns_zone_file(&self) -> File {
        File::new(self.base_dir.join("dns-zone.json"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Stable identity of this machine.
    ///
    /// Prefers the host's `/etc/machine-id`; otherwise generates one under
    /// the base directory on first use and reuses it afterwards.
    pub async fn machine_identity(&self) -> Result<String, OrchestratorError> {
        let host_id = File::new("/etc/machine-id");
        if host_id.exists().await {
            let id = host_id.read_string().await?;
            if !id.trim().is_empty() {
                return Ok(id.trim().to_string());
            }
        }

        let local = self.machine_id_file();
        if local.exists().await {
            return Ok(local.read_string().await?.trim().to_string());
        }

        let id = format!("{}{}", generate_short_id(), generate_short_id());
        info!("Generated machine identity at {}", local.path().display());
        local.write_string(&id).await?;
        Ok(id)
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ephemera");

        Self::new(base_dir)
    }
}
