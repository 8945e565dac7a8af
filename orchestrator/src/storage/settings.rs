//! Settings file management

use secrecy::SecretString;
use serde::Deserialize;

use crate::logs::LogLevel;

/// Orchestrator settings, read from `settings.json`
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Recorded on every node as its creator
    #[serde(default = "default_creator")]
    pub creator: String,

    /// Administrative credentials installed on every cluster
    #[serde(default)]
    pub admin: AdminSettings,

    /// Image repositories
    #[serde(default)]
    pub images: ImageSettings,

    /// Docker runtime configuration
    #[serde(default)]
    pub docker: DockerSettings,

    /// DNS zone of cluster records
    #[serde(default)]
    pub dns: DnsSettings,

    /// Polling intervals
    #[serde(default)]
    pub polling: PollingSettings,

    /// Cluster initialization defaults
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Attempt budget of one reconciliation
    #[serde(default = "default_reconcile_attempts")]
    pub reconcile_attempts: u32,

    /// Expiry applied when a request does not specify one, in seconds
    #[serde(default = "default_expiry_secs")]
    pub default_expiry_secs: u64,

    /// Interval of the expiry reaper, in seconds
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_creator() -> String {
    std::env::var("USER").unwrap_or_else(|_| "ephemera".to_string())
}

fn default_reconcile_attempts() -> u32 {
    5
}

fn default_expiry_secs() -> u64 {
    4 * 3600
}

fn default_reaper_interval() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            creator: default_creator(),
            admin: AdminSettings::default(),
            images: ImageSettings::default(),
            docker: DockerSettings::default(),
            dns: DnsSettings::default(),
            polling: PollingSettings::default(),
            cluster: ClusterSettings::default(),
            reconcile_attempts: default_reconcile_attempts(),
            default_expiry_secs: default_expiry_secs(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// Administrative API settings
#[derive(Debug, Clone, Deserialize)]
pub struct AdminSettings {
    #[serde(default = "default_admin_username")]
    pub username: String,

    #[serde(default = "default_admin_password")]
    pub password: SecretString,

    /// Management port on every node
    #[serde(default = "default_admin_port")]
    pub port: u16,

    /// Per-request timeout in seconds
    #[serde(default = "default_admin_timeout")]
    pub timeout_secs: u64,
}

fn default_admin_username() -> String {
    "Administrator".to_string()
}

fn default_admin_password() -> SecretString {
    SecretString::from("password")
}

fn default_admin_port() -> u16 {
    8091
}

fn default_admin_timeout() -> u64 {
    30
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            username: default_admin_username(),
            password: default_admin_password(),
            port: default_admin_port(),
            timeout_secs: default_admin_timeout(),
        }
    }
}

/// Image repository settings
#[derive(Debug, Clone, Deserialize)]
pub struct ImageSettings {
    #[serde(default = "default_general_repository")]
    pub general_repository: String,

    #[serde(default = "default_build_repository")]
    pub build_repository: String,

    /// Token for the build registry; unreleased builds are unavailable without it
    #[serde(default)]
    pub build_registry_token: Option<SecretString>,

    #[serde(default = "default_serverless_repository")]
    pub serverless_repository: String,

    #[serde(default = "default_load_balancer_image")]
    pub load_balancer_image: String,

    #[serde(default = "default_blob_store_mock_image")]
    pub blob_store_mock_image: String,
}

fn default_general_repository() -> String {
    "couchbase/server".to_string()
}

fn default_build_repository() -> String {
    "ghcr.io/cb-vanilla/server".to_string()
}

fn default_serverless_repository() -> String {
    "ephemera/server-serverless".to_string()
}

fn default_load_balancer_image() -> String {
    "haproxy:2.8".to_string()
}

fn default_blob_store_mock_image() -> String {
    "localstack/localstack:3".to_string()
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            general_repository: default_general_repository(),
            build_repository: default_build_repository(),
            build_registry_token: None,
            serverless_repository: default_serverless_repository(),
            load_balancer_image: default_load_balancer_image(),
            blob_store_mock_image: default_blob_store_mock_image(),
        }
    }
}

/// Docker runtime settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerSettings {
    /// Network to attach nodes to; the daemon default when absent
    #[serde(default)]
    pub network: Option<String>,
}

/// DNS settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsSettings {
    /// Zone cluster names are created under; clusters cannot request DNS
    /// records when absent
    #[serde(default)]
    pub zone: Option<String>,
}

/// Polling interval settings, in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    #[serde(default = "default_tasks_interval")]
    pub tasks_interval_ms: u64,
}

fn default_readiness_interval() -> u64 {
    1000
}

fn default_tasks_interval() -> u64 {
    2000
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            readiness_interval_ms: default_readiness_interval(),
            tasks_interval_ms: default_tasks_interval(),
        }
    }
}

/// Cluster initialization settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    /// Per-service memory quotas in MiB
    #[serde(default)]
    pub memory_quotas: MemoryQuotaSettings,

    /// Storage engine mode of the index service
    #[serde(default = "default_index_storage_mode")]
    pub index_storage_mode: String,

    /// `ipv4` or `ipv6`
    #[serde(default = "default_address_family")]
    pub address_family: String,
}

fn default_index_storage_mode() -> String {
    "plasma".to_string()
}

fn default_address_family() -> String {
    "ipv4".to_string()
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            memory_quotas: MemoryQuotaSettings::default(),
            index_storage_mode: default_index_storage_mode(),
            address_family: default_address_family(),
        }
    }
}

/// Memory quotas in MiB
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryQuotaSettings {
    #[serde(default = "default_kv_quota")]
    pub kv: u64,
    #[serde(default = "default_service_quota")]
    pub index: u64,
    #[serde(default = "default_service_quota")]
    pub fts: u64,
    #[serde(default = "default_cbas_quota")]
    pub cbas: u64,
    #[serde(default = "default_service_quota")]
    pub eventing: u64,
}

fn default_kv_quota() -> u64 {
    512
}

fn default_service_quota() -> u64 {
    256
}

fn default_cbas_quota() -> u64 {
    1024
}

impl Default for MemoryQuotaSettings {
    fn default() -> Self {
        Self {
            kv: default_kv_quota(),
            index: default_service_quota(),
            fts: default_service_quota(),
            cbas: default_cbas_quota(),
            eventing: default_service_quota(),
        }
    }
}
