//! Error types for the orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("admin API returned {status}: {body}")]
    AdminApi { status: u16, body: String },

    #[error("invalid version format: {0}")]
    InvalidVersionFormat(String),

    #[error("no image provider can serve {0}")]
    NoImageProvider(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("{capability} is not supported by the {backend} backend")]
    Unsupported {
        backend: String,
        capability: String,
    },

    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },

    #[error("{what} disappeared while waiting for state {desired:?}")]
    ResourceVanished { what: String, desired: String },

    #[error("no control node available in cluster {cluster_id}")]
    NoControlNodeAvailable { cluster_id: String },

    #[error("rebalance of cluster {cluster_id} did not converge after {attempts} attempts")]
    RebalanceReconciliationExhausted { cluster_id: String, attempts: u32 },

    #[error("certificate error: {0}")]
    CertificateError(String),

    #[error("DNS error: {0}")]
    DnsError(String),

    #[error("load balancer error: {0}")]
    LoadBalancerError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("shutdown error: {0}")]
    ShutdownError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<OrchestratorError>,
    },
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

impl OrchestratorError {
    /// The innermost error of a context chain
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Errors that must surface immediately and never be retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.root(),
            OrchestratorError::InvalidVersionFormat(_)
                | OrchestratorError::NoImageProvider(_)
                | OrchestratorError::Unsupported { .. }
                | OrchestratorError::Cancelled { .. }
                | OrchestratorError::ResourceVanished { .. }
                | OrchestratorError::NoControlNodeAvailable { .. }
                | OrchestratorError::RebalanceReconciliationExhausted { .. }
                | OrchestratorError::ConfigError(_)
        )
    }

    /// Transport failures and not-ready responses
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), OrchestratorError::Cancelled { .. })
    }
}

/// Adds a layer of context to an error, producing chains like
/// "failed to configure the first node: failed to set memory quotas: ..."
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> std::result::Result<T, OrchestratorError>;

    fn with_context<F>(self, f: F) -> std::result::Result<T, OrchestratorError>
    where
        F: FnOnce() -> String;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<OrchestratorError>,
{
    fn context(self, context: impl Into<String>) -> std::result::Result<T, OrchestratorError> {
        self.map_err(|e| OrchestratorError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F>(self, f: F) -> std::result::Result<T, OrchestratorError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| OrchestratorError::Context {
            context: f(),
            source: Box::new(e.into()),
        })
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;
