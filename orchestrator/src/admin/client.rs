//! HTTP client for the administrative API

use std::sync::Arc;
use std::time::Duration;

use admin_api::models::{
    AddNodeRequest, ErrorResponse, MemoryQuotaRequest, PoolDefaultResponse, PoolsResponse, RebalanceRequest,
    TaskInfo, TrustedCa,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};
use url::Url;

use crate::admin::{AdminApi, AdminConnector};
use crate::errors::{OrchestratorError, Result};
use crate::storage::settings::AdminSettings;

/// Form-encoded administrative client for one node
pub struct AdminClient {
    client: Client,
    address: String,
    base_url: Url,
    username: String,
    password: SecretString,
}

impl AdminClient {
    /// Create a client for `address` (an IP address or host name)
    pub fn new(client: Client, address: &str, settings: &AdminSettings) -> Result<Self> {
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{}]", address)
        } else {
            address.to_string()
        };
        let base_url = Url::parse(&format!("http://{}:{}", host, settings.port))
            .map_err(|e| OrchestratorError::ConfigError(format!("invalid node address {}: {}", address, e)))?;

        Ok(Self {
            client,
            address: address.to_string(),
            base_url,
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| OrchestratorError::Internal(format!("invalid admin path {}: {}", path, e)))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(self.password.expose_secret()))
    }

    async fn send(&self, method: &str, path: &str, request: RequestBuilder) -> Result<reqwest::Response> {
        debug!("{} {}{}", method, self.address, path);
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = error_message(response.text().await.unwrap_or_default());
            error!("Admin {} {} failed: {} - {}", method, path, status, body);
            return Err(OrchestratorError::AdminApi {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.authed(self.client.get(self.url(path)?));
        let response = self.send("GET", path, request).await?;
        Ok(response.json().await?)
    }

    async fn post_form<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let request = self.authed(self.client.post(self.url(path)?)).form(body);
        self.send("POST", path, request).await?;
        Ok(())
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let request = self.authed(self.client.post(self.url(path)?));
        self.send("POST", path, request).await?;
        Ok(())
    }
}

#[async_trait]
impl AdminApi for AdminClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<PoolsResponse> {
        self.get("/pools").await
    }

    async fn set_memory_quotas(&self, quotas: &MemoryQuotaRequest) -> Result<()> {
        self.post_form("/pools/default", quotas).await
    }

    async fn setup_services(&self, services: &str) -> Result<()> {
        self.post_form("/node/controller/setupServices", &[("services", services)])
            .await
    }

    async fn setup_net_config(&self, address_family: &str) -> Result<()> {
        self.post_form(
            "/node/controller/setupNetConfig",
            &[("afamily", address_family)],
        )
        .await
    }

    async fn set_index_storage_mode(&self, mode: &str) -> Result<()> {
        self.post_form("/settings/indexes", &[("storageMode", mode)])
            .await
    }

    async fn set_web_credentials(&self) -> Result<()> {
        let port = self.base_url.port().unwrap_or(8091).to_string();
        self.post_form(
            "/settings/web",
            &[
                ("username", self.username.as_str()),
                ("password", self.password.expose_secret()),
                ("port", port.as_str()),
            ],
        )
        .await
    }

    async fn add_node(&self, request: &AddNodeRequest) -> Result<()> {
        self.post_form("/controller/addNode", request).await
    }

    async fn rebalance(&self, request: &RebalanceRequest) -> Result<()> {
        self.post_form("/controller/rebalance", request).await
    }

    async fn tasks(&self) -> Result<Vec<TaskInfo>> {
        self.get("/pools/default/tasks").await
    }

    async fn pool_default(&self) -> Result<PoolDefaultResponse> {
        self.get("/pools/default").await
    }

    async fn load_trusted_cas(&self) -> Result<()> {
        self.post_empty("/node/controller/loadTrustedCAs").await
    }

    async fn reload_certificate(&self) -> Result<()> {
        self.post_empty("/node/controller/reloadCertificate").await
    }

    async fn trusted_cas(&self) -> Result<Vec<TrustedCa>> {
        self.get("/pools/default/trustedCAs").await
    }

    async fn delete_trusted_ca(&self, id: i64) -> Result<()> {
        let path = format!("/pools/default/trustedCAs/{}", id);
        let request = self.authed(self.client.delete(self.url(&path)?));
        self.send("DELETE", &path, request).await?;
        Ok(())
    }
}

/// Opens [`AdminClient`]s that share one connection pool
pub struct HttpAdminConnector {
    client: Client,
    settings: AdminSettings,
}

impl HttpAdminConnector {
    pub fn new(settings: AdminSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self { client, settings })
    }
}

impl AdminConnector for HttpAdminConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn AdminApi>> {
        Ok(Arc::new(AdminClient::new(
            self.client.clone(),
            address,
            &self.settings,
        )?))
    }
}

/// The decoded messages of an error body, or the raw body when it is not a
/// structured error
fn error_message(body: String) -> String {
    serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(|e| e.message())
        .unwrap_or(body)
}
