//! Docker runtime backend
//!
//! Drives the `docker` CLI. Nodes are containers; cluster membership is
//! carried by container labels.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::image::provider::ImageFetcher;
use crate::image::{ImageSource, ResolvedImage};
use crate::models::cluster::labels;
use crate::runtime::{Capabilities, CreateNodeSpec, NodeFilter, RuntimeBackend, RuntimeNode};

/// Profile file that switches a server image into its serverless mode
const SERVERLESS_PROFILE_PATH: &str = "/etc/couchbase.d/config_profile";

/// Run a docker command and return its raw output
async fn docker_output(args: &[&str]) -> Result<std::process::Output> {
    debug!("docker {}", args.join(" "));
    Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| OrchestratorError::RuntimeError(format!("Failed to run docker: {}", e)))
}

/// Run a docker command and return its stdout
async fn docker(args: &[&str]) -> Result<String> {
    let output = docker_output(args).await?;
    check_output(args.first().unwrap_or(&""), &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether a failed inspect only reports containers that no longer exist
fn is_missing_object(stderr: &str) -> bool {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    !lines.is_empty()
        && lines
            .iter()
            .all(|l| l.contains("No such object") || l.contains("No such container"))
}

/// Run a docker command feeding `input` on stdin
async fn docker_with_stdin(args: &[&str], input: &[u8]) -> Result<std::process::Output> {
    debug!("docker {} (with stdin)", args.join(" "));
    let mut child = Command::new("docker")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OrchestratorError::RuntimeError(format!("Failed to run docker: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
    }

    Ok(child.wait_with_output().await?)
}

fn check_output(command: &str, output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(OrchestratorError::RuntimeError(format!(
        "docker {} failed: {}",
        command,
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default)]
    networks: HashMap<String, InspectNetwork>,
}

#[derive(Debug, Deserialize)]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

impl InspectEntry {
    fn into_node(self, network: Option<&str>) -> RuntimeNode {
        let settings = self.network_settings;
        let from_network = match network {
            Some(name) => settings.networks.get(name).map(|n| n.ip_address.clone()),
            None => settings
                .networks
                .values()
                .map(|n| n.ip_address.clone())
                .find(|ip| !ip.is_empty()),
        };
        let ip_address = from_network
            .filter(|ip| !ip.is_empty())
            .or_else(|| Some(settings.ip_address).filter(|ip| !ip.is_empty()));

        RuntimeNode {
            resource_id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            ip_address,
            labels: self.config.labels.unwrap_or_default(),
            running: self.state.running,
        }
    }
}

/// Local Docker daemon backend
pub struct DockerBackend {
    network: Option<String>,
}

impl DockerBackend {
    pub fn new(network: Option<String>) -> Self {
        Self { network }
    }

    /// Inspect one container, `None` when it no longer exists
    async fn inspect_one(&self, id: &str) -> Result<Option<RuntimeNode>> {
        let output = docker_output(&["inspect", id]).await?;
        if !output.status.success() && is_missing_object(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(None);
        }
        check_output("inspect", &output)?;
        let entries: Vec<InspectEntry> = serde_json::from_slice(&output.stdout)?;
        Ok(entries
            .into_iter()
            .next()
            .map(|e| e.into_node(self.network.as_deref())))
    }

    async fn inspect(&self, ids: &[&str]) -> Result<Vec<RuntimeNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect"];
        args.extend_from_slice(ids);
        let stdout = docker(&args).await?;
        let entries: Vec<InspectEntry> = serde_json::from_str(&stdout)?;
        Ok(entries
            .into_iter()
            .map(|e| e.into_node(self.network.as_deref()))
            .collect())
    }
}

#[async_trait]
impl RuntimeBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<RuntimeNode>> {
        let mut label_filters = vec![format!("label={}", labels::CLUSTER_ID)];
        if let Some(cluster_id) = &filter.cluster_id {
            label_filters.push(format!("label={}={}", labels::CLUSTER_ID, cluster_id));
        }
        if let Some(node_id) = &filter.node_id {
            label_filters.push(format!("label={}={}", labels::NODE_ID, node_id));
        }

        let mut args = vec!["ps", "-aq", "--no-trunc"];
        for label in &label_filters {
            args.push("--filter");
            args.push(label);
        }
        let stdout = docker(&args).await?;
        let ids: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        // a container may vanish between ps and inspect
        match self.inspect(&ids).await {
            Ok(nodes) => Ok(nodes.into_iter().filter(|n| filter.matches(&n.labels)).collect()),
            Err(e) => {
                warn!("Batch inspect failed, inspecting one by one: {}", e);
                let mut nodes = Vec::new();
                for id in ids {
                    match self.inspect_one(id).await? {
                        Some(node) if filter.matches(&node.labels) => nodes.push(node),
                        Some(_) => {}
                        None => debug!("Container {} vanished before inspect", id),
                    }
                }
                Ok(nodes)
            }
        }
    }

    async fn create_node(&self, spec: &CreateNodeSpec) -> Result<RuntimeNode> {
        info!("Creating container {} from {}", spec.name, spec.image);

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = docker(&args).await?;
        let id = stdout.trim();

        self.inspect(&[id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::RuntimeError(format!("container {} vanished after creation", id)))
    }

    async fn remove_node(&self, resource_id: &str) -> Result<()> {
        info!("Removing container {}", resource_id);
        let output = docker_output(&["rm", "-f", "-v", resource_id]).await?;
        if !output.status.success() && is_missing_object(&String::from_utf8_lossy(&output.stderr)) {
            debug!("Container {} already gone", resource_id);
            return Ok(());
        }
        check_output("rm", &output)
    }

    async fn restart_node(&self, resource_id: &str) -> Result<()> {
        info!("Restarting container {}", resource_id);
        docker(&["restart", resource_id]).await?;
        Ok(())
    }

    async fn copy_to_node(&self, resource_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        debug!("Copying {} bytes to {}:{}", contents.len(), resource_id, path);
        let output = docker_with_stdin(
            &[
                "exec",
                "-i",
                resource_id,
                "sh",
                "-c",
                "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\"",
                "sh",
                path,
            ],
            contents,
        )
        .await?;
        check_output("exec", &output)
    }

    async fn copy_from_node(&self, resource_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let output = Command::new("docker")
            .args([
                "exec",
                resource_id,
                "sh",
                "-c",
                "test -f \"$1\" || exit 3; cat \"$1\"",
                "sh",
                path,
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OrchestratorError::RuntimeError(format!("Failed to run docker: {}", e)))?;

        if output.status.code() == Some(3) {
            return Ok(None);
        }
        check_output("exec", &output)?;
        Ok(Some(output.stdout))
    }
}

/// Pulls registry images and builds derived ones with the local daemon
pub struct DockerImageFetcher {
    build_repository: String,
    registry_token: Option<SecretString>,
}

impl DockerImageFetcher {
    pub fn new(build_repository: impl Into<String>, registry_token: Option<SecretString>) -> Self {
        Self {
            build_repository: build_repository.into(),
            registry_token,
        }
    }

    async fn exists(path: &str) -> bool {
        docker(&["image", "inspect", path]).await.is_ok()
    }

    async fn login(&self, path: &str) -> Result<()> {
        let Some(token) = &self.registry_token else {
            debug!("No registry token configured, attempting anonymous pull");
            return Ok(());
        };

        let registry = path.split('/').next().unwrap_or(path);
        debug!("Authenticating with {}", registry);
        let output = docker_with_stdin(
            &["login", registry, "-u", "ephemera", "--password-stdin"],
            token.expose_secret().as_bytes(),
        )
        .await?;

        if !output.status.success() {
            warn!("Login to {} failed, attempting anonymous pull", registry);
        }
        Ok(())
    }

    async fn pull(&self, path: &str, authenticated: bool) -> Result<()> {
        if Self::exists(path).await {
            debug!("Image {} already present", path);
            return Ok(());
        }
        if authenticated {
            self.login(path).await?;
        }
        info!("Pulling image {}", path);
        docker(&["pull", path]).await?;
        Ok(())
    }

    async fn build_serverless(&self, path: &str, base: &str) -> Result<()> {
        let authenticated = base.starts_with(&self.build_repository);
        self.pull(base, authenticated).await?;

        info!("Building serverless image {} from {}", path, base);
        let dockerfile = format!(
            "FROM {}\nRUN mkdir -p $(dirname {profile}) && echo serverless > {profile}\n",
            base,
            profile = SERVERLESS_PROFILE_PATH
        );
        let output = docker_with_stdin(&["build", "-t", path, "-"], dockerfile.as_bytes()).await?;
        check_output("build", &output)
    }
}

#[async_trait]
impl ImageFetcher for DockerImageFetcher {
    async fn ensure_available(&self, image: &ResolvedImage) -> Result<()> {
        match &image.source {
            ImageSource::Registry { authenticated } => {
                self.pull(&image.artifact_path, *authenticated).await
            }
            ImageSource::Derived { base } => {
                if Self::exists(&image.artifact_path).await {
                    debug!("Image {} already built", image.artifact_path);
                    return Ok(());
                }
                self.build_serverless(&image.artifact_path, base).await
            }
        }
    }
}
