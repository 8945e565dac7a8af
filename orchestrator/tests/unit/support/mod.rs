//! In-memory fakes of every external collaborator

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use admin_api::models::{
    AddNodeRequest, MemoryQuotaRequest, NodeInfo, PoolDefaultResponse, PoolsResponse,
    RebalanceRequest, TaskInfo, TrustedCa,
};
use async_trait::async_trait;

use ephemera::admin::{AdminApi, AdminConnector};
use ephemera::converge::PollOptions;
use ephemera::deploy::orchestrator::Orchestrator;
use ephemera::deploy::{Backends, Options};
use ephemera::errors::{OrchestratorError, Result};
use ephemera::image::provider::ImageFetcher;
use ephemera::image::resolver::ImageResolver;
use ephemera::image::ResolvedImage;
use ephemera::models::cluster::{default_services, ClusterDef, NodeGroupSpec, ProvisionedNode};
use ephemera::runtime::{Capabilities, CreateNodeSpec, NodeFilter, RuntimeBackend, RuntimeNode};
use ephemera::storage::settings::ImageSettings;
use ephemera::wiring::certs::{CertificateAuthority, RcgenCa};
use ephemera::wiring::dns::{DnsProvider, DnsRecord};
use ephemera::wiring::lb::{LbTarget, LoadBalancerController};

// ================================= RUNTIME ===================================== //

#[derive(Default)]
pub struct RuntimeState {
    pub nodes: BTreeMap<String, RuntimeNode>,
    pub files: HashMap<(String, String), Vec<u8>>,
    pub created: Vec<CreateNodeSpec>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub creates: u32,
    /// 1-based create call that fails
    pub fail_create_at: Option<u32>,
    /// Nodes that refuse to be removed
    pub fail_remove: HashSet<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    pub state: Mutex<RuntimeState>,
    /// Every capability when `None`
    pub limited: Option<Capabilities>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            limited: Some(capabilities),
            ..Self::default()
        })
    }

    pub fn fail_create_at(&self, call: u32) {
        self.state.lock().unwrap().fail_create_at = Some(call);
    }

    pub fn fail_remove(&self, resource_id: &str) {
        self.state.lock().unwrap().fail_remove.insert(resource_id.to_string());
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .any(|n| n.ip_address.as_deref() == Some(ip))
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }

    pub fn file(&self, resource_id: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(resource_id.to_string(), path.to_string()))
            .cloned()
    }

    /// Remove a node behind the orchestrator's back
    pub fn vanish(&self, resource_id: &str) {
        self.state.lock().unwrap().nodes.remove(resource_id);
    }
}

#[async_trait]
impl RuntimeBackend for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        self.limited.clone().unwrap_or_else(Capabilities::all)
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<RuntimeNode>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .values()
            .filter(|n| filter.matches(&n.labels))
            .cloned()
            .collect())
    }

    async fn create_node(&self, spec: &CreateNodeSpec) -> Result<RuntimeNode> {
        let mut state = self.state.lock().unwrap();
        state.creates += 1;
        if state.fail_create_at == Some(state.creates) {
            return Err(OrchestratorError::RuntimeError("simulated create failure".to_string()));
        }

        let number = state.creates;
        let node = RuntimeNode {
            resource_id: format!("res-{}", number),
            name: spec.name.clone(),
            ip_address: Some(format!("10.0.0.{}", number + 1)),
            labels: spec.labels.clone().into_iter().collect(),
            running: true,
        };
        state.created.push(spec.clone());
        state.nodes.insert(node.resource_id.clone(), node.clone());
        Ok(node)
    }

    async fn remove_node(&self, resource_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove.contains(resource_id) {
            return Err(OrchestratorError::RuntimeError(format!("{} is busy", resource_id)));
        }
        state.nodes.remove(resource_id);
        state.files.retain(|(id, _), _| id != resource_id);
        state.removed.push(resource_id.to_string());
        Ok(())
    }

    async fn restart_node(&self, resource_id: &str) -> Result<()> {
        self.state.lock().unwrap().restarted.push(resource_id.to_string());
        Ok(())
    }

    async fn copy_to_node(&self, resource_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((resource_id.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    async fn copy_from_node(&self, resource_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.file(resource_id, path))
    }
}

// ================================ ADMIN API ==================================== //

#[derive(Debug, Clone)]
pub struct SimNode {
    pub ip: String,
    pub membership: String,
    pub health: String,
}

impl SimNode {
    pub fn otp(&self) -> String {
        format!("ns_1@{}", self.ip)
    }
}

/// Cluster membership as the database would track it
pub struct AdminState {
    pub members: Vec<SimNode>,
    pub balanced: bool,
    /// `operation address` of every mutating call
    pub calls: Vec<String>,
    pub failing: HashSet<String>,
    pub quotas: Option<MemoryQuotaRequest>,
    pub added: Vec<AddNodeRequest>,
    /// `(address, known, ejected)` of every rebalance
    pub rebalances: Vec<(String, String, String)>,
    pub running_polls: u32,
    pub busy_polls_per_rebalance: u32,
    /// Rebalances that ignore the ejection of an address
    pub stuck: HashMap<String, u32>,
    /// Rebalances that leave the cluster unbalanced
    pub unbalanced_rebalances: u32,
    pub deleted_cas: Vec<i64>,
}

impl Default for AdminState {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            balanced: true,
            calls: Vec::new(),
            failing: HashSet::new(),
            quotas: None,
            added: Vec::new(),
            rebalances: Vec::new(),
            running_polls: 0,
            busy_polls_per_rebalance: 2,
            stuck: HashMap::new(),
            unbalanced_rebalances: 0,
            deleted_cas: Vec::new(),
        }
    }
}

pub struct FakeAdmin {
    runtime: Arc<FakeRuntime>,
    pub state: Arc<Mutex<AdminState>>,
}

impl FakeAdmin {
    pub fn new(runtime: Arc<FakeRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            state: Arc::new(Mutex::new(AdminState::default())),
        })
    }

    pub fn fail(&self, operation: &str) {
        self.state.lock().unwrap().failing.insert(operation.to_string());
    }

    pub fn member_ips(&self) -> Vec<String> {
        self.state.lock().unwrap().members.iter().map(|m| m.ip.clone()).collect()
    }

    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .cloned()
            .collect()
    }
}

impl AdminConnector for FakeAdmin {
    fn connect(&self, address: &str) -> Result<Arc<dyn AdminApi>> {
        Ok(Arc::new(FakeAdminClient {
            address: address.to_string(),
            runtime: self.runtime.clone(),
            state: self.state.clone(),
        }))
    }
}

struct FakeAdminClient {
    address: String,
    runtime: Arc<FakeRuntime>,
    state: Arc<Mutex<AdminState>>,
}

impl FakeAdminClient {
    fn reachable(&self) -> Result<()> {
        if self.runtime.has_ip(&self.address) {
            Ok(())
        } else {
            Err(OrchestratorError::AdminApi {
                status: 503,
                body: format!("{} unreachable", self.address),
            })
        }
    }

    fn call(&self, operation: &str) -> Result<()> {
        self.reachable()?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", operation, self.address));
        if state.failing.contains(operation) {
            return Err(OrchestratorError::AdminApi {
                status: 400,
                body: format!("{} rejected", operation),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AdminApi for FakeAdminClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<PoolsResponse> {
        self.reachable()?;
        Ok(PoolsResponse::default())
    }

    async fn set_memory_quotas(&self, quotas: &MemoryQuotaRequest) -> Result<()> {
        self.call("memory_quotas")?;
        self.state.lock().unwrap().quotas = Some(quotas.clone());
        Ok(())
    }

    async fn setup_services(&self, _services: &str) -> Result<()> {
        self.call("setup_services")
    }

    async fn setup_net_config(&self, _address_family: &str) -> Result<()> {
        self.call("net_config")
    }

    async fn set_index_storage_mode(&self, _mode: &str) -> Result<()> {
        self.call("index_storage_mode")
    }

    async fn set_web_credentials(&self) -> Result<()> {
        self.call("web_credentials")?;
        let mut state = self.state.lock().unwrap();
        state.members = vec![SimNode {
            ip: self.address.clone(),
            membership: "active".to_string(),
            health: "healthy".to_string(),
        }];
        Ok(())
    }

    async fn add_node(&self, request: &AddNodeRequest) -> Result<()> {
        self.call("add_node")?;
        let mut state = self.state.lock().unwrap();
        state.added.push(request.clone());
        state.members.push(SimNode {
            ip: request.hostname.clone(),
            membership: "inactiveAdded".to_string(),
            health: "healthy".to_string(),
        });
        Ok(())
    }

    async fn rebalance(&self, request: &RebalanceRequest) -> Result<()> {
        self.call("rebalance")?;
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.rebalances.push((
            self.address.clone(),
            request.known_nodes.clone(),
            request.ejected_nodes.clone(),
        ));

        for otp in request.ejected_nodes.split(',').filter(|o| !o.is_empty()) {
            let ip = otp.trim_start_matches("ns_1@").to_string();
            match state.stuck.get_mut(&ip) {
                Some(left) if *left > 0 => *left -= 1,
                _ => state.members.retain(|m| m.ip != ip),
            }
        }
        for member in state.members.iter_mut() {
            member.membership = "active".to_string();
        }

        if state.unbalanced_rebalances > 0 {
            state.unbalanced_rebalances -= 1;
            state.balanced = false;
        } else {
            state.balanced = true;
        }
        state.running_polls = state.busy_polls_per_rebalance;
        Ok(())
    }

    async fn tasks(&self) -> Result<Vec<TaskInfo>> {
        self.reachable()?;
        let mut state = self.state.lock().unwrap();
        let status = if state.running_polls > 0 {
            state.running_polls -= 1;
            "running"
        } else {
            "notRunning"
        };
        Ok(vec![TaskInfo {
            task_type: "rebalance".to_string(),
            status: status.to_string(),
            progress: None,
        }])
    }

    async fn pool_default(&self) -> Result<PoolDefaultResponse> {
        self.reachable()?;
        let state = self.state.lock().unwrap();
        if !state.members.iter().any(|m| m.ip == self.address) {
            return Err(OrchestratorError::AdminApi {
                status: 404,
                body: "unknown pool".to_string(),
            });
        }

        let nodes = state
            .members
            .iter()
            .map(|m| NodeInfo {
                otp_node: m.otp(),
                hostname: format!("{}:8091", m.ip),
                status: m.health.clone(),
                cluster_membership: m.membership.clone(),
                this_node: m.ip == self.address,
                ..Default::default()
            })
            .collect();
        Ok(PoolDefaultResponse {
            nodes,
            balanced: state.balanced,
        })
    }

    async fn load_trusted_cas(&self) -> Result<()> {
        self.call("load_trusted_cas")
    }

    async fn reload_certificate(&self) -> Result<()> {
        self.call("reload_certificate")
    }

    async fn trusted_cas(&self) -> Result<Vec<TrustedCa>> {
        self.reachable()?;
        Ok(vec![
            TrustedCa {
                id: 1,
                subject: "Couchbase Server".to_string(),
                ca_type: "generated".to_string(),
                pem: String::new(),
            },
            TrustedCa {
                id: 2,
                subject: "Ephemera Root CA".to_string(),
                ca_type: "uploaded".to_string(),
                pem: String::new(),
            },
        ])
    }

    async fn delete_trusted_ca(&self, id: i64) -> Result<()> {
        self.call("delete_trusted_ca")?;
        self.state.lock().unwrap().deleted_cas.push(id);
        Ok(())
    }
}

// ============================ FETCHER / LB / DNS ================================= //

#[derive(Default)]
pub struct FakeFetcher {
    pub fetched: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn ensure_available(&self, image: &ResolvedImage) -> Result<()> {
        self.fetched.lock().unwrap().push(image.artifact_path.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LbUpdate {
    pub lb_node_id: String,
    pub targets: Vec<LbTarget>,
    pub tls_enabled: bool,
    pub variant_flag: bool,
}

#[derive(Default)]
pub struct FakeLb {
    pub updates: Mutex<Vec<LbUpdate>>,
}

impl FakeLb {
    pub fn last(&self) -> Option<LbUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LoadBalancerController for FakeLb {
    async fn update_config(
        &self,
        lb_node: &ProvisionedNode,
        targets: &[LbTarget],
        tls_enabled: bool,
        variant_flag: bool,
    ) -> Result<()> {
        self.updates.lock().unwrap().push(LbUpdate {
            lb_node_id: lb_node.node_id.clone(),
            targets: targets.to_vec(),
            tls_enabled,
            variant_flag,
        });
        Ok(())
    }
}

pub const ZONE: &str = "test.local";

#[derive(Default)]
pub struct FakeDns {
    pub records: Mutex<BTreeMap<String, DnsRecord>>,
}

impl FakeDns {
    pub fn record(&self, name: &str) -> Option<DnsRecord> {
        self.records.lock().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    fn hostname(&self) -> &str {
        ZONE
    }

    async fn update_records(&self, records: &[DnsRecord], _no_wait: bool, _no_propagation: bool) -> Result<()> {
        let mut zone = self.records.lock().unwrap();
        for record in records {
            zone.insert(record.name.clone(), record.clone());
        }
        Ok(())
    }

    async fn remove_records(&self, names: &[String], _no_wait: bool, _no_propagation: bool) -> Result<()> {
        let mut zone = self.records.lock().unwrap();
        for name in names {
            zone.remove(name);
        }
        Ok(())
    }
}

// ================================= HARNESS ===================================== //

pub fn test_options() -> Options {
    Options {
        readiness_poll: PollOptions::every(Duration::from_millis(100)),
        tasks_poll: PollOptions::every(Duration::from_millis(100)),
        reconcile_attempts: 5,
        ..Options::default()
    }
}

pub fn group(count: u32, version: &str) -> NodeGroupSpec {
    NodeGroupSpec {
        count,
        version: version.to_string(),
        services: default_services(),
        server_group: None,
        env: BTreeMap::new(),
    }
}

pub fn cluster_def(groups: Vec<NodeGroupSpec>) -> ClusterDef {
    ClusterDef {
        purpose: "integration test".to_string(),
        expiry_secs: None,
        groups,
        load_balancer: false,
        blob_store_mock: false,
        use_custom_ca: false,
        use_dns: false,
    }
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub admin: Arc<FakeAdmin>,
    pub fetcher: Arc<FakeFetcher>,
    pub lb: Arc<FakeLb>,
    pub dns: Arc<FakeDns>,
    pub root_ca: Arc<RcgenCa>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(test_options())
    }

    pub fn with_options(options: Options) -> Self {
        let runtime = FakeRuntime::new();
        let admin = FakeAdmin::new(runtime.clone());
        let fetcher = Arc::new(FakeFetcher::default());
        let lb = Arc::new(FakeLb::default());
        let dns = Arc::new(FakeDns::default());
        let root_ca = Arc::new(RcgenCa::root("test-machine").unwrap());

        let root: Arc<dyn CertificateAuthority> = root_ca.clone();
        let backends = Backends {
            runtime: runtime.clone(),
            admin: admin.clone(),
            fetcher: fetcher.clone(),
            load_balancer: lb.clone(),
            dns: Some(dns.clone()),
            root_ca: Some(root),
        };
        let resolver = Arc::new(ImageResolver::from_settings(&ImageSettings::default()));
        let orchestrator = Orchestrator::new(backends, resolver, options);

        Self {
            runtime,
            admin,
            fetcher,
            lb,
            dns,
            root_ca,
            orchestrator,
        }
    }
}
