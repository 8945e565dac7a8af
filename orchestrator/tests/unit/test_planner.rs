//! Topology planner tests

use std::sync::Arc;

use ephemera::deploy::planner::{order_for_bootstrap, Planner};
use ephemera::deploy::provisioner::ClusterTraits;
use ephemera::errors::OrchestratorError;
use ephemera::image::resolver::ImageResolver;
use ephemera::image::Variant;
use ephemera::models::cluster::{NodeMeta, NodeRole, ProvisionedNode};
use ephemera::runtime::{Capabilities, Capability};
use ephemera::storage::settings::ImageSettings;

use crate::support::{cluster_def, group, test_options, FakeFetcher, FakeRuntime};

fn traits() -> ClusterTraits {
    ClusterTraits {
        cluster_id: "c1".to_string(),
        purpose: "planning".to_string(),
        expiry: None,
        custom_ca: false,
        use_dns: false,
    }
}

fn planner(fetcher: Arc<FakeFetcher>) -> Planner {
    planner_on(fetcher, FakeRuntime::new())
}

fn planner_on(fetcher: Arc<FakeFetcher>, runtime: Arc<FakeRuntime>) -> Planner {
    let resolver = Arc::new(ImageResolver::from_settings(&ImageSettings::default()));
    Planner::new(resolver, fetcher, runtime, Arc::new(test_options()))
}

fn member(version: &str, ip: &str) -> ProvisionedNode {
    ProvisionedNode::new(
        format!("res-{}", ip),
        ip.to_string(),
        NodeMeta {
            cluster_id: "c1".to_string(),
            node_id: format!("node-{}", ip),
            role: NodeRole::ClusterMember,
            purpose: String::new(),
            creator: String::new(),
            expiry: None,
            initial_version: version.to_string(),
            variant: Variant::Standard,
            dns_name: None,
            services: Vec::new(),
            server_group: None,
            custom_ca: false,
            use_dns: false,
        },
    )
}

#[test]
fn test_mixed_versions_bring_up_oldest_first() {
    let ordered = order_for_bootstrap(vec![
        member("7.6.0", "10.0.0.3"),
        member("7.2.0", "10.0.0.4"),
        member("7.6.0", "10.0.0.2"),
    ]);

    let versions: Vec<&str> = ordered.iter().map(|n| n.initial_version.as_str()).collect();
    let addresses: Vec<&str> = ordered.iter().map(|n| n.ip_address.as_str()).collect();
    assert_eq!(versions, vec!["7.2.0", "7.6.0", "7.6.0"]);
    assert_eq!(addresses, vec!["10.0.0.4", "10.0.0.2", "10.0.0.3"]);
}

#[test]
fn test_order_compares_versions_numerically() {
    let ordered = order_for_bootstrap(vec![member("7.10.0", "10.0.0.2"), member("7.9.0", "10.0.0.3")]);
    assert_eq!(ordered[0].initial_version, "7.9.0");
}

#[tokio::test]
async fn test_groups_expand_to_numbered_jobs() {
    let fetcher = Arc::new(FakeFetcher::default());
    let planner = planner(fetcher.clone());

    let mut search = group(1, "7.2.0");
    search.server_group = Some("Group 2".to_string());
    search.env.insert("TZ".to_string(), "UTC".to_string());

    let mut def = cluster_def(vec![group(2, "7.6.0"), search]);
    def.load_balancer = true;
    let plan = planner.plan(&def, &traits()).await.unwrap();

    let numbers: Vec<u32> = plan.members.iter().map(|j| j.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(plan.members[2].server_group.as_deref(), Some("Group 2"));
    assert_eq!(plan.members[2].env.get("TZ").map(String::as_str), Some("UTC"));
    assert_eq!(plan.members[0].initial_version, "7.6.0");

    assert_eq!(plan.auxiliary.len(), 1);
    assert_eq!(plan.auxiliary[0].role, NodeRole::LoadBalancer);
    assert_eq!(plan.auxiliary[0].number, 4);
    assert_eq!(plan.into_jobs().len(), 4);
}

#[tokio::test]
async fn test_equal_specs_share_one_fetch() {
    let fetcher = Arc::new(FakeFetcher::default());
    let planner = planner(fetcher.clone());

    let groups = vec![
        group(1, "7.6.0"),
        group(2, "7.2.0"),
        group(1, "enterprise-7.6.0-0"),
    ];
    let jobs = planner.plan_groups(&groups, &traits(), 1).await.unwrap();

    assert_eq!(jobs.len(), 4);
    assert_eq!(jobs[0].image, jobs[3].image);
    let mut fetched = fetcher.fetched.lock().unwrap().clone();
    fetched.sort();
    assert_eq!(
        fetched,
        vec![
            "couchbase/server:enterprise-7.2.0".to_string(),
            "couchbase/server:enterprise-7.6.0".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_invalid_specifier_fetches_nothing() {
    let fetcher = Arc::new(FakeFetcher::default());
    let planner = planner(fetcher.clone());

    let groups = vec![group(1, "7.6.0"), group(1, "7")];
    let err = planner.plan_groups(&groups, &traits(), 1).await.unwrap_err();
    assert!(err.is_terminal());
    assert!(fetcher.fetched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_serverless_needs_a_backend_that_builds_images() {
    let fetcher = Arc::new(FakeFetcher::default());
    let runtime = FakeRuntime::with_capabilities(
        Capabilities::none()
            .with(Capability::CopyFiles)
            .with(Capability::Restart),
    );
    let planner = planner_on(fetcher.clone(), runtime);

    let err = planner
        .plan_groups(&[group(1, "7.6.0-serverless")], &traits(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), OrchestratorError::Unsupported { .. }));
    assert!(err.is_terminal());
    assert!(fetcher.fetched.lock().unwrap().is_empty());

    // Registry images need nothing from the backend
    let jobs = planner.plan_groups(&[group(1, "7.6.0")], &traits(), 1).await.unwrap();
    assert_eq!(jobs.len(), 1);
}
