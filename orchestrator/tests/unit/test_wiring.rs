//! DNS, load balancer and certificate wiring across the cluster lifecycle

use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use ephemera::cluster::view::ClusterView;
use ephemera::models::cluster::{ProvisionedNode, RebalancePlan};
use ephemera::wiring::certs::CertificateAuthority;
use ephemera::wiring::dns::{cluster_name, RecordKind};

use crate::support::{cluster_def, group, Harness, ZONE};

const MARKER: &str = "/opt/couchbase/var/lib/couchbase/.ephemera-cert-issued";
const CA_FILE: &str = "/opt/couchbase/var/lib/couchbase/inbox/CA/ca.pem";

async fn deploy_wired(harness: &Harness, count: u32) -> ClusterView {
    let mut def = cluster_def(vec![group(count, "7.6.0")]);
    def.load_balancer = true;
    def.use_dns = true;
    def.use_custom_ca = true;
    harness
        .orchestrator
        .new_cluster(&CancellationToken::new(), &def)
        .await
        .unwrap()
}

fn has_certificate(harness: &Harness, node: &ProvisionedNode) -> bool {
    harness.runtime.file(&node.resource_id, MARKER) == Some(node.node_id.as_bytes().to_vec())
}

fn cluster_ips(harness: &Harness, view: &ClusterView) -> Vec<String> {
    let mut ips = harness
        .dns
        .record(&cluster_name(&view.cluster_id, ZONE))
        .map(|r| r.values)
        .unwrap_or_default();
    ips.sort();
    ips
}

#[tokio::test(start_paused = true)]
async fn test_new_cluster_is_wired() {
    let harness = Harness::new();
    let view = deploy_wired(&harness, 3).await;
    let members: Vec<&ProvisionedNode> = view.members().collect();
    let lb_node = view.load_balancer().unwrap();

    // DNS: one record per member, the cluster name and both SRV records
    let mut member_ips: Vec<String> = members.iter().map(|m| m.ip_address.clone()).collect();
    member_ips.sort();
    assert_eq!(cluster_ips(&harness, &view), member_ips);
    for member in &members {
        let name = member.dns_name.clone().unwrap();
        assert!(name.ends_with(&cluster_name(&view.cluster_id, ZONE)));
        assert_eq!(harness.dns.record(&name).unwrap().values, vec![member.ip_address.clone()]);
    }
    let srv = harness
        .dns
        .record(&format!("_couchbases._tcp.{}", cluster_name(&view.cluster_id, ZONE)))
        .unwrap();
    assert_eq!(srv.kind, RecordKind::Srv);
    assert_eq!(srv.values.len(), 3);

    // Load balancer: every member, TLS on
    let update = harness.lb.last().unwrap();
    assert_eq!(update.lb_node_id, lb_node.node_id);
    assert_eq!(update.targets.len(), 3);
    assert!(update.tls_enabled);
    assert!(!update.variant_flag);

    // Certificates: members only, installed once
    for member in &members {
        assert!(has_certificate(&harness, member));
        let ca = harness.runtime.file(&member.resource_id, CA_FILE).unwrap();
        assert_eq!(ca, harness.root_ca.cert_pem().as_bytes());
    }
    assert!(!has_certificate(&harness, lb_node));
    assert_eq!(harness.admin.calls_of("reload_certificate").len(), 3);
    assert_eq!(harness.admin.state.lock().unwrap().deleted_cas, vec![1, 1, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_wiring_follows_topology_changes() {
    let harness = Harness::new();
    let view = deploy_wired(&harness, 3).await;
    let leaving = view.members().next().unwrap().clone();

    let plan = RebalancePlan {
        node_groups_to_add: vec![group(1, "7.6.0")],
        nodes_to_remove: vec![leaving.node_id.clone()],
    };
    let done = harness
        .orchestrator
        .modify_cluster(&CancellationToken::new(), &view.cluster_id, &plan)
        .await
        .unwrap();
    let joined = &done.added[0];

    assert!(harness.dns.record(leaving.dns_name.as_deref().unwrap()).is_none());
    assert!(harness.dns.record(joined.dns_name.as_deref().unwrap()).is_some());

    let mut expected: Vec<String> = done.view.members().map(|m| m.ip_address.clone()).collect();
    expected.sort();
    assert_eq!(expected.len(), 3);
    assert!(!expected.contains(&leaving.ip_address));
    assert_eq!(cluster_ips(&harness, &view), expected);

    let update = harness.lb.last().unwrap();
    let mut targets: Vec<String> = update.targets.iter().map(|t| t.address.clone()).collect();
    targets.sort();
    assert_eq!(targets, expected);

    // The new member got its certificate before joining; nobody got a second one
    assert!(has_certificate(&harness, joined));
    assert_eq!(harness.admin.calls_of("reload_certificate").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_remove_cluster_clears_dns_and_nodes() {
    let harness = Harness::new();
    let view = deploy_wired(&harness, 2).await;
    assert!(harness.dns.len() > 0);

    let removed = assert_ok!(harness.orchestrator.remove_cluster(&view.cluster_id).await);
    assert_eq!(removed, 3);
    assert_eq!(harness.dns.len(), 0);
    assert_eq!(harness.runtime.node_count(), 0);

    // Removing again is a no-op
    assert_eq!(assert_ok!(harness.orchestrator.remove_cluster(&view.cluster_id).await), 0);
}

#[tokio::test(start_paused = true)]
async fn test_plain_cluster_has_no_wiring() {
    let harness = Harness::new();
    let view = harness
        .orchestrator
        .new_cluster(&CancellationToken::new(), &cluster_def(vec![group(2, "7.6.0")]))
        .await
        .unwrap();

    assert_eq!(harness.dns.len(), 0);
    assert!(harness.lb.last().is_none());
    assert!(view.members().all(|m| !has_certificate(&harness, m)));
    assert!(harness.admin.calls_of("load_trusted_cas").is_empty());
}
