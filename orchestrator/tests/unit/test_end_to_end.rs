//! Cluster deployment against the simulated runtime and admin API

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use ephemera::cluster::view::ClusterState;
use ephemera::models::cluster::{NodeRole, RebalancePlan};
use ephemera::workers::reaper;

use crate::support::{cluster_def, group, Harness};

#[tokio::test(start_paused = true)]
async fn test_three_node_cluster_bootstraps_through_first_node() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let view = harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(3, "7.6.0")]))
        .await
        .unwrap();
    assert_eq!(view.members().count(), 3);

    let init = harness.admin.calls_of("web_credentials");
    assert_eq!(init.len(), 1);
    let first = init[0].split(' ').nth(1).unwrap().to_string();

    let adds = harness.admin.calls_of("add_node");
    assert_eq!(adds.len(), 2);
    assert!(adds.iter().all(|c| c.ends_with(&first)));
    assert_eq!(harness.admin.calls_of("rebalance").len(), 1);

    let mut members = harness.admin.member_ips();
    members.sort();
    let mut provisioned: Vec<String> = view.members().map(|m| m.ip_address.clone()).collect();
    provisioned.sort();
    assert_eq!(members, provisioned);

    let ex = harness.orchestrator.get_cluster_ex(&view.cluster_id).await.unwrap();
    assert_eq!(ex.state(), ClusterState::Ready);
    assert_eq!(harness.orchestrator.list_clusters().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_versions_initialize_on_oldest_node() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let def = cluster_def(vec![group(1, "7.6.0"), group(1, "7.2.0"), group(1, "7.6.0")]);
    let view = harness.orchestrator.new_cluster(&cancel, &def).await.unwrap();

    let oldest = view
        .members()
        .find(|m| m.initial_version == "7.2.0")
        .unwrap();
    assert_eq!(
        harness.admin.calls_of("web_credentials"),
        vec![format!("web_credentials {}", oldest.ip_address)]
    );
    assert_eq!(harness.fetcher.fetched.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_failure_removes_every_node() {
    let harness = Harness::new();
    harness.admin.fail("add_node");
    let cancel = CancellationToken::new();

    let err = harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(3, "7.6.0")]))
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.starts_with("failed to bootstrap the cluster: failed to add node"), "{}", message);
    assert!(message.ends_with("add_node rejected"), "{}", message);
    assert_eq!(harness.runtime.node_count(), 0);
    assert!(harness.orchestrator.list_clusters().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_create_drains_the_batch() {
    let harness = Harness::new();
    harness.runtime.fail_create_at(2);
    let cancel = CancellationToken::new();

    let err = harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(3, "7.6.0")]))
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("failed to provision nodes"));
    assert_eq!(harness.runtime.node_count(), 0);
    assert_eq!(harness.runtime.state.lock().unwrap().removed.len(), 2);
    assert!(harness.admin.calls_of("web_credentials").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_deployment_cleans_up() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(2, "7.6.0")]))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(err.is_terminal());
    assert_eq!(harness.runtime.node_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_definitions() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let empty = harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(0, "7.6.0")]))
        .await
        .unwrap_err();
    assert!(empty.is_terminal());

    let malformed = harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(1, "seven")]))
        .await
        .unwrap_err();
    assert!(malformed.is_terminal());
    assert_eq!(harness.runtime.state.lock().unwrap().creates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_auxiliary_nodes_stay_out_of_the_cluster() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let mut def = cluster_def(vec![group(2, "7.6.0")]);
    def.blob_store_mock = true;
    let view = harness.orchestrator.new_cluster(&cancel, &def).await.unwrap();

    assert_eq!(view.nodes.len(), 3);
    assert!(view.nodes.iter().any(|n| n.role == NodeRole::BlobStoreMock));
    assert_eq!(harness.admin.member_ips().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_clusters_are_reaped() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let mut short = cluster_def(vec![group(1, "7.6.0")]);
    short.expiry_secs = Some(60);
    let mut long = cluster_def(vec![group(1, "7.6.0")]);
    long.expiry_secs = Some(24 * 3600);

    let short = harness.orchestrator.new_cluster(&cancel, &short).await.unwrap();
    let long = harness.orchestrator.new_cluster(&cancel, &long).await.unwrap();

    let removed = harness
        .orchestrator
        .remove_expired(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, vec![short.cluster_id.clone()]);

    let left = harness.orchestrator.list_clusters().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].cluster_id, long.cluster_id);
}

#[tokio::test(start_paused = true)]
async fn test_failed_teardown_does_not_block_other_expired_clusters() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let mut def = cluster_def(vec![group(1, "7.6.0")]);
    def.expiry_secs = Some(60);
    let stuck = harness.orchestrator.new_cluster(&cancel, &def).await.unwrap();
    let healthy = harness.orchestrator.new_cluster(&cancel, &def).await.unwrap();
    harness.runtime.fail_remove(&stuck.nodes[0].resource_id);

    let err = harness
        .orchestrator
        .remove_expired(Utc::now() + Duration::hours(1))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("failed to remove 1 of 2 expired clusters"), "{}", err);

    let left = harness.orchestrator.list_clusters().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].cluster_id, stuck.cluster_id);
    assert_ne!(left[0].cluster_id, healthy.cluster_id);
}

#[tokio::test(start_paused = true)]
async fn test_writer_locks_are_released_after_every_operation() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let view = harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(2, "7.6.0")]))
        .await
        .unwrap();
    assert_eq!(harness.orchestrator.tracked_locks().await, 0);

    harness.admin.fail("add_node");
    harness
        .orchestrator
        .new_cluster(&cancel, &cluster_def(vec![group(2, "7.6.0")]))
        .await
        .unwrap_err();
    assert_eq!(harness.orchestrator.tracked_locks().await, 0);

    harness
        .orchestrator
        .modify_cluster(&cancel, "missing", &RebalancePlan::default())
        .await
        .unwrap_err();
    assert_eq!(harness.orchestrator.tracked_locks().await, 0);

    harness.orchestrator.remove_cluster(&view.cluster_id).await.unwrap();
    assert_eq!(harness.orchestrator.tracked_locks().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_worker_sweeps_until_shutdown() {
    let harness = Harness::new();
    let mut def = cluster_def(vec![group(1, "7.6.0")]);
    def.expiry_secs = Some(0);
    harness
        .orchestrator
        .new_cluster(&CancellationToken::new(), &def)
        .await
        .unwrap();

    let options = reaper::Options {
        interval: StdDuration::from_secs(1),
        initial_delay: StdDuration::ZERO,
        ..Default::default()
    };
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = reaper::run(
        &options,
        &harness.orchestrator,
        tokio::time::sleep,
        Box::pin(async move {
            let _ = shutdown_rx.await;
        }),
    );
    let watcher = async {
        while !harness.orchestrator.list_clusters().await.unwrap().is_empty() {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }
        shutdown_tx.send(()).unwrap();
    };

    tokio::join!(worker, watcher);
    assert_eq!(harness.runtime.node_count(), 0);
}
