//! Integration tests for the refresh loop.

use std::sync::Arc;
use std::time::Duration;

use stumatch_orchestrator::{
    teardown_scope, CacheSource, CacheStore, FileRecord, MockEndpoint, MockNetwork, NetworkApi,
    NodeRecord, RefreshConfig, RefreshScheduler,
};

fn file(id: &str, name: &str) -> FileRecord {
    FileRecord {
        id: id.to_string(),
        file_name: name.to_string(),
        object_key: None,
        size_bytes: 1024,
        content_type: Some("application/pdf".to_string()),
        created_at: None,
        updated_at: None,
    }
}

fn node_ids(nodes: &[NodeRecord]) -> Vec<&str> {
    nodes.iter().map(|n| n.node_id.as_str()).collect()
}

#[tokio::test]
async fn test_failed_source_keeps_previous_value() {
    let network = Arc::new(MockNetwork::new());
    network.add_node(NodeRecord::new("node1", 50051), true);

    let cache = CacheStore::new();
    let scheduler = RefreshScheduler::new(
        network.clone() as Arc<dyn NetworkApi>,
        cache.clone(),
        RefreshConfig::default(),
    );
    assert!(scheduler.refresh_once().await.is_complete());
    let before = cache.snapshot().await;

    network.add_node(NodeRecord::new("node2", 50052), true);
    network.add_file(file("f1", "lease.pdf"));
    network.set_unavailable(MockEndpoint::Nodes, true);

    let report = scheduler.refresh_once().await;
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, CacheSource::Nodes);

    let after = cache.snapshot().await;
    // Node list untouched, down to the fetch time.
    assert_eq!(after.nodes, before.nodes);
    assert_eq!(node_ids(&after.nodes()), vec!["node1"]);
    // Other sources moved on.
    assert_eq!(after.files().len(), 1);
    assert_eq!(after.files()[0].file_name, "lease.pdf");
    assert!(after.running_set().contains("node2"));
}

#[tokio::test(start_paused = true)]
async fn test_loop_runs_on_cadence_and_recovers() {
    let network = Arc::new(MockNetwork::new());
    let cache = CacheStore::new();
    let scheduler = RefreshScheduler::new(
        network.clone() as Arc<dyn NetworkApi>,
        cache.clone(),
        RefreshConfig {
            interval: Duration::from_secs(5),
        },
    );
    let (teardown, scope) = teardown_scope();
    let task = tokio::spawn(scheduler.run(scope));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(network.running_set_queries(), 1);
    assert!(cache.snapshot().await.nodes.is_some());

    // Every source down for two ticks: the cache holds.
    network.add_node(NodeRecord::new("node1", 50051), true);
    for endpoint in [
        MockEndpoint::Nodes,
        MockEndpoint::RunningSet,
        MockEndpoint::Files,
        MockEndpoint::NetworkStatus,
    ] {
        network.set_unavailable(endpoint, true);
    }
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(network.running_set_queries(), 3);
    assert!(cache.snapshot().await.nodes().is_empty());

    // Back up: the next tick picks the node up.
    for endpoint in [
        MockEndpoint::Nodes,
        MockEndpoint::RunningSet,
        MockEndpoint::Files,
        MockEndpoint::NetworkStatus,
    ] {
        network.set_unavailable(endpoint, false);
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    let nodes = cache.snapshot().await.nodes();
    assert_eq!(node_ids(&nodes), vec!["node1"]);
    assert!(nodes[0].running);

    teardown.teardown();
    task.await.unwrap();

    let queries = network.running_set_queries();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(network.running_set_queries(), queries);
}
