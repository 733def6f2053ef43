//! Integration tests for node provisioning.
//!
//! Covers the path from a provisioning request to a confirmed or failed
//! node:
//! 1. Entry created and start requested
//! 2. Poller checks the running set on every tick
//! 3. Entry reaches `Active` (retired later) or `Failed` (kept)
//!
//! Uses MockNetwork with paused time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stumatch_orchestrator::{
    teardown_scope, Config, ConfirmationPoller, LifecycleRegistry, MockNetwork, NodeOrchestrator,
    NodeRecord, PollOutcome, PollerConfig,
};
use stumatch_reconcile::{LifecycleError, LifecycleState, REGISTRATION_TIMEOUT_MESSAGE};

fn sleep_ms(ms: u64) -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(ms))
}

/// Check function answering from a script, counting calls.
fn scripted(
    answers: &[bool],
    calls: Arc<AtomicU32>,
) -> impl FnMut() -> std::future::Ready<Result<bool, String>> + Send + 'static {
    let answers = Arc::new(Mutex::new(answers.iter().copied().collect::<VecDeque<_>>()));
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let next = answers.lock().unwrap().pop_front().unwrap_or(false);
        std::future::ready(Ok(next))
    }
}

fn poller_setup() -> (
    stumatch_orchestrator::TeardownTrigger,
    LifecycleRegistry,
    ConfirmationPoller,
) {
    let (trigger, scope) = teardown_scope();
    let registry = LifecycleRegistry::new(Duration::from_secs(3), scope.clone());
    let poller = ConfirmationPoller::new(registry.clone(), PollerConfig::default(), scope);
    (trigger, registry, poller)
}

async fn state_of(registry: &LifecycleRegistry, node_id: &str) -> Option<(LifecycleState, f64)> {
    registry.get(node_id).await.map(|e| (e.state, e.progress))
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_sequence_and_retire() {
    let (_trigger, registry, poller) = poller_setup();
    let calls = Arc::new(AtomicU32::new(0));

    let entry = registry.create("node1", 50051).await.unwrap();
    assert_eq!((entry.state, entry.progress), (LifecycleState::Creating, 10.0));

    let handle = poller
        .start("node1", scripted(&[false, false, true], Arc::clone(&calls)))
        .await
        .unwrap();
    assert_eq!(
        state_of(&registry, "node1").await,
        Some((LifecycleState::Registering, 60.0))
    );

    sleep_ms(1500).await;
    assert_eq!(
        state_of(&registry, "node1").await,
        Some((LifecycleState::Registering, 62.5))
    );

    sleep_ms(1000).await;
    assert_eq!(
        state_of(&registry, "node1").await,
        Some((LifecycleState::Registering, 65.0))
    );

    sleep_ms(1000).await;
    assert_eq!(
        state_of(&registry, "node1").await,
        Some((LifecycleState::Active, 100.0))
    );
    assert_eq!(handle.join().await, PollOutcome::Active { attempts: 3 });

    // Terminal: no further checks.
    sleep_ms(2000).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(registry.get("node1").await.is_some());

    // Retired three seconds after becoming active.
    sleep_ms(1100).await;
    assert!(registry.get("node1").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fifteen_failed_checks_fail_the_entry() {
    let network = Arc::new(MockNetwork::new().never_registers());
    let orchestrator = NodeOrchestrator::new(network.clone(), &Config::default());

    let node_id = orchestrator.start_node().await.unwrap();

    sleep_ms(14_500).await;
    let entry = orchestrator.lifecycle_entry(&node_id).await.unwrap();
    assert_eq!(entry.state, LifecycleState::Registering);
    assert_eq!(entry.progress, 95.0);

    sleep_ms(1000).await;
    let entry = orchestrator.lifecycle_entry(&node_id).await.unwrap();
    assert_eq!(entry.state, LifecycleState::Failed);
    assert_eq!(entry.progress, 100.0);
    assert_eq!(entry.error.as_deref(), Some(REGISTRATION_TIMEOUT_MESSAGE));
    assert_eq!(network.running_set_queries(), 15);

    // Failed entries stay and nothing polls any more.
    sleep_ms(10_000).await;
    assert_eq!(network.running_set_queries(), 15);
    assert!(orchestrator.lifecycle_entry(&node_id).await.is_some());

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_orchestrated_node_becomes_active() {
    let network = Arc::new(MockNetwork::new().with_registration_after(3));
    network.add_node(NodeRecord::new("node-existing", 50051), true);
    let orchestrator = NodeOrchestrator::new(network.clone(), &Config::default());
    orchestrator.refresh_once().await;

    let node_id = orchestrator.start_node().await.unwrap();
    let entry = orchestrator.lifecycle_entry(&node_id).await.unwrap();
    assert_eq!(entry.port, 50052);
    assert_eq!(entry.progress, 60.0);

    sleep_ms(3500).await;
    let entry = orchestrator.lifecycle_entry(&node_id).await.unwrap();
    assert_eq!(entry.state, LifecycleState::Active);

    sleep_ms(3000).await;
    assert!(orchestrator.lifecycle_entry(&node_id).await.is_none());

    // The canonical list now comes from the registry.
    orchestrator.refresh_once().await;
    let node = orchestrator.cache_snapshot().await.node(&node_id).unwrap();
    assert!(node.running);
    assert_eq!(node.port, Some(50052));

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_canceled_poller_never_mutates() {
    let (_trigger, registry, poller) = poller_setup();
    let calls = Arc::new(AtomicU32::new(0));

    registry.create("node1", 50051).await.unwrap();
    let handle = poller
        .start("node1", scripted(&[], Arc::clone(&calls)))
        .await
        .unwrap();

    sleep_ms(2500).await;
    handle.cancel().await;
    let frozen = state_of(&registry, "node1").await;
    assert_eq!(frozen, Some((LifecycleState::Registering, 65.0)));

    sleep_ms(20_000).await;
    assert_eq!(state_of(&registry, "node1").await, frozen);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.join().await, PollOutcome::Canceled);
    assert!(!poller.is_running("node1"));
}

#[tokio::test(start_paused = true)]
async fn test_second_poller_is_precondition_violation() {
    let (_trigger, registry, poller) = poller_setup();
    let calls = Arc::new(AtomicU32::new(0));

    registry.create("node1", 50051).await.unwrap();
    let first = poller
        .start("node1", scripted(&[false, true], Arc::clone(&calls)))
        .await
        .unwrap();

    let err = poller
        .start("node1", scripted(&[true], Arc::new(AtomicU32::new(0))))
        .await
        .err()
        .unwrap();
    assert_eq!(err, LifecycleError::PollerAlreadyRunning("node1".to_string()));
    assert!(err.is_precondition_violation());

    // The first poller is unaffected.
    assert_eq!(first.join().await, PollOutcome::Active { attempts: 2 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_stops_all_timers() {
    let network = Arc::new(MockNetwork::new().never_registers());
    let orchestrator = NodeOrchestrator::new(network.clone(), &Config::default());
    orchestrator.start();

    let node_id = orchestrator.start_node().await.unwrap();
    sleep_ms(2500).await;
    orchestrator.shutdown().await;

    let queries = network.running_set_queries();
    sleep_ms(30_000).await;
    assert_eq!(network.running_set_queries(), queries);

    let entry = orchestrator.lifecycle_entry(&node_id).await.unwrap();
    assert_eq!(entry.state, LifecycleState::Registering);
}

#[tokio::test]
async fn test_duplicate_entry_is_rejected() {
    let (_trigger, registry, _poller) = poller_setup();
    registry.create("node1", 50051).await.unwrap();

    let err = registry.create("node1", 50052).await.unwrap_err();
    assert!(err.is_precondition_violation());
    assert_eq!(registry.snapshot().await.len(), 1);
    assert_eq!(registry.get("node1").await.unwrap().port, 50051);
}
