//! Shared lifecycle registry.
//!
//! Wraps the lifecycle table in an owned, cloneable container. Every write
//! goes through here so that rejected transitions are logged in one place
//! and active entries get their retire timer.

use std::sync::Arc;
use std::time::Duration;

use stumatch_reconcile::{
    LifecycleEntry, LifecycleError, LifecycleState, LifecycleTable, Transition,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::scope::TeardownScope;

/// Log a lifecycle error at the level its kind deserves.
pub(crate) fn log_rejection(operation: &str, err: &LifecycleError) {
    if err.is_precondition_violation() {
        error!(operation, error = %err, "Lifecycle precondition violated");
    } else {
        warn!(operation, error = %err, "Lifecycle transition rejected");
    }
}

/// Owned lifecycle entry map.
#[derive(Clone)]
pub struct LifecycleRegistry {
    table: Arc<RwLock<LifecycleTable>>,
    retire_delay: Duration,
    scope: TeardownScope,
}

impl LifecycleRegistry {
    pub fn new(retire_delay: Duration, scope: TeardownScope) -> Self {
        Self {
            table: Arc::new(RwLock::new(LifecycleTable::new())),
            retire_delay,
            scope,
        }
    }

    /// Insert a new `Creating` entry.
    pub async fn create(&self, node_id: &str, port: u32) -> Result<LifecycleEntry, LifecycleError> {
        let mut table = self.table.write().await;
        match table.create(node_id, port) {
            Ok(entry) => {
                info!(node_id = %node_id, port, "Lifecycle entry created");
                Ok(entry.clone())
            }
            Err(e) => {
                log_rejection("create", &e);
                Err(e)
            }
        }
    }

    /// Move an entry forward. Rejections leave it untouched.
    pub async fn advance(
        &self,
        node_id: &str,
        state: LifecycleState,
        progress: f64,
    ) -> Result<Transition, LifecycleError> {
        let result = self.table.write().await.advance(node_id, state, progress);
        match &result {
            Ok(Transition::Applied) => {
                debug!(node_id = %node_id, state = %state, progress, "Lifecycle advanced");
            }
            Ok(Transition::Unchanged) => {}
            Err(e) => log_rejection("advance", e),
        }
        result
    }

    /// Mark an entry active and schedule its retirement.
    pub async fn mark_active(&self, node_id: &str) -> Result<(), LifecycleError> {
        let generation = match self.table.write().await.mark_active(node_id) {
            Ok(generation) => generation,
            Err(e) => {
                log_rejection("mark_active", &e);
                return Err(e);
            }
        };
        info!(node_id = %node_id, "Node active");

        let table = Arc::clone(&self.table);
        let delay = self.retire_delay;
        let scope = self.scope.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = scope.torn_down() => {}
                _ = tokio::time::sleep(delay) => {
                    if table.write().await.retire(&node_id, generation).is_some() {
                        debug!(node_id = %node_id, generation, "Lifecycle entry retired");
                    }
                }
            }
        });

        Ok(())
    }

    /// Mark an entry failed. It stays until dismissed.
    pub async fn mark_failed(&self, node_id: &str, reason: &str) -> Result<(), LifecycleError> {
        let result = self.table.write().await.mark_failed(node_id, reason);
        match &result {
            Ok(()) => warn!(node_id = %node_id, reason = %reason, "Node provisioning failed"),
            Err(e) => log_rejection("mark_failed", e),
        }
        result
    }

    /// Remove a failed entry.
    pub async fn dismiss(&self, node_id: &str) -> Result<LifecycleEntry, LifecycleError> {
        let result = self.table.write().await.dismiss(node_id);
        match &result {
            Ok(_) => info!(node_id = %node_id, "Failed entry dismissed"),
            Err(e) => log_rejection("dismiss", e),
        }
        result
    }

    pub async fn get(&self, node_id: &str) -> Option<LifecycleEntry> {
        self.table.read().await.get(node_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<LifecycleEntry> {
        self.table.read().await.snapshot()
    }

    /// Ports reserved by live entries.
    pub async fn ports(&self) -> Vec<u32> {
        self.table.read().await.ports().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::teardown_scope;

    #[tokio::test(start_paused = true)]
    async fn test_active_entry_retired_after_delay() {
        let (_trigger, scope) = teardown_scope();
        let registry = LifecycleRegistry::new(Duration::from_secs(3), scope);

        registry.create("node1", 50051).await.unwrap();
        registry.mark_active("node1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(
            registry.get("node1").await.unwrap().state,
            LifecycleState::Active
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.get("node1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_retire_skips_new_generation() {
        let (_trigger, scope) = teardown_scope();
        let registry = LifecycleRegistry::new(Duration::from_secs(3), scope);

        registry.create("node1", 50051).await.unwrap();
        registry.mark_active("node1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(registry.get("node1").await.is_none());

        // Second generation becomes active one second later; its own timer
        // is the only one allowed to remove it.
        registry.create("node1", 50051).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.mark_active("node1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(registry.get("node1").await.is_some());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(registry.get("node1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_retire() {
        let (trigger, scope) = teardown_scope();
        let registry = LifecycleRegistry::new(Duration::from_secs(3), scope);

        registry.create("node1", 50051).await.unwrap();
        registry.mark_active("node1").await.unwrap();
        trigger.teardown();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.get("node1").await.is_some());
    }

    #[tokio::test]
    async fn test_failed_entry_kept_until_dismissed() {
        let (_trigger, scope) = teardown_scope();
        let registry = LifecycleRegistry::new(Duration::from_secs(3), scope);

        registry.create("node1", 50051).await.unwrap();
        registry.mark_failed("node1", "rejected").await.unwrap();
        assert_eq!(registry.ports().await, vec![50051]);

        registry.dismiss("node1").await.unwrap();
        assert!(registry.snapshot().await.is_empty());
    }
}
