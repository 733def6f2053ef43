//! Node orchestrator.
//!
//! Owns the lifecycle registry, the confirmation poller, the cache store
//! and the distribution tracker, and exposes the operations a rendering
//! layer calls. Lifecycle work never returns collaborator errors: failures
//! end up on the entry. Delegated calls report an [`ActionOutcome`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use stumatch_reconcile::{LifecycleEntry, LifecycleError, LifecycleState, PortAllocator};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheSnapshot, CacheStore};
use crate::client::{ApiError, Decision, NodeStartRequest};
use crate::config::Config;
use crate::distribution::{DistributionProgress, DistributionTracker, RevealConfig};
use crate::lifecycle::LifecycleRegistry;
use crate::poller::{ConfirmationPoller, PollOutcome, PollerConfig};
use crate::refresh::{RefreshConfig, RefreshReport, RefreshScheduler, RefreshTrigger};
use crate::registry::NetworkApi;
use crate::scope::{teardown_scope, TeardownScope, TeardownTrigger};

/// Create attempts before giving up on finding a free id/port pair.
const MAX_CREATE_ATTEMPTS: usize = 8;

/// Failure recorded when a node is deleted while still registering.
pub const DELETED_BEFORE_REGISTRATION: &str = "node was deleted before it registered";

/// Result of a delegated node or file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Accepted,
    Rejected { reason: String },
    Unreachable { error: String },
}

impl ActionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl From<Result<Decision, ApiError>> for ActionOutcome {
    fn from(result: Result<Decision, ApiError>) -> Self {
        match result {
            Ok(Decision::Accepted) => Self::Accepted,
            Ok(Decision::Rejected { reason }) => Self::Rejected { reason },
            Err(e) => Self::Unreachable {
                error: e.to_string(),
            },
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::Rejected { reason } => write!(f, "rejected: {reason}"),
            Self::Unreachable { error } => write!(f, "unreachable: {error}"),
        }
    }
}

/// Node lifecycle orchestrator.
pub struct NodeOrchestrator {
    api: Arc<dyn NetworkApi>,
    config: Config,
    ports: PortAllocator,
    lifecycle: LifecycleRegistry,
    poller: ConfirmationPoller,
    cache: CacheStore,
    tracker: DistributionTracker,
    refresh: RefreshScheduler,
    refresh_trigger: RefreshTrigger,
    teardown: TeardownTrigger,
    scope: TeardownScope,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    last_id_millis: AtomicU64,
}

impl NodeOrchestrator {
    pub fn new(api: Arc<dyn NetworkApi>, config: &Config) -> Self {
        let (teardown, scope) = teardown_scope();
        let lifecycle = LifecycleRegistry::new(config.retire_delay, scope.clone());
        let poller = ConfirmationPoller::new(
            lifecycle.clone(),
            PollerConfig::from(config),
            scope.clone(),
        );
        let cache = CacheStore::new();
        let refresh = RefreshScheduler::new(
            Arc::clone(&api),
            cache.clone(),
            RefreshConfig::from(config),
        );
        let refresh_trigger = refresh.trigger();
        let tracker = DistributionTracker::new(RevealConfig::from(config), scope.clone());

        Self {
            api,
            config: config.clone(),
            ports: PortAllocator::new(config.base_port),
            lifecycle,
            poller,
            cache,
            tracker,
            refresh,
            refresh_trigger,
            teardown,
            scope,
            refresh_task: Mutex::new(None),
            last_id_millis: AtomicU64::new(0),
        }
    }

    /// Start the background refresh loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self
            .refresh_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(self.refresh.clone().run(self.scope.clone())));
    }

    /// Provision a new node and follow it to `Active` or `Failed`.
    ///
    /// Returns the new node id once the entry is registering (or already
    /// failed). Errors are precondition violations only.
    pub async fn start_node(&self) -> Result<String, LifecycleError> {
        let entry = self.create_entry().await?;
        let node_id = entry.node_id.clone();

        self.lifecycle
            .advance(
                &node_id,
                LifecycleState::Starting,
                LifecycleState::Starting.base_progress(),
            )
            .await?;

        let request = self.start_request(&node_id, entry.port);
        info!(node_id = %node_id, port = entry.port, "Requesting node start");

        let reason = match self.api.request_node_start(&request).await {
            Ok(Decision::Accepted) => None,
            Ok(Decision::Rejected { reason }) => Some(reason),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = reason {
            // Entry already terminal only if someone else won the race.
            let _ = self.lifecycle.mark_failed(&node_id, &reason).await;
            return Ok(node_id);
        }

        let api = Arc::clone(&self.api);
        let id = node_id.clone();
        let check = move || {
            let api = Arc::clone(&api);
            let id = id.clone();
            async move { api.query_running_set().await.map(|running| running.contains(&id)) }
        };
        let handle = self.poller.start(&node_id, check).await?;

        let trigger = self.refresh_trigger.clone();
        tokio::spawn(async move {
            let node_id = handle.node_id().to_string();
            let outcome = handle.join().await;
            debug!(node_id = %node_id, outcome = ?outcome, "Poller finished");
            if matches!(outcome, PollOutcome::Active { .. }) {
                trigger.refresh_now();
            }
        });

        Ok(node_id)
    }

    /// Start a registered node that is not running.
    pub async fn start_existing_node(&self, node_id: &str) -> ActionOutcome {
        let port = self.port_for(node_id).await;
        let outcome: ActionOutcome = self
            .api
            .request_node_start(&self.start_request(node_id, port))
            .await
            .into();
        self.after_start_request(node_id, "start", &outcome);
        outcome
    }

    pub async fn restart_node(&self, node_id: &str) -> ActionOutcome {
        let port = self.port_for(node_id).await;
        let outcome: ActionOutcome = self
            .api
            .request_node_restart(&self.start_request(node_id, port))
            .await
            .into();
        self.after_start_request(node_id, "restart", &outcome);
        outcome
    }

    pub async fn stop_node(&self, node_id: &str) -> ActionOutcome {
        let outcome: ActionOutcome = self.api.request_node_stop(node_id).await.into();
        self.after_action("stop", Some(node_id), &outcome);
        outcome
    }

    /// Delete a node. An in-flight provisioning attempt for it is ended.
    pub async fn delete_node(&self, node_id: &str) -> ActionOutcome {
        if self.poller.cancel(node_id).await {
            let _ = self
                .lifecycle
                .mark_failed(node_id, DELETED_BEFORE_REGISTRATION)
                .await;
        }

        let outcome: ActionOutcome = self.api.request_node_delete(node_id).await.into();
        self.after_action("delete", Some(node_id), &outcome);
        outcome
    }

    pub async fn delete_all_nodes(&self) -> ActionOutcome {
        let outcome: ActionOutcome = self.api.request_delete_all_nodes().await.into();
        self.after_action("delete_all", None, &outcome);
        outcome
    }

    /// Upload a file and present its chunk distribution.
    pub async fn upload_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ApiError> {
        let size_bytes = bytes.len();
        let file_id = self.api.request_file_upload(file_name, bytes).await?;
        info!(file_id = %file_id, file_name = %file_name, size_bytes, "File uploaded");
        self.refresh_trigger.refresh_now();

        match self.api.query_distribution(&file_id).await {
            Ok(distribution) => self.tracker.present(distribution).await,
            Err(e) => {
                warn!(file_id = %file_id, error = %e, "Could not load chunk distribution");
            }
        }

        Ok(file_id)
    }

    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        self.api.request_file_download(file_id).await
    }

    pub async fn delete_file(&self, file_id: &str) -> ActionOutcome {
        let outcome: ActionOutcome = self.api.request_file_delete(file_id).await.into();
        self.after_action("delete_file", Some(file_id), &outcome);
        outcome
    }

    /// Acknowledge a failed entry.
    pub async fn dismiss(&self, node_id: &str) -> Result<LifecycleEntry, LifecycleError> {
        self.lifecycle.dismiss(node_id).await
    }

    pub async fn lifecycle_entries(&self) -> Vec<LifecycleEntry> {
        self.lifecycle.snapshot().await
    }

    pub async fn lifecycle_entry(&self, node_id: &str) -> Option<LifecycleEntry> {
        self.lifecycle.get(node_id).await
    }

    pub async fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot().await
    }

    pub async fn distribution_progress(&self) -> Option<DistributionProgress> {
        self.tracker.progress().await
    }

    /// Ask the refresh loop for an immediate pass.
    pub fn refresh_now(&self) {
        self.refresh_trigger.refresh_now();
    }

    /// Run one refresh pass inline.
    pub async fn refresh_once(&self) -> RefreshReport {
        self.refresh.refresh_once().await
    }

    /// Stop every timer and wait for the refresh loop to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.teardown.teardown();

        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn create_entry(&self) -> Result<LifecycleEntry, LifecycleError> {
        let snapshot = self.cache.snapshot().await;
        let mut excluded: HashSet<u32> = snapshot.known_ports().into_iter().collect();
        let mut node_id = self.next_node_id(&snapshot);
        let mut last_error = None;

        for _ in 0..MAX_CREATE_ATTEMPTS {
            excluded.extend(self.lifecycle.ports().await);
            let port = self.ports.allocate(excluded.iter().copied());

            match self.lifecycle.create(&node_id, port).await {
                Ok(entry) => return Ok(entry),
                Err(LifecycleError::PortInUse { port, holder }) => {
                    excluded.insert(port);
                    last_error = Some(LifecycleError::PortInUse { port, holder });
                }
                Err(LifecycleError::DuplicateEntry(id)) => {
                    node_id = self.next_node_id(&snapshot);
                    last_error = Some(LifecycleError::DuplicateEntry(id));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| LifecycleError::DuplicateEntry(node_id)))
    }

    /// `node{millis}`, strictly increasing and unknown to the registry.
    fn next_node_id(&self, snapshot: &CacheSnapshot) -> String {
        loop {
            let now = Utc::now().timestamp_millis().max(0) as u64;
            let millis = self
                .last_id_millis
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                    Some(now.max(last + 1))
                })
                .map(|last| now.max(last + 1))
                .unwrap_or(now);

            let node_id = format!("node{millis}");
            if snapshot.node(&node_id).is_none() {
                return node_id;
            }
        }
    }

    fn start_request(&self, node_id: &str, port: u32) -> NodeStartRequest {
        NodeStartRequest {
            node_id: node_id.to_string(),
            port,
            storage_gb: self.config.node_storage_gb,
            ram_gb: self.config.node_ram_gb,
        }
    }

    /// Port the registry knows for `node_id`, or a fresh one.
    async fn port_for(&self, node_id: &str) -> u32 {
        let snapshot = self.cache.snapshot().await;
        if let Some(port) = snapshot.node(node_id).and_then(|n| n.port) {
            return port;
        }
        if let Some(entry) = self.lifecycle.get(node_id).await {
            return entry.port;
        }

        let mut excluded: HashSet<u32> = snapshot.known_ports().into_iter().collect();
        excluded.extend(self.lifecycle.ports().await);
        self.ports.allocate(excluded)
    }

    fn after_start_request(&self, node_id: &str, action: &str, outcome: &ActionOutcome) {
        self.log_outcome(action, Some(node_id), outcome);
        if !outcome.is_accepted() {
            return;
        }

        // Give the node time to come up before re-syncing.
        let trigger = self.refresh_trigger.clone();
        let scope = self.scope.clone();
        let delay: Duration = self.config.settle_delay;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = scope.torn_down() => {}
                _ = tokio::time::sleep(delay) => trigger.refresh_now(),
            }
        });
    }

    fn after_action(&self, action: &str, target: Option<&str>, outcome: &ActionOutcome) {
        self.log_outcome(action, target, outcome);
        if outcome.is_accepted() {
            self.refresh_trigger.refresh_now();
        }
    }

    fn log_outcome(&self, action: &str, target: Option<&str>, outcome: &ActionOutcome) {
        let target = target.unwrap_or("*");
        match outcome {
            ActionOutcome::Accepted => info!(action, target = %target, "Request accepted"),
            ActionOutcome::Rejected { reason } => {
                warn!(action, target = %target, reason = %reason, "Request rejected")
            }
            ActionOutcome::Unreachable { error } => {
                warn!(action, target = %target, error = %error, "Storage network unreachable")
            }
        }
    }
}
