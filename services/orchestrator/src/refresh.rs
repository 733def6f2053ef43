//! Periodic refresh of externally owned state.
//!
//! Every tick fetches the node registry, running set, file list and network
//! status concurrently. Each source updates its cache slot independently;
//! a failed source keeps its previous value until the next tick. The loop
//! knows nothing about lifecycle entries or pollers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheSource, CacheStore};
use crate::client::ApiError;
use crate::config::Config;
use crate::registry::NetworkApi;
use crate::scope::TeardownScope;

/// Refresh loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    pub interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for RefreshConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.refresh_interval,
        }
    }
}

/// Result of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: Vec<CacheSource>,
    pub failed: Vec<(CacheSource, String)>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record<T>(&mut self, source: CacheSource, result: &Result<T, ApiError>) {
        match result {
            Ok(_) => self.refreshed.push(source),
            Err(e) => {
                debug!(source = %source, error = %e, "Refresh source failed");
                self.failed.push((source, e.to_string()));
            }
        }
    }
}

/// Requests an out-of-band refresh.
#[derive(Clone)]
pub struct RefreshTrigger {
    notify: Arc<Notify>,
}

impl RefreshTrigger {
    pub fn refresh_now(&self) {
        self.notify.notify_one();
    }
}

/// Drives the refresh loop.
#[derive(Clone)]
pub struct RefreshScheduler {
    api: Arc<dyn NetworkApi>,
    cache: CacheStore,
    config: RefreshConfig,
    notify: Arc<Notify>,
}

impl RefreshScheduler {
    pub fn new(api: Arc<dyn NetworkApi>, cache: CacheStore, config: RefreshConfig) -> Self {
        Self {
            api,
            cache,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) -> RefreshTrigger {
        RefreshTrigger {
            notify: Arc::clone(&self.notify),
        }
    }

    /// Fetch every source once and update the cache.
    pub async fn refresh_once(&self) -> RefreshReport {
        let (nodes, running, files, status) = tokio::join!(
            self.api.query_nodes(),
            self.api.query_running_set(),
            self.api.query_files(),
            self.api.query_network_status(),
        );

        let mut report = RefreshReport::default();
        report.record(CacheSource::Nodes, &nodes);
        report.record(CacheSource::RunningSet, &running);
        report.record(CacheSource::Files, &files);
        report.record(CacheSource::NetworkStatus, &status);

        if let Ok(nodes) = nodes {
            self.cache.replace_nodes(nodes).await;
        }
        if let Ok(running) = running {
            self.cache.replace_running(running).await;
        }
        if let Ok(files) = files {
            self.cache.replace_files(files).await;
        }
        if let Ok(status) = status {
            self.cache.replace_network_status(status).await;
        }

        report
    }

    /// Run until teardown. The first pass happens immediately.
    pub async fn run(self, scope: TeardownScope) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting refresh loop"
        );

        let mut consecutive_failures = 0u32;
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = scope.torn_down() => {
                    info!("Refresh loop shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {
                    debug!("Refresh requested");
                }
            }

            let report = self.refresh_once().await;
            if report.is_complete() {
                consecutive_failures = 0;
                debug!(sources = report.refreshed.len(), "Refresh complete");
                continue;
            }

            consecutive_failures += 1;
            let failed: Vec<String> = report.failed.iter().map(|(s, _)| s.to_string()).collect();
            if consecutive_failures <= 3 {
                warn!(
                    failed = ?failed,
                    consecutive_failures,
                    "Refresh incomplete, keeping cached values"
                );
            } else {
                error!(
                    failed = ?failed,
                    consecutive_failures,
                    "Refresh failing repeatedly"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NodeRecord;
    use crate::registry::{MockEndpoint, MockNetwork};
    use crate::scope::teardown_scope;

    #[tokio::test]
    async fn test_refresh_once_fills_cache() {
        let network = Arc::new(MockNetwork::new());
        network.add_node(NodeRecord::new("node1", 50051), true);

        let cache = CacheStore::new();
        let scheduler = RefreshScheduler::new(network, cache.clone(), RefreshConfig::default());

        let report = scheduler.refresh_once().await;
        assert!(report.is_complete());
        assert_eq!(report.refreshed.len(), 4);

        let snapshot = cache.snapshot().await;
        assert!(snapshot.nodes()[0].running);
        assert_eq!(snapshot.network_status().unwrap().total_nodes, 1);
    }

    #[tokio::test]
    async fn test_failed_source_reported() {
        let network = Arc::new(MockNetwork::new());
        network.set_unavailable(MockEndpoint::NetworkStatus, true);

        let scheduler =
            RefreshScheduler::new(network, CacheStore::new(), RefreshConfig::default());
        let report = scheduler.refresh_once().await;

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, CacheSource::NetworkStatus);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_runs_out_of_band() {
        let network = Arc::new(MockNetwork::new());
        let cache = CacheStore::new();
        let scheduler = RefreshScheduler::new(
            Arc::clone(&network) as Arc<dyn NetworkApi>,
            cache.clone(),
            RefreshConfig {
                interval: Duration::from_secs(60),
            },
        );
        let trigger = scheduler.trigger();
        let (teardown, scope) = teardown_scope();
        let task = tokio::spawn(scheduler.run(scope));

        // Initial pass.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.snapshot().await.nodes().is_empty());

        network.add_node(NodeRecord::new("node1", 50051), true);
        trigger.refresh_now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.snapshot().await.nodes().len(), 1);

        teardown.teardown();
        task.await.unwrap();
    }
}
