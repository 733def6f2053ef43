//! Cached copies of externally owned state.
//!
//! Each source is replaced wholesale on a successful fetch and left alone
//! on failure, so a snapshot can mix values fetched at different times.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::client::{FileRecord, NetworkStatus, NodeRecord};

/// Refreshed sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSource {
    Nodes,
    RunningSet,
    Files,
    NetworkStatus,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nodes => "nodes",
            Self::RunningSet => "running_set",
            Self::Files => "files",
            Self::NetworkStatus => "network_status",
        };
        f.write_str(name)
    }
}

/// A value with the time it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cached<T> {
    pub value: T,
    pub fetched_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    fn now(value: T) -> Self {
        Self {
            value,
            fetched_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of the cache. Sources never fetched are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub nodes: Option<Cached<Vec<NodeRecord>>>,
    pub running: Option<Cached<BTreeSet<String>>>,
    pub files: Option<Cached<Vec<FileRecord>>>,
    pub network_status: Option<Cached<NetworkStatus>>,
}

impl CacheSnapshot {
    /// Registry nodes with `running` derived from the running set.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let running = self.running_set();
        self.nodes
            .as_ref()
            .map(|c| c.value.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|node| NodeRecord {
                running: running.contains(&node.node_id),
                ..node.clone()
            })
            .collect()
    }

    pub fn node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes().into_iter().find(|n| n.node_id == node_id)
    }

    /// Ports held by cached node records.
    pub fn known_ports(&self) -> Vec<u32> {
        self.nodes
            .as_ref()
            .map(|c| c.value.iter().filter_map(|n| n.port).collect())
            .unwrap_or_default()
    }

    pub fn running_set(&self) -> BTreeSet<String> {
        self.running
            .as_ref()
            .map(|c| c.value.clone())
            .unwrap_or_default()
    }

    pub fn files(&self) -> Vec<FileRecord> {
        self.files
            .as_ref()
            .map(|c| c.value.clone())
            .unwrap_or_default()
    }

    pub fn network_status(&self) -> Option<&NetworkStatus> {
        self.network_status.as_ref().map(|c| &c.value)
    }
}

/// Shared cache store. Only the refresh scheduler writes to it.
#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<RwLock<CacheSnapshot>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace_nodes(&self, nodes: Vec<NodeRecord>) {
        self.inner.write().await.nodes = Some(Cached::now(nodes));
    }

    pub async fn replace_running(&self, running: BTreeSet<String>) {
        self.inner.write().await.running = Some(Cached::now(running));
    }

    pub async fn replace_files(&self, files: Vec<FileRecord>) {
        self.inner.write().await.files = Some(Cached::now(files));
    }

    pub async fn replace_network_status(&self, status: NetworkStatus) {
        self.inner.write().await.network_status = Some(Cached::now(status));
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        self.inner.read().await.clone()
    }
}
