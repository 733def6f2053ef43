//! Storage network interface and mock implementation.
//!
//! The interface abstracts every call the orchestrator makes against the
//! storage network: node lifecycle requests, registry queries and the file
//! upload path. A mock implementation is provided for testing and
//! development.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::{ApiError, Decision, FileRecord, NetworkStatus, NodeRecord, NodeStartRequest};
use crate::distribution::{ChunkAssignment, Distribution};

/// Storage network interface.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Ask the network to start a node process.
    async fn request_node_start(&self, request: &NodeStartRequest) -> Result<Decision, ApiError>;

    /// Stop a running node.
    async fn request_node_stop(&self, node_id: &str) -> Result<Decision, ApiError>;

    /// Stop (if running) and start a node again.
    async fn request_node_restart(&self, request: &NodeStartRequest) -> Result<Decision, ApiError>;

    /// Stop and unregister a node.
    async fn request_node_delete(&self, node_id: &str) -> Result<Decision, ApiError>;

    /// Stop every running node.
    async fn request_delete_all_nodes(&self) -> Result<Decision, ApiError>;

    /// Node ids currently reachable.
    async fn query_running_set(&self) -> Result<BTreeSet<String>, ApiError>;

    /// Registered nodes.
    async fn query_nodes(&self) -> Result<Vec<NodeRecord>, ApiError>;

    /// Files owned by the current user.
    async fn query_files(&self) -> Result<Vec<FileRecord>, ApiError>;

    /// Aggregate network statistics.
    async fn query_network_status(&self) -> Result<NetworkStatus, ApiError>;

    /// Upload a file. Returns its id.
    async fn request_file_upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ApiError>;

    /// Chunk-to-node assignment for an uploaded file.
    async fn query_distribution(&self, file_id: &str) -> Result<Distribution, ApiError>;

    async fn request_file_delete(&self, file_id: &str) -> Result<Decision, ApiError>;

    async fn request_file_download(&self, file_id: &str) -> Result<Vec<u8>, ApiError>;
}

/// Mock endpoints that can be made unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockEndpoint {
    NodeStart,
    RunningSet,
    Nodes,
    Files,
    NetworkStatus,
    Upload,
}

/// Chunk size used by the mock when splitting uploads.
const MOCK_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
struct MockState {
    nodes: BTreeMap<String, NodeRecord>,
    running: BTreeSet<String>,
    /// node_id -> running-set queries left before the node shows up.
    pending: HashMap<String, u32>,
    files: Vec<FileRecord>,
    blobs: HashMap<String, Vec<u8>>,
    distributions: HashMap<String, Distribution>,
    unavailable: HashSet<MockEndpoint>,
    start_requests: Vec<NodeStartRequest>,
    running_set_queries: u32,
    next_file: u64,
}

/// In-memory storage network for tests and `--mock` runs.
pub struct MockNetwork {
    state: Mutex<MockState>,

    /// Running-set queries after an accepted start before the node appears.
    /// `None` means started nodes never register.
    registration_delay: Option<u32>,

    /// Reject every start request with this reason.
    start_rejection: Option<String>,
}

impl MockNetwork {
    /// Create a mock network where started nodes register after two checks.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            registration_delay: Some(2),
            start_rejection: None,
        }
    }

    /// Started nodes appear in the running set after `queries` checks.
    pub fn with_registration_after(mut self, queries: u32) -> Self {
        self.registration_delay = Some(queries);
        self
    }

    /// Started nodes never appear in the running set.
    pub fn never_registers(mut self) -> Self {
        self.registration_delay = None;
        self
    }

    /// Every start request is rejected with `reason`.
    pub fn rejecting_starts(mut self, reason: impl Into<String>) -> Self {
        self.start_rejection = Some(reason.into());
        self
    }

    /// Register a node directly.
    pub fn add_node(&self, record: NodeRecord, running: bool) {
        let mut state = self.lock();
        if running {
            state.running.insert(record.node_id.clone());
        }
        state.nodes.insert(record.node_id.clone(), record);
    }

    pub fn add_file(&self, record: FileRecord) {
        self.lock().files.push(record);
    }

    /// Toggle availability of an endpoint.
    pub fn set_unavailable(&self, endpoint: MockEndpoint, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable.insert(endpoint);
        } else {
            state.unavailable.remove(&endpoint);
        }
    }

    pub fn running_set_queries(&self) -> u32 {
        self.lock().running_set_queries
    }

    /// Start and restart requests received so far.
    pub fn start_requests(&self) -> Vec<NodeStartRequest> {
        self.lock().start_requests.clone()
    }

    pub fn is_running(&self, node_id: &str) -> bool {
        self.lock().running.contains(node_id)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock leaves plain data behind.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(state: &MockState, endpoint: MockEndpoint) -> Result<(), ApiError> {
        if state.unavailable.contains(&endpoint) {
            return Err(ApiError::Unavailable(format!("{endpoint:?} endpoint is down")));
        }
        Ok(())
    }

    fn start_locked(&self, state: &mut MockState, request: &NodeStartRequest) -> Decision {
        if let Some(reason) = &self.start_rejection {
            return Decision::Rejected {
                reason: reason.clone(),
            };
        }
        if state.running.contains(&request.node_id) {
            return Decision::Rejected {
                reason: format!("Node {} is already running", request.node_id),
            };
        }

        state
            .nodes
            .insert(request.node_id.clone(), NodeRecord::new(&request.node_id, request.port));

        match self.registration_delay {
            Some(0) => {
                state.running.insert(request.node_id.clone());
            }
            Some(delay) => {
                state.pending.insert(request.node_id.clone(), delay);
            }
            None => {}
        }

        info!(
            node_id = %request.node_id,
            port = request.port,
            storage_gb = request.storage_gb,
            ram_gb = request.ram_gb,
            "[MOCK] Starting node"
        );
        Decision::Accepted
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkApi for MockNetwork {
    async fn request_node_start(&self, request: &NodeStartRequest) -> Result<Decision, ApiError> {
        let mut state = self.lock();
        Self::check(&state, MockEndpoint::NodeStart)?;
        state.start_requests.push(request.clone());
        Ok(self.start_locked(&mut state, request))
    }

    async fn request_node_stop(&self, node_id: &str) -> Result<Decision, ApiError> {
        let mut state = self.lock();
        if !state.running.remove(node_id) {
            return Ok(Decision::Rejected {
                reason: format!("Node {node_id} is not running"),
            });
        }
        info!(node_id = %node_id, "[MOCK] Stopping node");
        Ok(Decision::Accepted)
    }

    async fn request_node_restart(&self, request: &NodeStartRequest) -> Result<Decision, ApiError> {
        let mut state = self.lock();
        Self::check(&state, MockEndpoint::NodeStart)?;
        state.start_requests.push(request.clone());
        state.running.remove(&request.node_id);
        state.pending.remove(&request.node_id);
        Ok(self.start_locked(&mut state, request))
    }

    async fn request_node_delete(&self, node_id: &str) -> Result<Decision, ApiError> {
        let mut state = self.lock();
        state.running.remove(node_id);
        state.pending.remove(node_id);
        state.nodes.remove(node_id);
        info!(node_id = %node_id, "[MOCK] Deleting node");
        Ok(Decision::Accepted)
    }

    async fn request_delete_all_nodes(&self) -> Result<Decision, ApiError> {
        let mut state = self.lock();
        let stopped = state.running.len();
        state.running.clear();
        state.pending.clear();
        info!(stopped, "[MOCK] Stopping all nodes");
        Ok(Decision::Accepted)
    }

    async fn query_running_set(&self) -> Result<BTreeSet<String>, ApiError> {
        let mut state = self.lock();
        state.running_set_queries += 1;
        Self::check(&state, MockEndpoint::RunningSet)?;

        let mut registered = Vec::new();
        for (node_id, remaining) in state.pending.iter_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                registered.push(node_id.clone());
            }
        }
        for node_id in registered {
            state.pending.remove(&node_id);
            debug!(node_id = %node_id, "[MOCK] Node registered");
            state.running.insert(node_id);
        }

        Ok(state.running.clone())
    }

    async fn query_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        let state = self.lock();
        Self::check(&state, MockEndpoint::Nodes)?;
        Ok(state.nodes.values().cloned().collect())
    }

    async fn query_files(&self) -> Result<Vec<FileRecord>, ApiError> {
        let state = self.lock();
        Self::check(&state, MockEndpoint::Files)?;
        Ok(state.files.clone())
    }

    async fn query_network_status(&self) -> Result<NetworkStatus, ApiError> {
        let state = self.lock();
        Self::check(&state, MockEndpoint::NetworkStatus)?;

        let used_storage_bytes: u64 = state.files.iter().map(|f| f.size_bytes).sum();
        let total_storage_bytes = state.nodes.len() as u64 * 5 * 1024 * 1024 * 1024;
        let utilization_percent = if total_storage_bytes == 0 {
            0.0
        } else {
            used_storage_bytes as f64 / total_storage_bytes as f64 * 100.0
        };

        Ok(NetworkStatus {
            total_nodes: state.nodes.len() as u64,
            total_storage_bytes,
            used_storage_bytes,
            utilization_percent,
            total_chunks: state
                .distributions
                .values()
                .map(|d| d.len() as u64)
                .sum(),
        })
    }

    async fn request_file_upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ApiError> {
        let mut state = self.lock();
        Self::check(&state, MockEndpoint::Upload)?;

        let targets: Vec<String> = state.running.iter().cloned().collect();
        if targets.is_empty() {
            return Err(ApiError::Unavailable("no running nodes".to_string()));
        }

        state.next_file += 1;
        let file_id = format!("file-{:04}", state.next_file);
        let chunk_count = bytes.len().div_ceil(MOCK_CHUNK_BYTES).max(1);

        let assignments = (0..chunk_count)
            .map(|index| {
                let start = index * MOCK_CHUNK_BYTES;
                let end = (start + MOCK_CHUNK_BYTES).min(bytes.len());
                ChunkAssignment {
                    chunk_index: index as u32,
                    node_id: targets[index % targets.len()].clone(),
                    size_bytes: Some(end.saturating_sub(start) as u64),
                }
            })
            .collect();
        let distribution = Distribution::new(file_id.clone(), file_name.to_string(), assignments)?;

        state.files.push(FileRecord {
            id: file_id.clone(),
            file_name: file_name.to_string(),
            object_key: Some(format!("objects/{file_id}")),
            size_bytes: bytes.len() as u64,
            content_type: None,
            created_at: Some(chrono::Utc::now()),
            updated_at: Some(chrono::Utc::now()),
        });
        state.distributions.insert(file_id.clone(), distribution);
        state.blobs.insert(file_id.clone(), bytes);

        info!(file_id = %file_id, chunk_count, "[MOCK] File uploaded");
        Ok(file_id)
    }

    async fn query_distribution(&self, file_id: &str) -> Result<Distribution, ApiError> {
        let state = self.lock();
        state
            .distributions
            .get(file_id)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                body: format!("file {file_id} not found"),
            })
    }

    async fn request_file_delete(&self, file_id: &str) -> Result<Decision, ApiError> {
        let mut state = self.lock();
        let before = state.files.len();
        state.files.retain(|f| f.id != file_id);
        state.blobs.remove(file_id);
        state.distributions.remove(file_id);
        if state.files.len() == before {
            return Ok(Decision::Rejected {
                reason: format!("file {file_id} not found"),
            });
        }
        Ok(Decision::Accepted)
    }

    async fn request_file_download(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        let state = self.lock();
        state
            .blobs
            .get(file_id)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                body: format!("file {file_id} not found"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(node_id: &str, port: u32) -> NodeStartRequest {
        NodeStartRequest {
            node_id: node_id.to_string(),
            port,
            storage_gb: 5,
            ram_gb: 8,
        }
    }

    #[tokio::test]
    async fn test_mock_registration_delay() {
        let network = MockNetwork::new().with_registration_after(2);

        let decision = network.request_node_start(&start("node1", 50051)).await.unwrap();
        assert_eq!(decision, Decision::Accepted);

        assert!(!network.query_running_set().await.unwrap().contains("node1"));
        assert!(network.query_running_set().await.unwrap().contains("node1"));
        assert_eq!(network.running_set_queries(), 2);
    }

    #[tokio::test]
    async fn test_mock_rejects_duplicate_start() {
        let network = MockNetwork::new().with_registration_after(0);
        network.request_node_start(&start("node1", 50051)).await.unwrap();

        let decision = network.request_node_start(&start("node1", 50051)).await.unwrap();
        assert_eq!(
            decision,
            Decision::Rejected {
                reason: "Node node1 is already running".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_mock_never_registers() {
        let network = MockNetwork::new().never_registers();
        network.request_node_start(&start("node1", 50051)).await.unwrap();

        for _ in 0..20 {
            assert!(network.query_running_set().await.unwrap().is_empty());
        }
        // The registry still knows about the node.
        assert_eq!(network.query_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_unavailable_endpoint() {
        let network = MockNetwork::new();
        network.set_unavailable(MockEndpoint::Nodes, true);
        assert!(matches!(
            network.query_nodes().await,
            Err(ApiError::Unavailable(_))
        ));

        network.set_unavailable(MockEndpoint::Nodes, false);
        assert!(network.query_nodes().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_upload_round_robin() {
        let network = MockNetwork::new();
        network.add_node(NodeRecord::new("node-a", 50051), true);
        network.add_node(NodeRecord::new("node-b", 50052), true);

        let file_id = network
            .request_file_upload("notes.pdf", vec![0u8; MOCK_CHUNK_BYTES * 3])
            .await
            .unwrap();
        let distribution = network.query_distribution(&file_id).await.unwrap();

        let nodes: Vec<&str> = distribution
            .assignments()
            .iter()
            .map(|a| a.node_id.as_str())
            .collect();
        assert_eq!(nodes, vec!["node-a", "node-b", "node-a"]);
        assert_eq!(network.query_files().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_upload_requires_running_nodes() {
        let network = MockNetwork::new();
        assert!(network.request_file_upload("a.txt", vec![1, 2, 3]).await.is_err());
    }
}
