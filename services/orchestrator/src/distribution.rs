//! Chunk distribution tracking.
//!
//! A finished upload yields the list of chunk-to-node assignments for the
//! file. The tracker presents that list once: positions are confirmed one at
//! a time on a fixed step, nodes complete when all of their positions are
//! confirmed, and the presentation expires shortly after the last position.
//!
//! Only one presentation is live at a time. Presenting a new distribution
//! cancels the reveal in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::scope::TeardownScope;

/// Invalid distribution payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributionError {
    #[error("chunk {0} is assigned more than once")]
    DuplicateChunk(u32),

    #[error("chunk {0} has no node id")]
    MissingNode(u32),
}

/// One chunk placed on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAssignment {
    pub chunk_index: u32,
    pub node_id: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Ordered, immutable chunk assignment list for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    file_id: String,
    file_name: String,
    assignments: Vec<ChunkAssignment>,
}

impl Distribution {
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        assignments: Vec<ChunkAssignment>,
    ) -> Result<Self, DistributionError> {
        let mut seen = std::collections::HashSet::with_capacity(assignments.len());
        for assignment in &assignments {
            if assignment.node_id.trim().is_empty() {
                return Err(DistributionError::MissingNode(assignment.chunk_index));
            }
            if !seen.insert(assignment.chunk_index) {
                return Err(DistributionError::DuplicateChunk(assignment.chunk_index));
            }
        }

        Ok(Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            assignments,
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn assignments(&self) -> &[ChunkAssignment] {
        &self.assignments
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// List positions grouped by node, nodes in first-appearance order.
    pub fn node_groups(&self) -> Vec<(&str, Vec<usize>)> {
        let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        for (position, assignment) in self.assignments.iter().enumerate() {
            let node_id = assignment.node_id.as_str();
            match index.get(node_id) {
                Some(&slot) => groups[slot].1.push(position),
                None => {
                    index.insert(node_id, groups.len());
                    groups.push((node_id, vec![position]));
                }
            }
        }
        groups
    }

    pub fn distinct_nodes(&self) -> usize {
        self.node_groups().len()
    }
}

/// Chunks per node, rounded to one decimal. Zero when there are no nodes.
pub fn replication_factor(total_chunks: usize, distinct_nodes: usize) -> f64 {
    if distinct_nodes == 0 {
        return 0.0;
    }
    (total_chunks as f64 / distinct_nodes as f64 * 10.0).round() / 10.0
}

/// Per-node view of a presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeChunkProgress {
    pub node_id: String,
    /// Chunk indices in received order.
    pub chunk_indices: Vec<u32>,
    pub confirmed: usize,
    pub complete: bool,
}

/// Read-only snapshot of the live presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionProgress {
    pub file_id: String,
    pub file_name: String,
    pub total_chunks: usize,
    /// Positions confirmed so far; always a prefix of the list.
    pub confirmed_positions: usize,
    pub nodes: Vec<NodeChunkProgress>,
    pub replication_factor: f64,
    pub all_confirmed: bool,
}

impl DistributionProgress {
    fn build(distribution: &Distribution, confirmed_positions: usize) -> Self {
        let assignments = distribution.assignments();
        let groups = distribution.node_groups();
        let distinct = groups.len();

        let nodes = groups
            .into_iter()
            .map(|(node_id, positions)| {
                let confirmed = positions.iter().filter(|&&p| p < confirmed_positions).count();
                NodeChunkProgress {
                    node_id: node_id.to_string(),
                    chunk_indices: positions.iter().map(|&p| assignments[p].chunk_index).collect(),
                    confirmed,
                    complete: confirmed == positions.len(),
                }
            })
            .collect();

        Self {
            file_id: distribution.file_id().to_string(),
            file_name: distribution.file_name().to_string(),
            total_chunks: distribution.len(),
            confirmed_positions,
            nodes,
            replication_factor: replication_factor(distribution.len(), distinct),
            all_confirmed: confirmed_positions >= distribution.len(),
        }
    }

    pub fn is_node_complete(&self, node_id: &str) -> bool {
        self.nodes
            .iter()
            .any(|n| n.node_id == node_id && n.complete)
    }
}

/// Reveal timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealConfig {
    /// Position `i` is confirmed at `(i + 1) * step`.
    pub step: Duration,
    /// How long the finished presentation stays up after the last step.
    pub tail: Duration,
}

impl Default for RevealConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(500),
            tail: Duration::from_millis(1000),
        }
    }
}

impl From<&Config> for RevealConfig {
    fn from(config: &Config) -> Self {
        Self {
            step: config.reveal_step,
            tail: config.reveal_tail,
        }
    }
}

#[derive(Debug)]
struct Presentation {
    generation: u64,
    distribution: Distribution,
    confirmed: usize,
}

/// Owns the single live presentation and its reveal task.
pub struct DistributionTracker {
    current: Arc<RwLock<Option<Presentation>>>,
    generation: AtomicU64,
    reveal: Mutex<Option<JoinHandle<()>>>,
    config: RevealConfig,
    scope: TeardownScope,
}

impl DistributionTracker {
    pub fn new(config: RevealConfig, scope: TeardownScope) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            generation: AtomicU64::new(0),
            reveal: Mutex::new(None),
            config,
            scope,
        }
    }

    /// Replace the live presentation with `distribution` and start revealing it.
    ///
    /// An empty distribution just clears whatever was presented.
    pub async fn present(&self, distribution: Distribution) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut reveal = self.reveal.lock().await;
        if let Some(previous) = reveal.take() {
            previous.abort();
        }

        if distribution.is_empty() {
            debug!(file_id = %distribution.file_id(), "Empty distribution, clearing presentation");
            *self.current.write().await = None;
            return;
        }

        info!(
            file_id = %distribution.file_id(),
            chunks = distribution.len(),
            nodes = distribution.distinct_nodes(),
            "Presenting chunk distribution"
        );

        let total = distribution.len();
        *self.current.write().await = Some(Presentation {
            generation,
            distribution,
            confirmed: 0,
        });

        let current = Arc::clone(&self.current);
        let config = self.config;
        let scope = self.scope.clone();
        *reveal = Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = scope.torn_down() => {
                    debug!("Distribution reveal stopped by teardown");
                }
                _ = run_reveal(current, generation, total, config) => {}
            }
        }));
    }

    /// Snapshot of the live presentation, if any.
    pub async fn progress(&self) -> Option<DistributionProgress> {
        let current = self.current.read().await;
        current
            .as_ref()
            .map(|p| DistributionProgress::build(&p.distribution, p.confirmed))
    }

    /// Drop the live presentation.
    pub async fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.reveal.lock().await.take() {
            task.abort();
        }
        *self.current.write().await = None;
    }
}

async fn run_reveal(
    current: Arc<RwLock<Option<Presentation>>>,
    generation: u64,
    total: usize,
    config: RevealConfig,
) {
    let started = Instant::now();

    for position in 0..total {
        tokio::time::sleep_until(started + config.step * (position as u32 + 1)).await;

        let mut guard = current.write().await;
        match guard.as_mut() {
            Some(p) if p.generation == generation => p.confirmed = position + 1,
            _ => return,
        }
    }

    tokio::time::sleep_until(started + config.step * total as u32 + config.tail).await;

    let mut guard = current.write().await;
    if guard.as_ref().is_some_and(|p| p.generation == generation) {
        *guard = None;
        debug!(generation, "Distribution presentation expired");
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn assignment(chunk_index: u32, node_id: &str) -> ChunkAssignment {
        ChunkAssignment {
            chunk_index,
            node_id: node_id.to_string(),
            size_bytes: None,
        }
    }

    #[test]
    fn test_groups_in_first_appearance_order() {
        let distribution = Distribution::new(
            "f1",
            "a.bin",
            vec![
                assignment(0, "B"),
                assignment(1, "A"),
                assignment(2, "B"),
                assignment(3, "C"),
            ],
        )
        .unwrap();

        let groups = distribution.node_groups();
        assert_eq!(
            groups,
            vec![("B", vec![0, 2]), ("A", vec![1]), ("C", vec![3])]
        );
    }

    #[test]
    fn test_duplicate_chunk_rejected() {
        let err = Distribution::new("f1", "a.bin", vec![assignment(0, "A"), assignment(0, "B")])
            .unwrap_err();
        assert_eq!(err, DistributionError::DuplicateChunk(0));
    }

    #[test]
    fn test_missing_node_rejected() {
        let err = Distribution::new("f1", "a.bin", vec![assignment(4, " ")]).unwrap_err();
        assert_eq!(err, DistributionError::MissingNode(4));
    }

    #[rstest]
    #[case(3, 2, 1.5)]
    #[case(10, 3, 3.3)]
    #[case(4, 4, 1.0)]
    #[case(5, 0, 0.0)]
    fn test_replication_factor(#[case] total: usize, #[case] nodes: usize, #[case] expected: f64) {
        assert_eq!(replication_factor(total, nodes), expected);
    }

    #[test]
    fn test_progress_prefix() {
        let distribution = Distribution::new(
            "f1",
            "a.bin",
            vec![assignment(0, "A"), assignment(1, "B"), assignment(2, "A")],
        )
        .unwrap();

        let progress = DistributionProgress::build(&distribution, 2);
        assert!(progress.is_node_complete("B"));
        assert!(!progress.is_node_complete("A"));
        assert!(!progress.all_confirmed);
        assert_eq!(progress.nodes[0].chunk_indices, vec![0, 2]);
        assert_eq!(progress.nodes[0].confirmed, 1);
        assert_eq!(progress.replication_factor, 1.5);
    }
}
