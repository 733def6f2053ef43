//! Per-node provisioning state machine.
//!
//! ```text
//! creating(10) -> starting(30) -> registering(60..99) -> active(100)
//!      |              |                 |
//!      +--------------+-----------------+-----------> failed(100)
//! ```
//!
//! Transitions only move forward. A node id can be provisioned again only
//! after its previous entry is gone (retired after active, or dismissed
//! after failed).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) const CREATING_PROGRESS: f64 = 10.0;
pub(crate) const STARTING_PROGRESS: f64 = 30.0;
pub(crate) const REGISTERING_PROGRESS: f64 = 60.0;
pub(crate) const REGISTERING_PROGRESS_CEILING: f64 = 99.0;
pub(crate) const TERMINAL_PROGRESS: f64 = 100.0;

/// Provisioning phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Entry recorded, port reserved.
    Creating,
    /// Start request sent to the node registry.
    Starting,
    /// Start accepted; waiting for the node to appear in the running set.
    Registering,
    /// Node confirmed running (terminal).
    Active,
    /// Provisioning failed (terminal).
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }

    /// Progress reported on entering this state.
    pub fn base_progress(&self) -> f64 {
        match self {
            Self::Creating => CREATING_PROGRESS,
            Self::Starting => STARTING_PROGRESS,
            Self::Registering => REGISTERING_PROGRESS,
            Self::Active | Self::Failed => TERMINAL_PROGRESS,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Creating => 0,
            Self::Starting => 1,
            Self::Registering => 2,
            Self::Active | Self::Failed => 3,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle errors.
///
/// `DuplicateEntry`, `PortInUse` and `PollerAlreadyRunning` are precondition
/// violations: the caller asked for something it should have checked first.
/// The rest are rejected transitions, which leave the entry untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("lifecycle entry already exists for {0}")]
    DuplicateEntry(String),

    #[error("port {port} is already reserved by {holder}")]
    PortInUse { port: u32, holder: String },

    #[error("confirmation poller already running for {0}")]
    PollerAlreadyRunning(String),

    #[error("no lifecycle entry for {0}")]
    NotFound(String),

    #[error("{node_id} is {state}; terminal entries do not transition")]
    Terminal {
        node_id: String,
        state: LifecycleState,
    },

    #[error("{node_id}: {to} is terminal and must be reached through mark_active/mark_failed")]
    TerminalViaAdvance {
        node_id: String,
        to: LifecycleState,
    },

    #[error("{node_id}: state regression {from} -> {to}")]
    StateRegression {
        node_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("{node_id}: progress regression {current} -> {requested}")]
    ProgressRegression {
        node_id: String,
        current: f64,
        requested: f64,
    },

    #[error("{node_id}: invalid progress {requested}")]
    InvalidProgress { node_id: String, requested: f64 },

    #[error("{node_id} is {state}; only failed entries can be dismissed")]
    NotDismissable {
        node_id: String,
        state: LifecycleState,
    },
}

impl LifecycleError {
    /// Returns true for caller bugs (as opposed to rejected transitions).
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateEntry(_) | Self::PortInUse { .. } | Self::PollerAlreadyRunning(_)
        )
    }
}

/// Result of an accepted `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The entry changed.
    Applied,
    /// Same state and progress as before; nothing to do.
    Unchanged,
}

/// Ephemeral tracking record for one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEntry {
    pub node_id: String,
    pub state: LifecycleState,
    pub progress: f64,
    pub port: u32,
    pub error: Option<String>,
    /// Distinguishes successive entries for the same node id.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleEntry {
    fn new(node_id: String, port: u32, generation: u64) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            state: LifecycleState::Creating,
            progress: CREATING_PROGRESS,
            port,
            error: None,
            generation,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn ensure_open(&self) -> Result<(), LifecycleError> {
        if self.is_terminal() {
            return Err(LifecycleError::Terminal {
                node_id: self.node_id.clone(),
                state: self.state,
            });
        }
        Ok(())
    }

    fn finish(&mut self, state: LifecycleState, error: Option<String>) {
        self.state = state;
        self.progress = TERMINAL_PROGRESS;
        self.error = error;
        self.updated_at = Utc::now();
    }
}

/// The entry map. All writes go through the methods below.
#[derive(Debug, Default)]
pub struct LifecycleTable {
    entries: BTreeMap<String, LifecycleEntry>,
    next_generation: u64,
}

impl LifecycleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry in `Creating` at progress 10.
    pub fn create(&mut self, node_id: &str, port: u32) -> Result<&LifecycleEntry, LifecycleError> {
        if self.entries.contains_key(node_id) {
            return Err(LifecycleError::DuplicateEntry(node_id.to_string()));
        }
        if let Some(holder) = self.entries.values().find(|e| e.port == port) {
            return Err(LifecycleError::PortInUse {
                port,
                holder: holder.node_id.clone(),
            });
        }

        self.next_generation += 1;
        let entry = LifecycleEntry::new(node_id.to_string(), port, self.next_generation);
        Ok(self.entries.entry(node_id.to_string()).or_insert(entry))
    }

    /// Move a non-terminal entry forward.
    pub fn advance(
        &mut self,
        node_id: &str,
        state: LifecycleState,
        progress: f64,
    ) -> Result<Transition, LifecycleError> {
        let entry = self.get_mut(node_id)?;
        entry.ensure_open()?;

        if state.is_terminal() {
            return Err(LifecycleError::TerminalViaAdvance {
                node_id: node_id.to_string(),
                to: state,
            });
        }
        if !progress.is_finite() || !(0.0..=REGISTERING_PROGRESS_CEILING).contains(&progress) {
            return Err(LifecycleError::InvalidProgress {
                node_id: node_id.to_string(),
                requested: progress,
            });
        }
        if state.rank() < entry.state.rank() {
            return Err(LifecycleError::StateRegression {
                node_id: node_id.to_string(),
                from: entry.state,
                to: state,
            });
        }
        if progress < entry.progress {
            return Err(LifecycleError::ProgressRegression {
                node_id: node_id.to_string(),
                current: entry.progress,
                requested: progress,
            });
        }
        if state == entry.state && progress == entry.progress {
            return Ok(Transition::Unchanged);
        }

        entry.state = state;
        entry.progress = progress;
        entry.updated_at = Utc::now();
        Ok(Transition::Applied)
    }

    /// Mark an entry active. Returns its generation, for `retire`.
    pub fn mark_active(&mut self, node_id: &str) -> Result<u64, LifecycleError> {
        let entry = self.get_mut(node_id)?;
        entry.ensure_open()?;
        entry.finish(LifecycleState::Active, None);
        Ok(entry.generation)
    }

    /// Mark an entry failed. The entry stays until dismissed.
    pub fn mark_failed(&mut self, node_id: &str, reason: &str) -> Result<(), LifecycleError> {
        let entry = self.get_mut(node_id)?;
        entry.ensure_open()?;
        entry.finish(LifecycleState::Failed, Some(reason.to_string()));
        Ok(())
    }

    /// Remove an active entry, but only the generation that became active.
    pub fn retire(&mut self, node_id: &str, generation: u64) -> Option<LifecycleEntry> {
        let matches = self
            .entries
            .get(node_id)
            .is_some_and(|e| e.state == LifecycleState::Active && e.generation == generation);
        if matches {
            self.entries.remove(node_id)
        } else {
            None
        }
    }

    /// Operator acknowledgement of a failed entry.
    pub fn dismiss(&mut self, node_id: &str) -> Result<LifecycleEntry, LifecycleError> {
        let entry = self
            .entries
            .get(node_id)
            .ok_or_else(|| LifecycleError::NotFound(node_id.to_string()))?;
        if entry.state != LifecycleState::Failed {
            return Err(LifecycleError::NotDismissable {
                node_id: node_id.to_string(),
                state: entry.state,
            });
        }
        self.entries
            .remove(node_id)
            .ok_or_else(|| LifecycleError::NotFound(node_id.to_string()))
    }

    pub fn get(&self, node_id: &str) -> Option<&LifecycleEntry> {
        self.entries.get(node_id)
    }

    /// Ports reserved by every entry currently in the table.
    pub fn ports(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.values().map(|e| e.port)
    }

    /// Owned copy of all entries, ordered by node id.
    pub fn snapshot(&self) -> Vec<LifecycleEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_mut(&mut self, node_id: &str) -> Result<&mut LifecycleEntry, LifecycleError> {
        self.entries
            .get_mut(node_id)
            .ok_or_else(|| LifecycleError::NotFound(node_id.to_string()))
    }
}
