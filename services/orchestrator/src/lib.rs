//! Storage node lifecycle orchestrator.
//!
//! Provisions storage nodes asynchronously, confirms they register with the
//! network, keeps a cached view of the externally owned state fresh, and
//! tracks how an uploaded file's chunks land on nodes.
//!
//! ## Architecture
//!
//! - **Lifecycle registry**: optimistic per-node provisioning entries
//! - **Confirmation poller**: bounded registration checks per new node
//! - **Refresh scheduler**: periodic re-sync of nodes, files and status
//! - **Distribution tracker**: timed reveal of one file's chunk placement
//! - **Network API**: the storage network (HTTP in prod, mock in dev/tests)
//!
//! All timers observe one [`scope::TeardownScope`].

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod distribution;
pub mod lifecycle;
pub mod orchestrator;
pub mod output;
pub mod poller;
pub mod refresh;
pub mod registry;
pub mod scope;

pub use cache::{CacheSnapshot, CacheSource, CacheStore};
pub use client::{
    ApiError, Decision, FileRecord, HttpNetworkClient, NetworkStatus, NodeRecord, NodeStartRequest,
};
pub use config::Config;
pub use distribution::{
    ChunkAssignment, Distribution, DistributionError, DistributionProgress, DistributionTracker,
    RevealConfig,
};
pub use lifecycle::LifecycleRegistry;
pub use orchestrator::{ActionOutcome, NodeOrchestrator};
pub use poller::{ConfirmationPoller, PollOutcome, PollerConfig, PollerHandle};
pub use refresh::{RefreshConfig, RefreshReport, RefreshScheduler, RefreshTrigger};
pub use registry::{MockEndpoint, MockNetwork, NetworkApi};
pub use scope::{teardown_scope, TeardownScope, TeardownTrigger};
