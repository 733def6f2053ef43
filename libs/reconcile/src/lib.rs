//! Node provisioning primitives.
//!
//! This library holds the synchronous, side-effect free parts of node
//! provisioning. The async orchestrator wraps these in owned containers and
//! drives them from timers. Key concepts:
//!
//! - **Lifecycle entry**: optimistic, local record of a node's journey from
//!   provisioning request to confirmed-running (or failed).
//! - **Port allocation**: picking the first free port above a base.
//! - **Poll budget**: the bounded attempt counter behind registration checks.
//!
//! # Invariants
//!
//! - At most one lifecycle entry exists per node id
//! - Progress never decreases while an entry is not terminal
//! - Terminal entries (active, failed) never transition again

mod budget;
mod lifecycle;
mod ports;

use std::time::Duration;

pub use budget::PollBudget;
pub use lifecycle::{LifecycleEntry, LifecycleError, LifecycleState, LifecycleTable, Transition};
pub use ports::{allocate_port, PortAllocator};

/// First port handed to a newly provisioned node.
pub const DEFAULT_BASE_PORT: u32 = 50051;

/// Registration checks before a provisioning attempt is declared failed.
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 15;

/// Spacing between registration checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How long an active entry stays visible before it is retired.
pub const DEFAULT_RETIRE_DELAY: Duration = Duration::from_secs(3);

/// Failure message recorded when a node never shows up in the running set.
pub const REGISTRATION_TIMEOUT_MESSAGE: &str = "node did not register within the timeout window";
