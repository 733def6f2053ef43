//! Registration confirmation poller.
//!
//! After a start request is accepted the node still has to show up in the
//! running set. The poller checks on a fixed interval with a bounded budget
//! and drives the lifecycle entry to `Active` or `Failed`.
//!
//! At most one poller runs per node id. A canceled poller never touches the
//! entry again: cancellation and every entry write take the same gate.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use stumatch_reconcile::{
    LifecycleError, LifecycleState, PollBudget, DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL,
    REGISTRATION_TIMEOUT_MESSAGE,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::lifecycle::{log_rejection, LifecycleRegistry};
use crate::scope::TeardownScope;

/// Poller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&Config> for PollerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.poll_max_attempts,
            interval: config.poll_interval,
        }
    }
}

/// How a poller ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Node showed up in the running set.
    Active { attempts: u32 },
    /// Budget exhausted.
    Failed { attempts: u32 },
    /// Canceled through its handle.
    Canceled,
    /// Teardown, or the entry was changed by someone else.
    Abandoned,
}

struct CancelState {
    tx: watch::Sender<bool>,
    gate: tokio::sync::Mutex<()>,
}

impl CancelState {
    async fn cancel(&self) {
        let _gate = self.gate.lock().await;
        self.tx.send_replace(true);
    }
}

type ActivePollers = Arc<Mutex<HashMap<String, Arc<CancelState>>>>;

/// Removes the poller from the active set when its task ends.
struct ActiveGuard {
    active: ActivePollers,
    node_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.node_id);
    }
}

fn lock_active(active: &ActivePollers) -> MutexGuard<'_, HashMap<String, Arc<CancelState>>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a running poller.
pub struct PollerHandle {
    node_id: String,
    cancel: Arc<CancelState>,
    task: JoinHandle<PollOutcome>,
}

impl PollerHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stop the poller. Once this returns the entry is not written again.
    pub async fn cancel(&self) {
        self.cancel.cancel().await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the poller to end.
    pub async fn join(self) -> PollOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Poller task failed");
                PollOutcome::Abandoned
            }
        }
    }
}

/// Starts and tracks confirmation pollers.
#[derive(Clone)]
pub struct ConfirmationPoller {
    registry: LifecycleRegistry,
    config: PollerConfig,
    scope: TeardownScope,
    active: ActivePollers,
}

impl ConfirmationPoller {
    pub fn new(registry: LifecycleRegistry, config: PollerConfig, scope: TeardownScope) -> Self {
        Self {
            registry,
            config,
            scope,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start polling `check` for `node_id`.
    ///
    /// The entry moves to `Registering` at 60 before this returns.
    pub async fn start<F, Fut, E>(
        &self,
        node_id: &str,
        check: F,
    ) -> Result<PollerHandle, LifecycleError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let cancel = Arc::new(CancelState {
            tx,
            gate: tokio::sync::Mutex::new(()),
        });

        {
            let mut active = lock_active(&self.active);
            if active.contains_key(node_id) {
                let err = LifecycleError::PollerAlreadyRunning(node_id.to_string());
                log_rejection("start_poller", &err);
                return Err(err);
            }
            active.insert(node_id.to_string(), Arc::clone(&cancel));
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            node_id: node_id.to_string(),
        };

        self.registry
            .advance(
                node_id,
                LifecycleState::Registering,
                LifecycleState::Registering.base_progress(),
            )
            .await?;

        info!(
            node_id = %node_id,
            max_attempts = self.config.max_attempts,
            interval_ms = self.config.interval.as_millis() as u64,
            "Waiting for node registration"
        );

        let task = tokio::spawn(poll_loop(
            node_id.to_string(),
            self.registry.clone(),
            self.config,
            self.scope.clone(),
            Arc::clone(&cancel),
            rx,
            check,
            guard,
        ));

        Ok(PollerHandle {
            node_id: node_id.to_string(),
            cancel,
            task,
        })
    }

    /// Cancel the poller for `node_id`. Returns false if none was running.
    pub async fn cancel(&self, node_id: &str) -> bool {
        let cancel = lock_active(&self.active).get(node_id).cloned();
        match cancel {
            Some(cancel) => {
                cancel.cancel().await;
                debug!(node_id = %node_id, "Poller canceled");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, node_id: &str) -> bool {
        lock_active(&self.active).contains_key(node_id)
    }
}

async fn canceled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|c| *c).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop<F, Fut, E>(
    node_id: String,
    registry: LifecycleRegistry,
    config: PollerConfig,
    scope: TeardownScope,
    cancel: Arc<CancelState>,
    mut rx: watch::Receiver<bool>,
    mut check: F,
    _guard: ActiveGuard,
) -> PollOutcome
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<bool, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut budget = PollBudget::new(config.max_attempts, config.interval);
    let mut ticker = interval_at(Instant::now() + budget.interval(), budget.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = canceled(&mut rx) => return PollOutcome::Canceled,
            _ = scope.torn_down() => return PollOutcome::Abandoned,
            _ = ticker.tick() => {}
        }

        let attempt = budget.record_attempt();
        let result = tokio::select! {
            biased;
            _ = canceled(&mut rx) => return PollOutcome::Canceled,
            _ = scope.torn_down() => return PollOutcome::Abandoned,
            result = check() => result,
        };

        let _gate = cancel.gate.lock().await;
        let is_canceled = *rx.borrow();
        if is_canceled {
            return PollOutcome::Canceled;
        }
        if scope.is_torn_down() {
            return PollOutcome::Abandoned;
        }

        match result {
            Ok(true) => {
                return match registry.mark_active(&node_id).await {
                    Ok(()) => {
                        info!(node_id = %node_id, attempt, "Node registered");
                        PollOutcome::Active { attempts: attempt }
                    }
                    Err(_) => PollOutcome::Abandoned,
                };
            }
            Ok(false) if budget.is_exhausted() => {
                return match registry
                    .mark_failed(&node_id, REGISTRATION_TIMEOUT_MESSAGE)
                    .await
                {
                    Ok(()) => PollOutcome::Failed { attempts: attempt },
                    Err(_) => PollOutcome::Abandoned,
                };
            }
            Ok(false) => {
                let progress = budget.registering_progress();
                debug!(node_id = %node_id, attempt, progress, "Node not registered yet");
                if registry
                    .advance(&node_id, LifecycleState::Registering, progress)
                    .await
                    .is_err()
                {
                    return PollOutcome::Abandoned;
                }
            }
            Err(e) => {
                // The tick is spent; the budget only ends on a negative answer.
                warn!(node_id = %node_id, attempt, error = %e, "Registration check failed");
            }
        }
    }
}
