//! Teardown scope shared by every timer task.

use tokio::sync::watch;

/// Create a linked trigger/scope pair.
pub fn teardown_scope() -> (TeardownTrigger, TeardownScope) {
    let (tx, rx) = watch::channel(false);
    (TeardownTrigger { tx }, TeardownScope { rx })
}

/// Fires teardown for every clone of the paired scope.
#[derive(Debug)]
pub struct TeardownTrigger {
    tx: watch::Sender<bool>,
}

impl TeardownTrigger {
    pub fn teardown(&self) {
        // send_replace succeeds even with no receivers left.
        self.tx.send_replace(true);
    }
}

/// Observed by timer tasks. Dropping the trigger also counts as teardown.
#[derive(Debug, Clone)]
pub struct TeardownScope {
    rx: watch::Receiver<bool>,
}

impl TeardownScope {
    pub fn is_torn_down(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once teardown has been triggered.
    pub async fn torn_down(&self) {
        let mut rx = self.rx.clone();
        // Err means the trigger is gone, which is teardown too.
        let _ = rx.wait_for(|down| *down).await;
    }
}
