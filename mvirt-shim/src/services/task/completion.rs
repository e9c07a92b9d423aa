//! One-shot completion signal for a task.

use std::sync::Arc;
use tokio::sync::watch;

/// Marks that a task's process has been reaped and its exit data is final.
///
/// Starts unset and is set exactly once. Any number of holders can poll it
/// or wait for it; clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Completion {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the signal. Returns false if it was already set.
    pub fn complete(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    /// Non-blocking poll.
    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }
}
