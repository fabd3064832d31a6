//! Cooperative cancellation shared by batches, pipelines and workflows
//!
//! Cancellation never preempts running work. Loops check the flag at their
//! suspension points (before starting work, after waking from a backoff sleep)
//! and stop scheduling new work once it is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Cloneable cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the owner can be reused for another run
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Wait until the flag is set
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Sleep for `duration` unless cancelled first.
///
/// Returns `true` when the full duration elapsed and `false` when the flag
/// was set before or during the sleep.
pub async fn sleep_or_cancel(flag: Option<&CancellationFlag>, duration: Duration) -> bool {
    match flag {
        None => {
            tokio::time::sleep(duration).await;
            true
        }
        Some(flag) => {
            if flag.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(duration) => !flag.is_cancelled(),
                _ = flag.cancelled() => false,
            }
        }
    }
}
