//! Single-slot handoff primitive.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Auto-reset binary event.
///
/// `set` marks the slot ready and never blocks. `wait` suspends until the slot
/// is ready, then clears it before returning. The slot holds at most one
/// pending set: two sets without a wait in between collapse into one.
///
/// Each signal is expected to have a single consumer.
#[derive(Debug, Default)]
pub struct StageSignal {
    ready: Mutex<bool>,
    notify: Notify,
}

impl StageSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the slot ready. Idempotent.
    pub fn set(&self) {
        *self.ready.lock() = true;
        self.notify.notify_one();
    }

    /// Wait until the slot is ready and consume it.
    ///
    /// Cancel-safe: dropping the future before it completes leaves the slot
    /// untouched.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the slot so a concurrent set
            // between the check and the await is not lost.
            notified.as_mut().enable();

            if self.try_take() {
                return;
            }
            notified.await;
        }
    }

    /// Consume the slot if it is ready, without waiting.
    pub fn try_take(&self) -> bool {
        std::mem::replace(&mut *self.ready.lock(), false)
    }

    /// Whether a set is pending.
    pub fn is_set(&self) -> bool {
        *self.ready.lock()
    }
}
