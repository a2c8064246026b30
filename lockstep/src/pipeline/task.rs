//! Work function trait for pipeline stages.

use async_trait::async_trait;
use lockstep_shared::errors::LockstepResult;
use std::time::Duration;

/// Work performed by a stage on a single item.
///
/// The same instance is shared by every stage and every execution unit, so
/// implementations must be safe to call concurrently. Items are opaque to the
/// pipeline; only the work function looks at them.
#[async_trait]
pub trait ItemTask<I>: Send + Sync {
    /// Process `item` (at position `index` in the shared collection) for `stage`.
    async fn run(&self, stage: &str, index: usize, item: &I) -> LockstepResult<()>;

    /// Get human-readable task name for logging.
    fn name(&self) -> &str;
}

pub type SharedTask<I> = std::sync::Arc<dyn ItemTask<I>>;

/// Placeholder workload: waits a fixed delay per item.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedWork {
    delay: Duration,
}

impl SimulatedWork {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

#[async_trait]
impl<I: Send + Sync> ItemTask<I> for SimulatedWork {
    async fn run(&self, _stage: &str, _index: usize, _item: &I) -> LockstepResult<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated_work"
    }
}
