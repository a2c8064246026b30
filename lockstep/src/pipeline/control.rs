//! Run-wide state shared by every stage of one pipeline.

use lockstep_shared::errors::LockstepError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation, first-failure record, and clock epoch for one run.
#[derive(Debug)]
pub struct RunControl {
    cancel: CancellationToken,
    failure: Mutex<Option<LockstepError>>,
    epoch: Instant,
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            failure: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a failure and stop the run. Only the first failure is kept.
    pub fn fail(&self, error: LockstepError) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                tracing::error!(error = %error, "Pipeline failure, cancelling remaining work");
                *failure = Some(error);
            }
        }
        self.cancel.cancel();
    }

    /// The first recorded failure, if any.
    pub fn root_failure(&self) -> Option<LockstepError> {
        self.failure.lock().clone()
    }

    /// Time since the pipeline was built.
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}
