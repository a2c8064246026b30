//! Error taxonomy for pipeline construction and execution.
//!
//! Construction problems surface synchronously from `build`. Runtime problems
//! abort the run and name the stage (and item, where one is known) that failed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type LockstepResult<T> = Result<T, LockstepError>;

/// Errors produced while building or running a pipeline.
///
/// Cloneable so a single stage outcome can be handed to every caller that
/// awaits the stage.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LockstepError {
    /// The stage plan or item set cannot form a runnable pipeline.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The work function failed for one item.
    #[error("stage {stage} failed on item {item}: {reason}")]
    WorkItemFailure {
        stage: String,
        item: usize,
        reason: String,
    },

    /// A stage did not finish within the configured bound.
    #[error("stage {stage} stalled on item {item:?} after {timeout:?}")]
    DeadlockTimeout {
        stage: String,
        item: Option<usize>,
        timeout: Duration,
    },

    /// The run was stopped before the stage finished.
    #[error("stage {stage} was cancelled")]
    Cancelled { stage: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LockstepError {
    /// Whether this error is a consequence of cancellation rather than a root cause.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LockstepError::Cancelled { .. })
    }
}
