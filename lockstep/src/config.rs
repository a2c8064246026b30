//! File-based pipeline configuration.
//!
//! ```json
//! {
//!   "stages": [
//!     { "id": "A", "mode": "sequential" },
//!     { "id": "B", "mode": "parallel" },
//!     { "id": "C", "mode": { "bounded": { "max_concurrent": 2 } } },
//!     { "id": "D", "mode": "sequential", "terminal": true }
//!   ],
//!   "items": ["1", "2", "3"],
//!   "work_delay_ms": 1000,
//!   "stage_timeout_ms": 60000
//! }
//! ```

use crate::pipeline::{ExecutionPlan, RunOptions, StageSpec};
use lockstep_shared::errors::{LockstepError, LockstepResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_WORK_DELAY_MS: u64 = 1000;

fn default_work_delay_ms() -> u64 {
    DEFAULT_WORK_DELAY_MS
}

/// Construction-time configuration of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageSpec>,
    /// Opaque work items, shared by every stage.
    pub items: Vec<String>,
    /// Per-item delay of the simulated work function.
    #[serde(default = "default_work_delay_ms")]
    pub work_delay_ms: u64,
    /// Bound on each stage await; absent means wait forever.
    #[serde(default)]
    pub stage_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    /// Four stages A → B → C → D (C parallel, D terminal) over items "1".."7".
    fn default() -> Self {
        Self {
            stages: vec![
                StageSpec::sequential("A"),
                StageSpec::sequential("B"),
                StageSpec::parallel("C"),
                StageSpec::sequential("D").terminal(),
            ],
            items: (1..=7).map(|i| i.to_string()).collect(),
            work_delay_ms: DEFAULT_WORK_DELAY_MS,
            stage_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> LockstepResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LockstepError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&raw).map_err(|e| match e {
            LockstepError::Config(msg) => {
                LockstepError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        tracing::debug!(
            path = %path.display(),
            stages = config.stages.len(),
            items = config.items.len(),
            "Loaded pipeline config"
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> LockstepResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| LockstepError::Config(format!("Invalid pipeline config: {}", e)))?;
        config.sanitize()?;
        Ok(config)
    }

    /// Validate the stage plan against the item set.
    pub fn sanitize(&self) -> LockstepResult<()> {
        self.to_plan().validate(self.items.len())
    }

    pub fn to_plan(&self) -> ExecutionPlan {
        ExecutionPlan::new(self.stages.clone())
    }

    pub fn work_delay(&self) -> Duration {
        Duration::from_millis(self.work_delay_ms)
    }

    pub fn run_options(&self) -> RunOptions {
        match self.stage_timeout_ms {
            Some(ms) => RunOptions::new().with_stage_timeout(Duration::from_millis(ms)),
            None => RunOptions::new(),
        }
    }
}
