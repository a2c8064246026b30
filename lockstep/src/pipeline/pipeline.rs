//! Pipeline orchestration.
//!
//! Builds the stage chain from an [`ExecutionPlan`], starts the first stage,
//! and waits for every non-terminal stage before starting the terminal
//! (aggregation) stage.

use super::control::RunControl;
use super::metrics::{PipelineMetrics, StageMetrics};
use super::policy::ExecutionMode;
use super::stage::{PipelineInputs, Stage, StageSpec};
use super::task::SharedTask;
use lockstep_shared::errors::{LockstepError, LockstepResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// Ordered stage declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    stages: Vec<StageSpec>,
}

impl ExecutionPlan {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Check that the plan can drive `item_count` items to completion.
    pub fn validate(&self, item_count: usize) -> LockstepResult<()> {
        let invalid =
            |msg: String| -> LockstepResult<()> { Err(LockstepError::InvalidConfiguration(msg)) };

        if self.stages.len() < 2 {
            return invalid(format!(
                "pipeline needs at least 2 stages, got {}",
                self.stages.len()
            ));
        }
        if item_count == 0 {
            return invalid("item collection is empty".to_string());
        }

        let terminals: Vec<&str> = self
            .stages
            .iter()
            .filter(|stage| stage.terminal)
            .map(|stage| stage.id.as_str())
            .collect();
        match terminals.as_slice() {
            [] => return invalid("no terminal stage declared".to_string()),
            [_] => {}
            many => return invalid(format!("multiple terminal stages: {}", many.join(", "))),
        }
        if let Some(last) = self.stages.last()
            && !last.terminal
        {
            return invalid(format!(
                "terminal stage {} must be the last stage",
                terminals[0]
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.id.is_empty() {
                return invalid("stage id must not be empty".to_string());
            }
            if !seen.insert(stage.id.as_str()) {
                return invalid(format!("duplicate stage id {}", stage.id));
            }
            if let ExecutionMode::Bounded { max_concurrent: 0 } = stage.mode {
                return invalid(format!("stage {} has a zero concurrency bound", stage.id));
            }
        }

        Ok(())
    }
}

/// Run-time knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Upper bound on each stage await during `run`. `None` waits forever.
    pub stage_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub fn with_no_timeout(mut self) -> Self {
        self.stage_timeout = None;
        self
    }
}

/// Monitoring notifications emitted by [`PipelineOrchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An intermediate stage finished all of its items.
    StageCompleted { index: usize, stage: String },
    /// The terminal stage finished; the run is complete.
    AggregationCompleted { index: usize, stage: String },
}

/// Owns a chain of linked stages and drives one run through it.
pub struct PipelineOrchestrator<I> {
    stages: Vec<Stage<I>>,
    control: Arc<RunControl>,
    options: RunOptions,
    monitor: Option<UnboundedSender<PipelineEvent>>,
    started: AtomicBool,
}

impl<I: Send + Sync + 'static> PipelineOrchestrator<I> {
    /// Validate the plan, construct every stage, and link stage[i] to stage[i+1].
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(
        plan: &ExecutionPlan,
        items: Vec<I>,
        work: SharedTask<I>,
        options: RunOptions,
    ) -> LockstepResult<Self> {
        plan.validate(items.len())?;

        let control = Arc::new(RunControl::new());
        let inputs = PipelineInputs {
            items: items.into(),
            work,
            control: Arc::clone(&control),
        };

        let stages = match Self::construct(plan, &inputs) {
            Ok(stages) => stages,
            Err(e) => {
                // Units of stages built so far are already waiting.
                control.cancel();
                return Err(e);
            }
        };

        tracing::info!(
            stages = stages.len(),
            items = inputs.items.len(),
            work = inputs.work.name(),
            "Pipeline built"
        );

        Ok(Self {
            stages,
            control,
            options,
            monitor: None,
            started: AtomicBool::new(false),
        })
    }

    fn construct(plan: &ExecutionPlan, inputs: &PipelineInputs<I>) -> LockstepResult<Vec<Stage<I>>> {
        let stages = plan
            .stages()
            .iter()
            .enumerate()
            .map(|(index, spec)| Stage::new(index, spec, inputs))
            .collect::<LockstepResult<Vec<_>>>()?;

        for pair in stages.windows(2) {
            pair[0].link_next(&pair[1])?;
        }
        Ok(stages)
    }

    /// Send monitoring events to `monitor` in addition to logging them.
    pub fn with_monitor(mut self, monitor: UnboundedSender<PipelineEvent>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Drive the pipeline to completion.
    ///
    /// Starts stage 0, waits for every non-terminal stage in order (reporting
    /// intermediate stages), then starts and waits for the terminal stage.
    /// A pipeline runs once; later calls fail with `InvalidState`.
    pub async fn run(&self) -> LockstepResult<PipelineMetrics> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LockstepError::InvalidState(
                "pipeline has already been run".to_string(),
            ));
        }

        let (terminal, rest) = self
            .stages
            .split_last()
            .ok_or_else(|| LockstepError::Internal("pipeline has no stages".into()))?;

        let total_start = Instant::now();
        let mut stage_metrics = Vec::with_capacity(self.stages.len());

        self.stages[0].start();

        for stage in rest {
            let metrics = self.await_stage(stage).await?;
            if stage.index() > 0 {
                tracing::info!(stage = %stage.id(), duration_ms = metrics.duration_ms, "Stage completed");
                self.emit(PipelineEvent::StageCompleted {
                    index: stage.index(),
                    stage: stage.id().to_string(),
                });
            }
            stage_metrics.push(metrics);
        }

        tracing::info!(stage = %terminal.id(), "All intermediate stages finished, starting aggregation");
        terminal.start();
        let metrics = self.await_stage(terminal).await?;
        tracing::info!(stage = %terminal.id(), duration_ms = metrics.duration_ms, "Aggregation completed");
        self.emit(PipelineEvent::AggregationCompleted {
            index: terminal.index(),
            stage: terminal.id().to_string(),
        });
        stage_metrics.push(metrics);

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }

    async fn await_stage(&self, stage: &Stage<I>) -> LockstepResult<StageMetrics> {
        let result = match self.options.stage_timeout {
            Some(timeout) => {
                let result = stage.await_completion_timeout(timeout).await;
                if let Err(e @ LockstepError::DeadlockTimeout { .. }) = &result {
                    tracing::error!(stage = %stage.id(), ?timeout, "Stage stalled, cancelling pipeline");
                    self.control.fail(e.clone());
                }
                result
            }
            None => stage.await_completion().await,
        };

        // Report the failure that caused the cancellation, not the cancellation.
        result.map_err(|e| self.control.root_failure().unwrap_or(e))
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(monitor) = &self.monitor
            && monitor.send(event).is_err()
        {
            tracing::debug!("Pipeline monitor dropped, event discarded");
        }
    }
}

impl<I> PipelineOrchestrator<I> {
    pub fn stages(&self) -> &[Stage<I>] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&Stage<I>> {
        self.stages.iter().find(|stage| stage.id() == id)
    }

    /// Stop the run: every waiting or working execution unit unwinds.
    pub fn cancel(&self) {
        tracing::warn!("Pipeline cancellation requested");
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

impl<I> Drop for PipelineOrchestrator<I> {
    fn drop(&mut self) {
        // Release units still parked on their gates.
        self.control.cancel();
    }
}
