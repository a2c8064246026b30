//! Stage runtime.
//!
//! A stage launches its execution units as soon as it is constructed. Each unit
//! loops over the item indices its policy assigned to it:
//!
//! ```text
//! Idle ──wait(slot)──► Running ──work ok──► Signaling ──► Idle (next item)
//!                                                     └─► Done (no items left)
//! ```
//!
//! `Signaling` releases the item into the downstream gate (unless the successor
//! is the terminal stage) and reports completion to the stage's own gate, which
//! is what re-arms a sequential turnstile.

use super::control::RunControl;
use super::gate::Gate;
use super::metrics::{ItemMetrics, StageMetrics};
use super::policy::{ExecutionMode, ExecutionPolicy};
use super::task::SharedTask;
use futures::FutureExt;
use futures::future::join_all;
use lockstep_shared::errors::{LockstepError, LockstepResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

/// Declaration of one stage in an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub mode: ExecutionMode,
    /// Aggregation stage: started explicitly after every other stage finished.
    #[serde(default)]
    pub terminal: bool,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            id: id.into(),
            mode,
            terminal: false,
        }
    }

    /// Create a stage processing items one at a time, in order.
    pub fn sequential(id: impl Into<String>) -> Self {
        Self::new(id, ExecutionMode::Sequential)
    }

    /// Create a stage processing every item concurrently.
    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, ExecutionMode::Parallel)
    }

    pub fn bounded(id: impl Into<String>, max_concurrent: usize) -> Self {
        Self::new(id, ExecutionMode::Bounded { max_concurrent })
    }

    /// Mark as the terminal aggregation stage.
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

/// Inputs shared by every stage of a pipeline.
pub struct PipelineInputs<I> {
    pub items: Arc<[I]>,
    pub work: SharedTask<I>,
    pub control: Arc<RunControl>,
}

impl<I> Clone for PipelineInputs<I> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            work: Arc::clone(&self.work),
            control: Arc::clone(&self.control),
        }
    }
}

/// Where a stage hands its finished items.
pub enum Downstream {
    /// Release each finished item into the successor's gate.
    Linked(Arc<dyn Gate>),
    /// The successor is the terminal stage and is started by the orchestrator.
    Terminal,
    /// No successor.
    Unlinked,
}

impl fmt::Debug for Downstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Downstream::Linked(gate) => write!(f, "Linked({} slots)", gate.slot_count()),
            Downstream::Terminal => f.write_str("Terminal"),
            Downstream::Unlinked => f.write_str("Unlinked"),
        }
    }
}

type UnitOutcome = LockstepResult<Vec<ItemMetrics>>;
type StageOutcome = LockstepResult<StageMetrics>;

/// State shared between a stage handle and its execution units.
struct StageCore<I> {
    index: usize,
    id: String,
    mode: String,
    terminal: bool,
    inputs: PipelineInputs<I>,
    gate: Arc<dyn Gate>,
    downstream: OnceLock<Downstream>,
    limiter: Option<Arc<Semaphore>>,
    finished: Box<[AtomicBool]>,
}

impl<I: Send + Sync + 'static> StageCore<I> {
    fn cancelled(&self) -> LockstepError {
        LockstepError::Cancelled {
            stage: self.id.clone(),
        }
    }

    async fn run_unit(self: Arc<Self>, unit: usize, items: Vec<usize>) -> UnitOutcome {
        tracing::debug!(
            stage = %self.id,
            unit,
            items = items.len(),
            "Execution unit created, waiting for signal"
        );

        let token = self.inputs.control.token().clone();
        let mut metrics = Vec::with_capacity(items.len());

        for index in items {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled()),
                _ = self.gate.slot(index).wait() => {}
            }

            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(self.cancelled()),
                    permit = Arc::clone(limiter).acquire_owned() => Some(permit.map_err(|e| {
                        LockstepError::Internal(format!("stage {} limiter closed: {}", self.id, e))
                    })?),
                },
                None => None,
            };

            let started = self.inputs.control.elapsed();
            tracing::debug!(stage = %self.id, item = index, mode = %self.mode, "Item started");

            let item = &self.inputs.items[index];
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled()),
                result = self.inputs.work.run(&self.id, index, item) => result,
            };
            if let Err(e) = result {
                let error = match e {
                    e @ LockstepError::WorkItemFailure { .. } => e,
                    other => LockstepError::WorkItemFailure {
                        stage: self.id.clone(),
                        item: index,
                        reason: other.to_string(),
                    },
                };
                self.inputs.control.fail(error.clone());
                return Err(error);
            }

            let finished = self.inputs.control.elapsed();
            drop(permit);
            self.finished[index].store(true, Ordering::Release);
            tracing::debug!(stage = %self.id, item = index, mode = %self.mode, "Item finished");

            metrics.push(ItemMetrics {
                index,
                started,
                finished,
            });

            if let Some(Downstream::Linked(next)) = self.downstream.get() {
                next.release(index);
            }
            self.gate.complete(index);
        }

        Ok(metrics)
    }

    /// Join every unit and publish the stage outcome.
    async fn collect(
        self: Arc<Self>,
        units: Vec<JoinHandle<UnitOutcome>>,
        outcome: watch::Sender<Option<StageOutcome>>,
    ) {
        let mut items = Vec::new();
        let mut error: Option<LockstepError> = None;

        for joined in join_all(units).await {
            let result = joined.unwrap_or_else(|e| {
                Err(LockstepError::Internal(format!(
                    "execution unit of stage {} aborted: {}",
                    self.id, e
                )))
            });
            match result {
                Ok(unit_items) => items.extend(unit_items),
                // A root cause outranks the cancellations it triggered.
                Err(e) if error.as_ref().is_none_or(LockstepError::is_cancelled) => {
                    error = Some(e)
                }
                Err(_) => {}
            }
        }

        let result = match error {
            Some(e) => Err(e),
            None => {
                let metrics = StageMetrics::from_items(
                    self.index,
                    &self.id,
                    self.mode.clone(),
                    self.terminal,
                    items,
                );
                tracing::info!(
                    stage = %self.id,
                    duration_ms = metrics.duration_ms,
                    "Stage execution units finished"
                );
                Ok(metrics)
            }
        };

        outcome.send_replace(Some(result));
    }
}

/// One pipeline step.
///
/// Owns its inbound gate and execution units. The units exist from
/// construction until every assigned item is processed or the run is
/// cancelled.
pub struct Stage<I> {
    core: Arc<StageCore<I>>,
    unit_count: usize,
    outcome: watch::Receiver<Option<StageOutcome>>,
}

impl<I: Send + Sync + 'static> Stage<I> {
    /// Build a stage and launch its execution units.
    ///
    /// Must be called from within a tokio runtime. Units start out waiting on
    /// their gate; nothing runs until the stage is started or released by an
    /// upstream stage.
    pub fn new(index: usize, spec: &StageSpec, inputs: &PipelineInputs<I>) -> LockstepResult<Self> {
        Self::with_policy(index, spec, spec.mode.policy(), inputs)
    }

    /// Build a stage with an explicit execution policy, ignoring `spec.mode`.
    pub fn with_policy(
        index: usize,
        spec: &StageSpec,
        policy: Arc<dyn ExecutionPolicy>,
        inputs: &PipelineInputs<I>,
    ) -> LockstepResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            LockstepError::Internal(format!("stage {} requires a tokio runtime: {}", spec.id, e))
        })?;

        let item_count = inputs.items.len();
        let core = Arc::new(StageCore {
            index,
            id: spec.id.clone(),
            mode: policy.name(),
            terminal: spec.terminal,
            inputs: inputs.clone(),
            gate: policy.gate(item_count),
            downstream: OnceLock::new(),
            limiter: policy
                .concurrency_limit()
                .map(|limit| Arc::new(Semaphore::new(limit))),
            finished: (0..item_count).map(|_| AtomicBool::new(false)).collect(),
        });

        let units: Vec<JoinHandle<UnitOutcome>> = policy
            .plan_units(item_count)
            .into_iter()
            .enumerate()
            .map(|(unit, items)| {
                let core = Arc::clone(&core);
                runtime.spawn(async move {
                    let control = Arc::clone(&core.inputs.control);
                    let stage = core.id.clone();
                    match AssertUnwindSafe(core.run_unit(unit, items)).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            let error = LockstepError::Internal(format!(
                                "execution unit {} of stage {} panicked",
                                unit, stage
                            ));
                            control.fail(error.clone());
                            Err(error)
                        }
                    }
                })
            })
            .collect();
        let unit_count = units.len();

        tracing::debug!(
            stage = %core.id,
            mode = %core.mode,
            items = item_count,
            units = unit_count,
            signals = core.gate.slot_count(),
            "Stage constructed"
        );

        let (tx, rx) = watch::channel(None);
        runtime.spawn(Arc::clone(&core).collect(units, tx));

        Ok(Self {
            core,
            unit_count,
            outcome: rx,
        })
    }

    /// Record the successor. A terminal successor is never released per item.
    pub fn link_next(&self, next: &Stage<I>) -> LockstepResult<()> {
        let downstream = if next.is_terminal() {
            Downstream::Terminal
        } else {
            Downstream::Linked(Arc::clone(&next.core.gate))
        };

        tracing::debug!(stage = %self.id(), next = %next.id(), link = ?downstream, "Linked stage");

        self.core.downstream.set(downstream).map_err(|_| {
            LockstepError::InvalidState(format!("stage {} is already linked", self.id()))
        })
    }

    /// Open the entry slot(s) so the first unit can proceed.
    pub fn start(&self) {
        tracing::info!(stage = %self.id(), "Starting stage");
        self.core.gate.start();
    }

    /// Wait until every execution unit has returned.
    ///
    /// Repeated calls return the same outcome.
    pub async fn await_completion(&self) -> LockstepResult<StageMetrics> {
        let mut outcome = self.outcome.clone();
        let guard = outcome.wait_for(Option::is_some).await.map_err(|_| {
            LockstepError::Internal(format!("stage {} lost its completion channel", self.id()))
        })?;

        match guard.as_ref() {
            Some(result) => result.clone(),
            None => Err(LockstepError::Internal(format!(
                "stage {} published an empty outcome",
                self.id()
            ))),
        }
    }

    /// Bounded variant of [`Stage::await_completion`].
    ///
    /// Does not cancel the stage on timeout.
    pub async fn await_completion_timeout(&self, timeout: Duration) -> LockstepResult<StageMetrics> {
        match tokio::time::timeout(timeout, self.await_completion()).await {
            Ok(result) => result,
            Err(_) => Err(LockstepError::DeadlockTimeout {
                stage: self.id().to_string(),
                item: self.first_pending_item(),
                timeout,
            }),
        }
    }
}

impl<I> Stage<I> {
    pub fn index(&self) -> usize {
        self.core.index
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn mode(&self) -> &str {
        &self.core.mode
    }

    pub fn is_terminal(&self) -> bool {
        self.core.terminal
    }

    pub fn item_count(&self) -> usize {
        self.core.inputs.items.len()
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    /// Number of inbound signals.
    pub fn signal_count(&self) -> usize {
        self.core.gate.slot_count()
    }

    pub fn downstream(&self) -> Option<&Downstream> {
        self.core.downstream.get()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Lowest item index this stage has not finished.
    pub fn first_pending_item(&self) -> Option<usize> {
        self.core
            .finished
            .iter()
            .position(|done| !done.load(Ordering::Acquire))
    }
}
