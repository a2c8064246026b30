//! Staged pipeline with per-item handoff.
//!
//! Every stage processes the same ordered item collection. A stage either runs
//! its items one at a time in order (sequential) or as one concurrent unit per
//! item (parallel). Downstream stages are released per item, so stage `S'`
//! may start item `k` as soon as `S` finished item `k`, whatever the modes of
//! `S` and `S'`.
//!
//! ## Architecture
//!
//! ```text
//! PipelineOrchestrator → Stage → execution units
//!
//! - PipelineOrchestrator: builds and links the chain, drives the run,
//!   enforces the barrier before the terminal stage
//! - Stage: owns an inbound Gate and its execution units
//! - Gate: owns the stage's StageSignals and maps upstream item indices
//!   onto them (per-item slot or ordered turnstile)
//! - ExecutionPolicy: decides unit layout and gate kind
//! ```
//!
//! ```text
//!  A (seq) ──release(k)──► B (seq) ──release(k)──► C (par) ··· D (seq, terminal)
//!                                                         │
//!          orchestrator: await A, B, C ──► start D ──► await D
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use lockstep::pipeline::{ExecutionPlan, PipelineOrchestrator, RunOptions, SimulatedWork, StageSpec};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let plan = ExecutionPlan::new(vec![
//!     StageSpec::sequential("A"),
//!     StageSpec::parallel("B"),
//!     StageSpec::sequential("C").terminal(),
//! ]);
//!
//! let work = Arc::new(SimulatedWork::new(Duration::from_millis(100)));
//! let pipeline = PipelineOrchestrator::build(&plan, vec!['1', '2', '3'], work, RunOptions::new())?;
//! let metrics = pipeline.run().await?;
//! println!("pipeline took {}ms", metrics.total_duration_ms);
//! ```

mod control;
mod gate;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod policy;
mod signal;
mod stage;
mod task;

pub use control::RunControl;
pub use gate::{Gate, PerItemGate, TurnstileGate};
pub use metrics::{ItemMetrics, PipelineMetrics, StageMetrics};
pub use pipeline::{ExecutionPlan, PipelineEvent, PipelineOrchestrator, RunOptions};
pub use policy::{Bounded, ExecutionMode, ExecutionPolicy, Parallel, Sequential};
pub use signal::StageSignal;
pub use stage::{Downstream, PipelineInputs, Stage, StageSpec};
pub use task::{ItemTask, SharedTask, SimulatedWork};
