//! Execution policies: how a stage spreads its items over execution units.

use super::gate::{Gate, PerItemGate, TurnstileGate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Execution mode for a stage, as written in a plan or config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One long-lived unit processing items strictly in order.
    Sequential,
    /// One unit per item, all eligible to run concurrently.
    Parallel,
    /// One unit per item, at most `max_concurrent` doing work at once.
    Bounded { max_concurrent: usize },
}

impl ExecutionMode {
    pub fn policy(self) -> Arc<dyn ExecutionPolicy> {
        match self {
            ExecutionMode::Sequential => Arc::new(Sequential),
            ExecutionMode::Parallel => Arc::new(Parallel),
            ExecutionMode::Bounded { max_concurrent } => Arc::new(Bounded { max_concurrent }),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => f.write_str("sequential"),
            ExecutionMode::Parallel => f.write_str("parallel"),
            ExecutionMode::Bounded { max_concurrent } => write!(f, "bounded({max_concurrent})"),
        }
    }
}

/// Strategy a stage uses to schedule its items.
///
/// The stage itself only knows how to run a unit over a list of item indices;
/// the policy decides how many units exist, which items each one owns, and
/// what the inbound gate looks like.
pub trait ExecutionPolicy: Send + Sync + fmt::Debug {
    /// Short label used in logs and metrics.
    fn name(&self) -> String;

    /// Item indices per execution unit, each list in processing order.
    fn plan_units(&self, item_count: usize) -> Vec<Vec<usize>>;

    /// Build the inbound gate for a stage of `item_count` items.
    fn gate(&self, item_count: usize) -> Arc<dyn Gate>;

    /// Upper bound on units doing work at the same time, if any.
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl ExecutionPolicy for Sequential {
    fn name(&self) -> String {
        "sequential".to_string()
    }

    fn plan_units(&self, item_count: usize) -> Vec<Vec<usize>> {
        vec![(0..item_count).collect()]
    }

    fn gate(&self, item_count: usize) -> Arc<dyn Gate> {
        Arc::new(TurnstileGate::new(item_count))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Parallel;

impl ExecutionPolicy for Parallel {
    fn name(&self) -> String {
        "parallel".to_string()
    }

    fn plan_units(&self, item_count: usize) -> Vec<Vec<usize>> {
        (0..item_count).map(|index| vec![index]).collect()
    }

    fn gate(&self, item_count: usize) -> Arc<dyn Gate> {
        Arc::new(PerItemGate::new(item_count))
    }
}

/// Parallel with a cap on concurrent work.
#[derive(Debug, Clone, Copy)]
pub struct Bounded {
    pub max_concurrent: usize,
}

impl ExecutionPolicy for Bounded {
    fn name(&self) -> String {
        format!("bounded({})", self.max_concurrent)
    }

    fn plan_units(&self, item_count: usize) -> Vec<Vec<usize>> {
        Parallel.plan_units(item_count)
    }

    fn gate(&self, item_count: usize) -> Arc<dyn Gate> {
        Parallel.gate(item_count)
    }

    fn concurrency_limit(&self) -> Option<usize> {
        Some(self.max_concurrent)
    }
}
