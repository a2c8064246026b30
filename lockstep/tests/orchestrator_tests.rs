//! End-to-end pipeline runs.
//!
//! Timing tests run on tokio's paused clock: every `sleep` completes in
//! virtual time, so one work unit of 1s costs nothing in wall-clock terms.

use async_trait::async_trait;
use lockstep::pipeline::{
    ExecutionPlan, ItemTask, PipelineEvent, PipelineMetrics, PipelineOrchestrator, RunOptions,
    SimulatedWork, StageSpec,
};
use lockstep::{LockstepError, LockstepResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const UNIT: Duration = Duration::from_secs(1);
const UNIT_MS: u128 = 1000;
/// Timer rounding adds up to a millisecond per sleep.
const SLACK_MS: u128 = 100;

fn items() -> Vec<char> {
    ('1'..='7').collect()
}

fn plan(stages: Vec<StageSpec>) -> ExecutionPlan {
    ExecutionPlan::new(stages)
}

fn seq_seq_par_seq() -> ExecutionPlan {
    plan(vec![
        StageSpec::sequential("A"),
        StageSpec::sequential("B"),
        StageSpec::parallel("C"),
        StageSpec::sequential("D").terminal(),
    ])
}

fn all_sequential() -> ExecutionPlan {
    plan(vec![
        StageSpec::sequential("A"),
        StageSpec::sequential("B"),
        StageSpec::sequential("C"),
        StageSpec::sequential("D").terminal(),
    ])
}

fn seq_par_par_seq() -> ExecutionPlan {
    plan(vec![
        StageSpec::sequential("A"),
        StageSpec::parallel("B"),
        StageSpec::parallel("C"),
        StageSpec::sequential("D").terminal(),
    ])
}

fn build(plan: &ExecutionPlan, work: Arc<dyn ItemTask<char>>) -> PipelineOrchestrator<char> {
    PipelineOrchestrator::build(plan, items(), work, RunOptions::new()).unwrap()
}

fn simulated() -> Arc<dyn ItemTask<char>> {
    Arc::new(SimulatedWork::new(UNIT))
}

/// Downstream item k never starts before upstream item k finished.
fn assert_cross_stage_order(metrics: &PipelineMetrics) {
    for pair in metrics.stages.windows(2) {
        let (upstream, downstream) = (&pair[0], &pair[1]);
        for item in &downstream.items {
            let released = upstream.item(item.index).unwrap().finished;
            assert!(
                item.started >= released,
                "{} started item {} at {:?} before {} finished it at {:?}",
                downstream.id,
                item.index,
                item.started,
                upstream.id,
                released
            );
        }
    }
}

/// Sequential stages never overlap items and process them in index order.
fn assert_sequential_order(metrics: &PipelineMetrics) {
    for stage in metrics.stages.iter().filter(|s| s.mode == "sequential") {
        for pair in stage.items.windows(2) {
            assert!(
                pair[1].started >= pair[0].finished,
                "{} overlapped items {} and {}",
                stage.id,
                pair[0].index,
                pair[1].index
            );
        }
    }
}

/// The terminal stage starts only after every other stage finished everything.
fn assert_barrier(metrics: &PipelineMetrics) {
    let (terminal, rest) = metrics.stages.split_last().unwrap();
    assert!(terminal.terminal);

    let (first_start, _) = terminal.span().unwrap();
    for stage in rest {
        let (_, last_finish) = stage.span().unwrap();
        assert!(first_start >= last_finish, "{} still running at barrier", stage.id);
    }
}

fn assert_all_properties(metrics: &PipelineMetrics) {
    for stage in &metrics.stages {
        assert_eq!(stage.items.len(), 7, "{} skipped items", stage.id);
    }
    assert_cross_stage_order(metrics);
    assert_sequential_order(metrics);
    assert_barrier(metrics);
}

fn assert_reference_timing(metrics: &PipelineMetrics) {
    let total = metrics.total_duration_ms;
    assert!(
        (16 * UNIT_MS..16 * UNIT_MS + SLACK_MS).contains(&total),
        "total {total}ms"
    );

    let terminal = metrics.stage("D").unwrap();
    assert!(
        (7 * UNIT_MS..7 * UNIT_MS + SLACK_MS).contains(&terminal.duration_ms),
        "terminal span {}ms",
        terminal.duration_ms
    );
}

// ============================================================================
// Reference scenario
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reference_scenario_seq_seq_par_seq() {
    let metrics = build(&seq_seq_par_seq(), simulated()).run().await.unwrap();

    assert_all_properties(&metrics);
    assert_reference_timing(&metrics);

    // C picks up item k as soon as B hands it over.
    let (b, c) = (metrics.stage("B").unwrap(), metrics.stage("C").unwrap());
    for item in &c.items {
        let handoff = item.started - b.item(item.index).unwrap().finished;
        assert!(handoff < Duration::from_millis(10), "item {} waited {handoff:?}", item.index);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reference_scenario_all_sequential() {
    let metrics = build(&all_sequential(), simulated()).run().await.unwrap();

    assert_all_properties(&metrics);
    assert_reference_timing(&metrics);
}

#[tokio::test(start_paused = true)]
async fn test_reference_scenario_seq_par_par_seq() {
    let metrics = build(&seq_par_par_seq(), simulated()).run().await.unwrap();

    assert_all_properties(&metrics);
    assert_reference_timing(&metrics);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_head_feeds_sequential_tail() {
    let plan = plan(vec![
        StageSpec::parallel("A"),
        StageSpec::sequential("B"),
        StageSpec::bounded("C", 2),
        StageSpec::parallel("D").terminal(),
    ]);
    let metrics = build(&plan, simulated()).run().await.unwrap();

    assert_all_properties(&metrics);
    // A: 1 unit, B: 7 units behind it, C trails B by one unit, D: 1 unit.
    let total = metrics.total_duration_ms;
    assert!((10 * UNIT_MS..10 * UNIT_MS + SLACK_MS).contains(&total), "total {total}ms");
}

// ============================================================================
// Monitoring and work function
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_monitor_reports_intermediate_stages_then_aggregation() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipeline = build(&seq_seq_par_seq(), simulated()).with_monitor(tx);

    pipeline.run().await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            PipelineEvent::StageCompleted {
                index: 1,
                stage: "B".into()
            },
            PipelineEvent::StageCompleted {
                index: 2,
                stage: "C".into()
            },
            PipelineEvent::AggregationCompleted {
                index: 3,
                stage: "D".into()
            },
        ]
    );
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, usize, char)>>,
}

#[async_trait]
impl ItemTask<char> for Recorder {
    async fn run(&self, stage: &str, index: usize, item: &char) -> LockstepResult<()> {
        self.seen.lock().push((stage.to_string(), index, *item));
        tokio::time::sleep(UNIT).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_stage_sees_every_item() {
    let recorder = Arc::new(Recorder::default());
    build(&seq_par_par_seq(), recorder.clone()).run().await.unwrap();

    let seen = recorder.seen.lock();
    assert_eq!(seen.len(), 4 * 7);

    let terminal: Vec<char> = seen
        .iter()
        .filter(|(stage, _, _)| stage == "D")
        .map(|(_, _, item)| *item)
        .collect();
    assert_eq!(terminal, items());

    for (_, index, item) in seen.iter() {
        assert_eq!(items()[*index], *item);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stage_completion_is_idempotent_after_run() {
    let pipeline = build(&seq_seq_par_seq(), simulated());
    let metrics = pipeline.run().await.unwrap();

    for stage in pipeline.stages() {
        assert!(stage.is_complete());
        let again = tokio::time::timeout(Duration::ZERO, stage.await_completion())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(&again), metrics.stage(stage.id()));
    }
}

// ============================================================================
// Failure, timeout and cancellation
// ============================================================================

/// Fails one (stage, item) pair and stalls forever on another.
struct Faulty {
    fail: Option<(&'static str, usize)>,
    stall: Option<(&'static str, usize)>,
}

#[async_trait]
impl ItemTask<char> for Faulty {
    async fn run(&self, stage: &str, index: usize, _item: &char) -> LockstepResult<()> {
        if self.stall == Some((stage, index)) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(UNIT).await;
        if self.fail == Some((stage, index)) {
            return Err(LockstepError::Internal("checksum mismatch".into()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "faulty"
    }
}

#[tokio::test(start_paused = true)]
async fn test_work_failure_surfaces_root_cause() {
    let work = Arc::new(Faulty {
        fail: Some(("B", 3)),
        stall: None,
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipeline = build(&seq_seq_par_seq(), work).with_monitor(tx);

    let err = pipeline.run().await.unwrap_err();
    match err {
        LockstepError::WorkItemFailure { stage, item, reason } => {
            assert_eq!(stage, "B");
            assert_eq!(item, 3);
            assert!(reason.contains("checksum mismatch"));
        }
        other => panic!("expected WorkItemFailure, got {other:?}"),
    }

    assert!(pipeline.is_cancelled());
    assert!(rx.try_recv().is_err(), "no stage should report completion");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stage_times_out() {
    let work = Arc::new(Faulty {
        fail: None,
        stall: Some(("C", 2)),
    });
    let timeout = Duration::from_secs(30);
    let pipeline = PipelineOrchestrator::build(
        &seq_seq_par_seq(),
        items(),
        work,
        RunOptions::new().with_stage_timeout(timeout),
    )
    .unwrap();

    let err = pipeline.run().await.unwrap_err();
    assert_eq!(
        err,
        LockstepError::DeadlockTimeout {
            stage: "C".into(),
            item: Some(2),
            timeout,
        }
    );
    assert!(pipeline.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_run() {
    let pipeline = build(&all_sequential(), simulated());

    let cancel = async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        pipeline.cancel();
    };
    let (result, ()) = tokio::join!(pipeline.run(), cancel);

    let err = result.unwrap_err();
    assert!(err.is_cancelled(), "expected cancellation, got {err:?}");
}

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn test_build_rejects_invalid_plans() {
    let no_terminal = plan(vec![StageSpec::sequential("A"), StageSpec::parallel("B")]);
    let result = PipelineOrchestrator::build(&no_terminal, items(), simulated(), RunOptions::new());
    assert!(matches!(result, Err(LockstepError::InvalidConfiguration(_))));

    let result = PipelineOrchestrator::build(
        &seq_seq_par_seq(),
        Vec::<char>::new(),
        simulated(),
        RunOptions::new(),
    );
    assert!(matches!(result, Err(LockstepError::InvalidConfiguration(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_stages_overlap_in_real_time() {
    let plan = plan(vec![
        StageSpec::parallel("A"),
        StageSpec::parallel("B").terminal(),
    ]);
    let items: Vec<char> = ('a'..='h').collect();
    let work = Arc::new(SimulatedWork::new(Duration::from_millis(100)));
    let pipeline = PipelineOrchestrator::build(&plan, items, work, RunOptions::new()).unwrap();

    let metrics = pipeline.run().await.unwrap();

    // Sequential execution would take 1600ms.
    assert!(metrics.total_duration_ms >= 200);
    assert!(metrics.total_duration_ms < 800, "total {}ms", metrics.total_duration_ms);
}
