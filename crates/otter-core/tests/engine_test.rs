//! End-to-end pipeline tests with the deterministic stub agents.

use std::time::Duration;

use otter_core::model::{TaskEvent, TaskRequest, TaskState, Template, TestResult};
use otter_core::sandbox::SandboxConfig;
use otter_core::{Engine, EngineConfig};

// ===========================================================================
// Test harness
// ===========================================================================

struct TestHarness {
    _sandbox_dir: tempfile::TempDir,
    engine: Engine,
}

impl TestHarness {
    fn stub_only() -> Self {
        let sandbox_dir = tempfile::TempDir::new().expect("failed to create sandbox dir");
        let config = EngineConfig {
            sandbox: SandboxConfig {
                root: sandbox_dir.path().to_path_buf(),
                templates_dir: None,
                command_timeout: Duration::from_secs(5),
            },
            ..EngineConfig::default()
        };
        Self {
            _sandbox_dir: sandbox_dir,
            engine: Engine::new(config, None),
        }
    }
}

fn request(task_id: &str, template: Template, instruction: &str) -> TaskRequest {
    TaskRequest {
        task_id: task_id.to_string(),
        template,
        instruction: instruction.to_string(),
        model: None,
    }
}

async fn run_to_terminal(engine: &Engine, req: TaskRequest) -> (TaskState, Vec<TaskEvent>) {
    let task_id = req.task_id.clone();
    engine.submit(req).expect("submission should be admitted");
    let state = engine
        .wait_for_terminal(&task_id, Duration::from_secs(15))
        .await
        .expect("run should reach a terminal state");
    settle(engine, &task_id).await;
    let events = engine
        .query(&task_id)
        .expect("task should be known")
        .events;
    (state, events)
}

/// The terminal event is broadcast before the run's teardown finishes;
/// wait until the record has left the active set so post-run assertions
/// (metrics, memory, active list) see final state.
async fn settle(engine: &Engine, task_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let active = engine
            .query(task_id)
            .map(|q| q.task.is_some())
            .unwrap_or(false);
        if !active {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {task_id} did not settle after its terminal event"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn event_with_stage<'a>(events: &'a [TaskEvent], stage: TaskState) -> Vec<&'a TaskEvent> {
    events.iter().filter(|e| e.stage == stage).collect()
}

fn stage_index(stage: TaskState) -> usize {
    match stage {
        TaskState::Starting => 0,
        TaskState::Planning => 1,
        TaskState::Coding => 2,
        TaskState::DiffApplied => 3,
        TaskState::Testing => 4,
        TaskState::TestReport => 5,
        TaskState::Done | TaskState::Failed => 6,
    }
}

/// Assert the per-run event invariants: gapless iterations from zero, a
/// prefix-respecting stage order, and nothing after the terminal event.
fn assert_event_invariants(events: &[TaskEvent]) {
    assert!(!events.is_empty(), "a run must emit events");
    for (i, event) in events.iter().enumerate() {
        assert_eq!(
            event.iteration, i as u64,
            "iterations must be 0,1,2,... with no gaps"
        );
    }
    for pair in events.windows(2) {
        assert!(
            stage_index(pair[0].stage) <= stage_index(pair[1].stage),
            "stage order violated: {} then {}",
            pair[0].stage,
            pair[1].stage
        );
        assert!(
            !pair[0].stage.is_terminal(),
            "no event may follow a terminal event"
        );
    }
    let run_id = events[0].run_id;
    assert!(
        events.iter().all(|e| e.run_id == run_id),
        "one run, one run_id"
    );
}

// ===========================================================================
// Happy paths
// ===========================================================================

#[tokio::test]
async fn react_divide_by_zero_happy_path() {
    let harness = TestHarness::stub_only();
    let (state, events) = run_to_terminal(
        &harness.engine,
        request(
            "t1",
            Template::React,
            "Add division function with divide-by-zero guard",
        ),
    )
    .await;

    assert_eq!(state, TaskState::Done);
    assert_event_invariants(&events);

    // The report passed.
    let report_events = event_with_stage(&events, TaskState::TestReport);
    let report = report_events
        .last()
        .and_then(|e| e.data.get("test_report"))
        .expect("final test_report event should embed the report");
    assert_eq!(report["status"], "passed");

    // The validator saw divide plus guard in the patched workspace.
    let testing = event_with_stage(&events, TaskState::Testing);
    let results: TestResult = serde_json::from_value(
        testing
            .last()
            .and_then(|e| e.data.get("test_results"))
            .expect("testing event should embed results")
            .clone(),
    )
    .unwrap();
    assert_eq!(results.failed, 0);
    assert_eq!(results.passed, 3);

    // Exactly one plan and one diff were absorbed into memory.
    let memory = harness.engine.memory_stats();
    assert_eq!(memory.successful_plans, 1);
    assert_eq!(memory.successful_diffs, 1);
}

#[tokio::test]
async fn express_healthz_happy_path() {
    let harness = TestHarness::stub_only();
    let (state, events) = run_to_terminal(
        &harness.engine,
        request("t2", Template::Express, "Add /healthz endpoint"),
    )
    .await;

    assert_eq!(state, TaskState::Done);
    assert_event_invariants(&events);

    // The applied diff introduced the /healthz route with a healthy body;
    // the validator confirms both markers landed in src/app.js.
    let coding = event_with_stage(&events, TaskState::Coding);
    let diff = coding
        .last()
        .and_then(|e| e.data.get("diff"))
        .and_then(|d| d.as_str())
        .expect("coding event should embed the diff");
    assert!(diff.contains("/healthz"));
    assert!(diff.contains("healthy"));

    let testing = event_with_stage(&events, TaskState::Testing);
    let results = testing.last().unwrap().data.get("test_results").unwrap();
    assert_eq!(results["failed"], 0);
}

#[tokio::test]
async fn flask_sum_happy_path() {
    let harness = TestHarness::stub_only();
    let (state, events) = run_to_terminal(
        &harness.engine,
        request("t3", Template::Flask, "Add /sum endpoint"),
    )
    .await;

    assert_eq!(state, TaskState::Done);
    let coding = event_with_stage(&events, TaskState::Coding);
    let diff = coding
        .last()
        .and_then(|e| e.data.get("diff"))
        .and_then(|d| d.as_str())
        .unwrap();
    assert!(diff.contains("/sum"));

    let testing = event_with_stage(&events, TaskState::Testing);
    assert_eq!(testing.last().unwrap().data["test_results"]["failed"], 0);
}

#[tokio::test]
async fn every_known_template_passes_on_the_stub_pipeline() {
    for (i, template) in [
        Template::React,
        Template::Express,
        Template::Flask,
        Template::Generic,
    ]
    .into_iter()
    .enumerate()
    {
        let harness = TestHarness::stub_only();
        let (state, events) = run_to_terminal(
            &harness.engine,
            request(&format!("stub-{i}"), template, "exercise the stubs"),
        )
        .await;
        assert_eq!(state, TaskState::Done, "{template} should reach done");
        let report = event_with_stage(&events, TaskState::TestReport);
        assert_eq!(
            report.last().unwrap().data["test_report"]["status"],
            "passed",
            "{template} stub pipeline should pass"
        );
    }
}

// ===========================================================================
// Run bookkeeping
// ===========================================================================

#[tokio::test]
async fn canonical_stage_sequence_for_a_done_run() {
    let harness = TestHarness::stub_only();
    let (_, events) = run_to_terminal(
        &harness.engine,
        request("seq", Template::Generic, "walk the stages"),
    )
    .await;

    let stages: Vec<TaskState> = events.iter().map(|e| e.stage).collect();
    let expected = [
        TaskState::Starting,
        TaskState::Starting,
        TaskState::Planning,
        TaskState::Planning,
        TaskState::Coding,
        TaskState::Coding,
        TaskState::DiffApplied,
        TaskState::Testing,
        TaskState::Testing,
        TaskState::TestReport,
        TaskState::TestReport,
        TaskState::Done,
    ];
    assert_eq!(stages, expected);
}

#[tokio::test]
async fn finished_runs_leave_the_active_set_but_keep_events() {
    let harness = TestHarness::stub_only();
    let (_, events) = run_to_terminal(
        &harness.engine,
        request("gone", Template::Generic, "finish and vanish"),
    )
    .await;

    assert!(harness.engine.list_tasks().is_empty());
    let query = harness.engine.query("gone").expect("events are retained");
    assert!(query.task.is_none(), "run record is dropped at terminal");
    assert_eq!(query.events.len(), events.len());
}

#[tokio::test]
async fn unknown_task_ids_query_as_none() {
    let harness = TestHarness::stub_only();
    assert!(harness.engine.query("never-submitted").is_none());
}

#[tokio::test]
async fn metrics_reflect_completed_runs() {
    let harness = TestHarness::stub_only();
    run_to_terminal(
        &harness.engine,
        request("m1", Template::React, "Add division function"),
    )
    .await;

    let metrics = harness.engine.metrics();
    assert_eq!(metrics.total_tasks, 1);
    assert_eq!(metrics.successful_tasks, 1);
    assert_eq!(metrics.failed_tasks, 0);
    assert_eq!(metrics.success_rate, 1.0);
    assert!(metrics.total_iterations >= 12);
}

#[tokio::test]
async fn memory_hints_seed_subsequent_similar_runs() {
    let harness = TestHarness::stub_only();
    run_to_terminal(
        &harness.engine,
        request(
            "seed",
            Template::React,
            "Add division function with divide-by-zero guard",
        ),
    )
    .await;

    // A near-identical instruction sees the stored plan as a hint.
    let (_, events) = run_to_terminal(
        &harness.engine,
        request(
            "reuse",
            Template::React,
            "Add division function with zero guard",
        ),
    )
    .await;
    let planning = event_with_stage(&events, TaskState::Planning);
    let hints = planning.first().unwrap().data["memory_hints"]
        .as_u64()
        .unwrap();
    assert!(hints >= 1, "expected at least one memory hint, got {hints}");
}

// ===========================================================================
// Ordering under concurrency
// ===========================================================================

#[tokio::test]
async fn parallel_runs_keep_per_run_event_order() {
    let harness = TestHarness::stub_only();
    let mut rx = harness.engine.subscribe();

    harness
        .engine
        .submit(request("t5a", Template::React, "Add division function"))
        .unwrap();
    harness
        .engine
        .submit(request("t5b", Template::Flask, "Add /sum endpoint"))
        .unwrap();

    let mut a_events = Vec::new();
    let mut b_events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !(a_events.iter().any(|e: &TaskEvent| e.stage.is_terminal())
        && b_events.iter().any(|e: &TaskEvent| e.stage.is_terminal()))
    {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("both runs should finish in time")
            .expect("bus should stay open");
        match event.task_id.as_str() {
            "t5a" => a_events.push(event),
            "t5b" => b_events.push(event),
            other => panic!("unexpected task id {other}"),
        }
    }

    assert_event_invariants(&a_events);
    assert_event_invariants(&b_events);
    assert_ne!(a_events[0].run_id, b_events[0].run_id);
}
