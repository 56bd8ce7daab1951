//! The orchestration engine.
//!
//! Owns the shared state (active runs, event logs, quarantine, memory,
//! metrics), admits task submissions, and drives each admitted run through
//! the stage pipeline on its own tokio task. Every transition emits one
//! event; the run's owning task is the only writer to its record, so
//! per-run event ordering needs no cross-task coordination. Shared maps
//! are guarded by mutexes that are never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::agent::{AgentClient, AgentConfig, AgentOutcome, CompletionService};
use crate::events::EventBus;
use crate::memory::{MemoryStats, MemoryStore, SuccessMetrics};
use crate::metrics::{MetricsSnapshot, MetricsTracker};
use crate::model::{
    AgentRole, FailureSignature, ReportStatus, TaskEvent, TaskRequest, TaskRun, TaskState,
};
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::state::TaskStateMachine;

/// Failures a signature accumulates before admission rejects it.
pub const DEFAULT_QUARANTINE_THRESHOLD: u32 = 2;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sandbox: SandboxConfig,
    pub agent: AgentConfig,
    pub max_memories: usize,
    pub quarantine_threshold: u32,
    pub bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            agent: AgentConfig::default(),
            max_memories: crate::memory::DEFAULT_MAX_MEMORIES,
            quarantine_threshold: DEFAULT_QUARANTINE_THRESHOLD,
            bus_capacity: crate::events::DEFAULT_BUS_CAPACITY,
        }
    }
}

/// Admission-time rejections. Surface as 4xx to API callers.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("quarantined")]
    Quarantined,

    #[error("task {task_id} is already active")]
    DuplicateTask { task_id: String },
}

/// Answer to a task query: the live run (if still active) and its events.
#[derive(Debug, Clone)]
pub struct TaskQuery {
    pub task: Option<TaskRun>,
    pub events: Vec<TaskEvent>,
}

/// The orchestration engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    client: AgentClient,
    bus: EventBus,
    memory: Mutex<MemoryStore>,
    metrics: Mutex<MetricsTracker>,
    active: Mutex<HashMap<String, TaskRun>>,
    events: Mutex<HashMap<String, Vec<TaskEvent>>>,
    quarantine: Mutex<HashMap<FailureSignature, u32>>,
}

impl Engine {
    pub fn new(config: EngineConfig, service: Option<Arc<dyn CompletionService>>) -> Self {
        let client = AgentClient::new(service, config.agent.clone());
        let bus = EventBus::new(config.bus_capacity);
        let memory = MemoryStore::new(config.max_memories);
        Self {
            inner: Arc::new(EngineInner {
                config,
                client,
                bus,
                memory: Mutex::new(memory),
                metrics: Mutex::new(MetricsTracker::new()),
                active: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                quarantine: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admit a task and spawn its run.
    ///
    /// Rejects quarantined signatures and duplicate active task ids. On
    /// success the run record is returned immediately; the pipeline runs
    /// on its own tokio task.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskRun, AdmissionError> {
        let signature = FailureSignature::new(request.template, &request.instruction);
        {
            let quarantine = self.inner.quarantine.lock().unwrap_or_else(|e| e.into_inner());
            let strikes = quarantine.get(&signature).copied().unwrap_or(0);
            if strikes >= self.inner.config.quarantine_threshold {
                tracing::warn!(
                    task_id = %request.task_id,
                    signature = %signature,
                    strikes,
                    "admission rejected: quarantined"
                );
                return Err(AdmissionError::Quarantined);
            }
        }

        let run = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(&request.task_id) {
                return Err(AdmissionError::DuplicateTask {
                    task_id: request.task_id.clone(),
                });
            }
            let run = TaskRun::new(&request);
            active.insert(request.task_id.clone(), run.clone());
            run
        };

        self.inner
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .task_started(&run.task_id);

        tracing::info!(
            task_id = %run.task_id,
            run_id = %run.run_id,
            template = %run.template,
            model_hint = request.model.as_deref().unwrap_or("default"),
            "task admitted"
        );

        let engine = self.clone();
        let spawned_run = run.clone();
        tokio::spawn(async move {
            engine.execute(spawned_run, request).await;
        });

        Ok(run)
    }

    /// Attach an event-stream subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.bus.subscribe()
    }

    /// Look up a task by id: its live run (if active) and retained events.
    ///
    /// Returns `None` for ids this process has never seen.
    pub fn query(&self, task_id: &str) -> Option<TaskQuery> {
        let task = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned();
        let events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned();
        match (task, events) {
            (None, None) => None,
            (task, events) => Some(TaskQuery {
                task,
                events: events.unwrap_or_default(),
            }),
        }
    }

    /// Snapshot of all currently active runs.
    pub fn list_tasks(&self) -> Vec<TaskRun> {
        let mut tasks: Vec<TaskRun> = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        tasks
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner
            .memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
    }

    /// Wait until the task's run reaches a terminal state.
    ///
    /// Returns the terminal state, or `None` on timeout.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Option<TaskState> {
        // Subscribe first so no event can slip between the check and the
        // listen loop.
        let mut rx = self.subscribe();

        if let Some(query) = self.query(task_id) {
            if let Some(event) = query.events.iter().rev().find(|e| e.stage.is_terminal()) {
                return Some(event.stage);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv()).await;
            match event {
                Ok(Ok(event)) => {
                    if event.task_id == task_id && event.stage.is_terminal() {
                        return Some(event.stage);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    // Fall back to the retained log after a lag.
                    if let Some(query) = self.query(task_id) {
                        if let Some(event) =
                            query.events.iter().rev().find(|e| e.stage.is_terminal())
                        {
                            return Some(event.stage);
                        }
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Run execution
    // -----------------------------------------------------------------------

    /// Drive one run to a terminal state, then tear down.
    async fn execute(&self, mut run: TaskRun, request: TaskRequest) {
        let sandbox = Sandbox::new(
            run.task_id.clone(),
            run.template,
            self.inner.config.sandbox.clone(),
        );

        let outcome = self.drive_stages(&mut run, &sandbox).await;

        match outcome {
            Ok(passed) => {
                self.inner
                    .metrics
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .task_finished(&run.task_id, passed, run.iteration);
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::error!(
                    task_id = %run.task_id,
                    run_id = %run.run_id,
                    error = %message,
                    "task failed"
                );
                run.error = Some(message.clone());
                if TaskStateMachine::transition(&mut run, TaskState::Failed).is_ok() {
                    self.record_failure(&request);
                    self.emit(
                        &mut run,
                        TaskState::Failed,
                        &format!("Task failed: {message}"),
                        json!({ "error": message }),
                    );
                }
                self.inner
                    .metrics
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .task_finished(&run.task_id, false, run.iteration);
            }
        }

        // Teardown always runs: destroy the sandbox, drop the active entry.
        if let Err(e) = sandbox.cleanup().await {
            tracing::warn!(task_id = %run.task_id, error = %e, "sandbox cleanup failed");
        }
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run.task_id);
    }

    /// The staged pipeline. Returns whether the final report passed.
    async fn drive_stages(&self, run: &mut TaskRun, sandbox: &Sandbox) -> Result<bool> {
        let template = run.template;
        let task_id = run.task_id.clone();

        // starting
        let started_data = json!({
            "template": template,
            "instruction": &run.instruction,
        });
        self.emit(run, TaskState::Starting, "Task execution started", started_data);

        sandbox
            .prepare()
            .await
            .context("failed to prepare sandbox")?;
        let description = sandbox.describe();
        self.emit(
            run,
            TaskState::Starting,
            "Sandbox prepared",
            serde_json::to_value(&description).unwrap_or_default(),
        );

        // planning
        let examples = {
            let memory = self.inner.memory.lock().unwrap_or_else(|e| e.into_inner());
            memory.get_similar_examples(template, &run.instruction, 2)
        };

        TaskStateMachine::transition(run, TaskState::Planning)?;
        run.current_agent = Some(AgentRole::Planner);
        self.emit(
            run,
            TaskState::Planning,
            "Planner agent is analyzing the task",
            json!({ "agent": AgentRole::Planner, "memory_hints": examples.len() }),
        );

        let planner_outcome = self
            .inner
            .client
            .call_planner(&run.instruction, template, &task_id, &examples)
            .await;
        self.record_agent_outcome(AgentRole::Planner, &planner_outcome);
        let plan = planner_outcome.artifact;
        self.emit(
            run,
            TaskState::Planning,
            "Planning completed",
            json!({ "plan": &plan, "used_stub": planner_outcome.used_stub }),
        );

        // coding
        TaskStateMachine::transition(run, TaskState::Coding)?;
        run.current_agent = Some(AgentRole::Coder);
        self.emit(
            run,
            TaskState::Coding,
            "Coder agent is implementing changes",
            json!({ "agent": AgentRole::Coder }),
        );

        let coder_outcome = self
            .inner
            .client
            .call_coder(&plan, template, &task_id, &description, &examples)
            .await;
        self.record_agent_outcome(AgentRole::Coder, &coder_outcome);
        let diff_text = coder_outcome.artifact;
        self.emit(
            run,
            TaskState::Coding,
            "Code changes generated",
            json!({ "diff": &diff_text, "used_stub": coder_outcome.used_stub }),
        );

        // diff_applied -- apply failures are fatal for the run; the
        // sandbox has already rolled back by the time the error surfaces.
        let stats = sandbox
            .apply_patch(&diff_text)
            .await
            .context("failed to apply diff")?;
        TaskStateMachine::transition(run, TaskState::DiffApplied)?;
        run.current_agent = None;
        self.emit(
            run,
            TaskState::DiffApplied,
            "Code changes applied to workspace",
            json!({ "stats": stats }),
        );

        // testing
        TaskStateMachine::transition(run, TaskState::Testing)?;
        run.current_agent = Some(AgentRole::Tester);
        self.emit(
            run,
            TaskState::Testing,
            "Running deterministic validation",
            json!({ "agent": AgentRole::Tester }),
        );

        let test_results = sandbox.run_tests().await;
        self.emit(
            run,
            TaskState::Testing,
            "Validation completed",
            json!({ "test_results": &test_results }),
        );

        // test_report
        TaskStateMachine::transition(run, TaskState::TestReport)?;
        self.emit(
            run,
            TaskState::TestReport,
            "Generating test report",
            json!({ "agent": AgentRole::Tester }),
        );

        let tester_outcome = self
            .inner
            .client
            .call_tester(&test_results, template, &task_id)
            .await;
        self.record_agent_outcome(AgentRole::Tester, &tester_outcome);
        let report = tester_outcome.artifact;
        self.emit(
            run,
            TaskState::TestReport,
            "Test report generated",
            json!({ "test_report": &report, "used_stub": tester_outcome.used_stub }),
        );

        // done
        TaskStateMachine::transition(run, TaskState::Done)?;
        run.current_agent = None;
        let passed = report.status == ReportStatus::Passed;
        self.emit(
            run,
            TaskState::Done,
            "Task completed",
            json!({
                "status": report.status,
                "plan": &plan,
                "stats": stats,
            }),
        );

        // A passed run seeds future prompts.
        if passed {
            let success = SuccessMetrics {
                iterations: run.iteration,
                tests_passed: test_results.passed,
                diff_stats: Some(stats),
            };
            let mut memory = self.inner.memory.lock().unwrap_or_else(|e| e.into_inner());
            memory.store_successful_plan(template, &run.instruction, &plan, success);
            memory.store_successful_diff(template, &plan, &diff_text, success);
        }

        Ok(passed)
    }

    /// Emit one event: bump the run's counter, mirror the run into the
    /// active map, append to the retained log, broadcast.
    fn emit(&self, run: &mut TaskRun, stage: TaskState, message: &str, data: serde_json::Value) {
        let event = TaskEvent {
            task_id: run.task_id.clone(),
            run_id: run.run_id,
            iteration: run.iteration,
            stage,
            timestamp: Utc::now(),
            message: message.to_string(),
            data,
        };
        run.iteration += 1;

        {
            let mut metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
            if event.iteration == 0 {
                metrics.first_event(&run.task_id);
            }
            metrics.iteration();
        }
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = active.get_mut(&run.task_id) {
                *record = run.clone();
            }
        }
        {
            let mut events = self.inner.events.lock().unwrap_or_else(|e| e.into_inner());
            events
                .entry(run.task_id.clone())
                .or_default()
                .push(event.clone());
        }

        tracing::debug!(
            task_id = %event.task_id,
            run_id = %event.run_id,
            iteration = event.iteration,
            stage = %event.stage,
            "{}",
            event.message
        );
        self.inner.bus.publish(event);
    }

    fn record_agent_outcome<T>(&self, role: AgentRole, outcome: &AgentOutcome<T>) {
        let mut metrics = self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..outcome.retries {
            metrics.record_retry(role);
        }
        for mode in &outcome.failure_modes {
            metrics.record_failure_mode(mode);
        }
        metrics.add_tokens(outcome.estimated_tokens);
    }

    /// Attribute a failed run to its signature and bump the quarantine
    /// counter.
    fn record_failure(&self, request: &TaskRequest) {
        let signature = FailureSignature::new(request.template, &request.instruction);
        let mut quarantine = self.inner.quarantine.lock().unwrap_or_else(|e| e.into_inner());
        let strikes = quarantine.entry(signature.clone()).or_insert(0);
        *strikes += 1;
        tracing::warn!(
            signature = %signature,
            strikes = *strikes,
            "failure recorded against signature"
        );
    }
}
