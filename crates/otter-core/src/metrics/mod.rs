//! Reliability accounting.
//!
//! Plain counters updated by the orchestrator at stage transitions and by
//! the agent client on each attempt. Derived ratios (success rate, average
//! iterations to pass) are computed lazily when a snapshot is taken.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::model::AgentRole;

/// Mutable counter state. Guarded by the engine; no interior locking.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    total_tasks: u64,
    successful_tasks: u64,
    failed_tasks: u64,
    total_tokens: u64,
    total_iterations: u64,
    retries_by_stage: HashMap<String, u64>,
    failure_modes: HashMap<String, u64>,
    iterations_to_pass: Vec<u64>,
    time_to_first_event_ms: Vec<u64>,
    in_flight: HashMap<String, Instant>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A run was admitted.
    pub fn task_started(&mut self, task_id: &str) {
        self.total_tasks += 1;
        self.in_flight.insert(task_id.to_string(), Instant::now());
    }

    /// The run's first event was emitted.
    pub fn first_event(&mut self, task_id: &str) {
        if let Some(started) = self.in_flight.get(task_id) {
            let ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.time_to_first_event_ms.push(ms);
        }
    }

    /// An event was emitted.
    pub fn iteration(&mut self) {
        self.total_iterations += 1;
    }

    /// The run reached a terminal state.
    pub fn task_finished(&mut self, task_id: &str, passed: bool, iterations: u64) {
        self.in_flight.remove(task_id);
        if passed {
            self.successful_tasks += 1;
            self.iterations_to_pass.push(iterations);
        } else {
            self.failed_tasks += 1;
        }
    }

    /// An agent attempt failed and will be retried.
    pub fn record_retry(&mut self, role: AgentRole) {
        *self.retries_by_stage.entry(role.to_string()).or_default() += 1;
    }

    /// Tally a failure by its mode class (`invalid_json`, `invalid_diff`,
    /// an error kind, ...).
    pub fn record_failure_mode(&mut self, mode: &str) {
        *self.failure_modes.entry(mode.to_string()).or_default() += 1;
    }

    /// Account estimated tokens spent on a completion exchange.
    pub fn add_tokens(&mut self, tokens: u64) {
        self.total_tokens += tokens;
    }

    /// Take a snapshot with derived ratios.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let success_rate = if self.total_tasks == 0 {
            0.0
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64
        };
        let avg_iterations_to_pass = mean(&self.iterations_to_pass);
        let avg_time_to_first_event_ms = mean(&self.time_to_first_event_ms);

        MetricsSnapshot {
            total_tasks: self.total_tasks,
            successful_tasks: self.successful_tasks,
            failed_tasks: self.failed_tasks,
            total_tokens: self.total_tokens,
            total_iterations: self.total_iterations,
            retries_by_stage: self.retries_by_stage.clone(),
            failure_modes: self.failure_modes.clone(),
            success_rate,
            avg_iterations_to_pass,
            avg_time_to_first_event_ms,
        }
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<u64>() as f64 / values.len() as f64
    }
}

/// Read-only counter snapshot with derived ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub total_tokens: u64,
    pub total_iterations: u64,
    pub retries_by_stage: HashMap<String, u64>,
    pub failure_modes: HashMap<String, u64>,
    pub success_rate: f64,
    pub avg_iterations_to_pass: f64,
    pub avg_time_to_first_event_ms: f64,
}
