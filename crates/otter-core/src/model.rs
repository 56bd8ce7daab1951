//! Core data model: task runs, events, agent artifacts.
//!
//! Everything that crosses a component boundary is an explicit struct or
//! enum here, serde-derived with snake_case wire names so event payloads
//! and API responses share one vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Stage of a task run's state machine.
///
/// `Done` and `Failed` are terminal; a run never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Starting,
    Planning,
    Coding,
    DiffApplied,
    Testing,
    TestReport,
    Done,
    Failed,
}

impl TaskState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::DiffApplied => "diff_applied",
            Self::Testing => "testing",
            Self::TestReport => "test_report",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "planning" => Ok(Self::Planning),
            "coding" => Ok(Self::Coding),
            "diff_applied" => Ok(Self::DiffApplied),
            "testing" => Ok(Self::Testing),
            "test_report" => Ok(Self::TestReport),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// Workspace template a task runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    React,
    Express,
    Flask,
    Generic,
}

impl Template {
    /// Directory name of the template's on-disk tree.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::React => "react",
            Self::Express => "express",
            Self::Flask => "flask",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Template {
    type Err = TemplateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "react" => Ok(Self::React),
            "express" => Ok(Self::Express),
            "flask" => Ok(Self::Flask),
            "generic" => Ok(Self::Generic),
            other => Err(TemplateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Template`] string.
#[derive(Debug, Clone)]
pub struct TemplateParseError(pub String);

impl fmt::Display for TemplateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid template: {:?}", self.0)
    }
}

impl std::error::Error for TemplateParseError {}

// ---------------------------------------------------------------------------

/// The agent role active at a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Coder,
    Tester,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Tester => "tester",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task submission and run record
// ---------------------------------------------------------------------------

/// A client's request to run one coding task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Opaque client-chosen identifier. At most one active run per id.
    pub task_id: String,
    pub template: Template,
    /// Free-text coding instruction.
    pub instruction: String,
    /// Optional model override for the completion service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The execution record of one orchestration attempt.
///
/// Mutated only by the tokio task that owns the run; readers get clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    /// Globally unique, assigned at admission.
    pub run_id: Uuid,
    pub template: Template,
    pub instruction: String,
    pub state: TaskState,
    /// Monotonically increasing event counter, starts at 0.
    pub iteration: u64,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<AgentRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRun {
    /// Create a fresh run record in the `starting` state.
    pub fn new(request: &TaskRequest) -> Self {
        Self {
            task_id: request.task_id.clone(),
            run_id: Uuid::new_v4(),
            template: request.template,
            instruction: request.instruction.clone(),
            state: TaskState::Starting,
            iteration: 0,
            start_time: Utc::now(),
            current_agent: None,
            error: None,
        }
    }
}

/// One entry in a run's totally ordered event sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub run_id: Uuid,
    /// Strictly increasing within a run, no gaps, starts at 0.
    pub iteration: u64,
    pub stage: TaskState,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Open payload: the produced artifact, sandbox description, etc.
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Agent artifacts
// ---------------------------------------------------------------------------

/// Planner output: the ordered step list for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Ordered sequence of step descriptions.
    pub plan: Vec<String>,
    pub files_to_modify: Vec<String>,
    /// Human-readable estimate, e.g. "5 minutes".
    pub estimated_time: String,
}

/// Result of running the sandbox's deterministic validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: u32,
    pub failed: u32,
    /// Captured output, truncated to the last 2 KiB.
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// True when the validating command hit its wall-clock timeout.
    pub killed: bool,
}

impl TestResult {
    pub fn total(&self) -> u32 {
        self.passed + self.failed
    }
}

/// Tester verdict over a [`TestResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Passed,
    Failed,
    Partial,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Tester output: summary, embedded results, recommendations, verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub test_summary: String,
    pub test_results: TestResult,
    pub recommendations: Vec<String>,
    pub status: ReportStatus,
}

// ---------------------------------------------------------------------------
// Failure signatures
// ---------------------------------------------------------------------------

/// Quarantine key: a template plus a short hash of the instruction.
///
/// Two runs with the same signature that both fail put the signature in
/// quarantine; further admissions matching it are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureSignature {
    pub template: Template,
    /// First 8 hex chars of the SHA-256 of the instruction.
    pub instruction_hash: String,
}

impl FailureSignature {
    pub fn new(template: Template, instruction: &str) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(instruction.as_bytes());
        Self {
            template,
            instruction_hash: hex::encode(digest)[..8].to_string(),
        }
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.template, self.instruction_hash)
    }
}
