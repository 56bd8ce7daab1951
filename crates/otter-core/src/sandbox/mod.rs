//! Per-task workspace management.
//!
//! Each task run owns a hermetic directory tree seeded from a template:
//!
//! ```text
//! <sandbox_root>/<task_id>/
//!   repo/                live workspace
//!   backup/<label>_<ms>/ snapshots
//!   logs/
//!   artifacts/
//! ```
//!
//! The sandbox's security posture is allowlisted commands, execution
//! timeouts, critical-file protection in the diff engine, and
//! snapshot-based rollback around patch application.

pub mod command;
pub mod template;
pub mod validator;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diff::{self, DiffError, DiffStats};
use crate::model::{Template, TestResult};

pub use command::CommandOutput;

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to {action} {path}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no snapshot labeled {label:?}")]
    SnapshotMissing { label: String },

    #[error(transparent)]
    Patch(#[from] DiffError),
}

impl SandboxError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Sandbox construction parameters.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Process-wide root under which per-task trees live.
    pub root: PathBuf,
    /// Directory holding on-disk template trees, if any.
    pub templates_dir: Option<PathBuf>,
    /// Wall-clock limit per external command.
    pub command_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("otter"),
            templates_dir: None,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Workspace description handed to the coder agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxDescription {
    pub root: String,
    pub files: Vec<String>,
    pub template: Template,
    pub task_id: String,
}

/// A per-task filesystem workspace plus its command-execution discipline.
///
/// Owned by exactly one task run; created in the run's `starting` stage
/// and destroyed in its terminal handler.
#[derive(Debug)]
pub struct Sandbox {
    task_id: String,
    template: Template,
    task_root: PathBuf,
    repo_path: PathBuf,
    config: SandboxConfig,
    /// Last issued snapshot suffix; bumped monotonically so two snapshots
    /// in the same millisecond cannot collide.
    last_snapshot_ms: AtomicU64,
}

impl Sandbox {
    pub fn new(task_id: impl Into<String>, template: Template, config: SandboxConfig) -> Self {
        let task_id = task_id.into();
        let task_root = config.root.join(&task_id);
        let repo_path = task_root.join("repo");
        Self {
            task_id,
            template,
            task_root,
            repo_path,
            config,
            last_snapshot_ms: AtomicU64::new(0),
        }
    }

    /// Path of the live workspace.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create the directory layout, seed the template, take the
    /// `initial` snapshot.
    pub async fn prepare(&self) -> Result<(), SandboxError> {
        for sub in ["repo", "backup", "logs", "artifacts"] {
            let dir = self.task_root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| SandboxError::io("create", &dir, e))?;
        }

        template::materialize(
            self.template,
            self.config.templates_dir.as_deref(),
            &self.repo_path,
        )?;

        self.snapshot("initial").await?;
        tracing::info!(
            task_id = %self.task_id,
            template = %self.template,
            repo = %self.repo_path.display(),
            "sandbox prepared"
        );
        Ok(())
    }

    /// Recursively copy `repo/` to `backup/<label>_<ms>/`.
    pub async fn snapshot(&self, label: &str) -> Result<PathBuf, SandboxError> {
        let dest = self
            .task_root
            .join("backup")
            .join(format!("{label}_{}", self.next_snapshot_ms()));
        copy_tree(&self.repo_path, &dest)?;
        tracing::debug!(task_id = %self.task_id, label, dest = %dest.display(), "snapshot taken");
        Ok(dest)
    }

    /// Restore `repo/` from the most recent snapshot with this label.
    pub async fn restore(&self, label: &str) -> Result<(), SandboxError> {
        let backup_dir = self.task_root.join("backup");
        let prefix = format!("{label}_");

        let mut newest: Option<(u64, PathBuf)> = None;
        let entries = std::fs::read_dir(&backup_dir)
            .map_err(|e| SandboxError::io("read", &backup_dir, e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(ms) = suffix.parse::<u64>() else {
                continue;
            };
            if newest.as_ref().is_none_or(|(best, _)| ms > *best) {
                newest = Some((ms, entry.path()));
            }
        }

        let (_, source) = newest.ok_or_else(|| SandboxError::SnapshotMissing {
            label: label.to_string(),
        })?;

        if self.repo_path.exists() {
            std::fs::remove_dir_all(&self.repo_path)
                .map_err(|e| SandboxError::io("clear", &self.repo_path, e))?;
        }
        copy_tree(&source, &self.repo_path)?;
        tracing::info!(task_id = %self.task_id, label, "workspace restored from snapshot");
        Ok(())
    }

    /// Apply a unified diff with rollback.
    ///
    /// Structural validation (headers, line bound, critical files) runs
    /// before any file I/O. A `before_patch` snapshot guards application;
    /// any failure restores it before the error is returned. Success takes
    /// an `after_patch` snapshot.
    pub async fn apply_patch(&self, diff_text: &str) -> Result<DiffStats, SandboxError> {
        let parsed = diff::parse_and_validate(diff_text)?;

        self.snapshot("before_patch").await?;
        match diff::apply(&self.repo_path, &parsed) {
            Ok(stats) => {
                self.snapshot("after_patch").await?;
                tracing::info!(
                    task_id = %self.task_id,
                    files = stats.files_modified,
                    additions = stats.additions,
                    deletions = stats.deletions,
                    commit = %parsed.commit_message,
                    "patch applied"
                );
                Ok(stats)
            }
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "patch failed, rolling back");
                self.restore("before_patch").await?;
                Err(e.into())
            }
        }
    }

    /// Run the template's deterministic validator.
    pub async fn run_tests(&self) -> TestResult {
        validator::run(self.template, &self.repo_path)
    }

    /// Execute an allowlisted command inside the workspace.
    pub async fn run_command(&self, command_line: &str) -> anyhow::Result<CommandOutput> {
        command::run(command_line, &self.repo_path, self.config.command_timeout).await
    }

    /// Describe the workspace for the coder's briefing.
    pub fn describe(&self) -> SandboxDescription {
        let mut files = Vec::new();
        collect_files(&self.repo_path, &self.repo_path, &mut files);
        files.sort();
        SandboxDescription {
            root: self.repo_path.display().to_string(),
            files,
            template: self.template,
            task_id: self.task_id.clone(),
        }
    }

    /// Remove the task's entire tree.
    pub async fn cleanup(&self) -> Result<(), SandboxError> {
        if self.task_root.exists() {
            std::fs::remove_dir_all(&self.task_root)
                .map_err(|e| SandboxError::io("remove", &self.task_root, e))?;
        }
        tracing::debug!(task_id = %self.task_id, "sandbox cleaned up");
        Ok(())
    }

    fn next_snapshot_ms(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last_snapshot_ms.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_snapshot_ms.compare_exchange(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

/// Recursively copy a directory tree.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<(), SandboxError> {
    std::fs::create_dir_all(dest).map_err(|e| SandboxError::io("create", dest, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| SandboxError::io("read", src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SandboxError::io("read", src, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| SandboxError::io("stat", &from, e))?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| SandboxError::io("copy", &from, e))?;
        }
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.display().to_string());
        }
    }
}
