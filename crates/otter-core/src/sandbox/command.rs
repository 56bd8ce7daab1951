//! Allowlisted, time-bounded command execution.
//!
//! Every external command a sandbox runs goes through here. The allowlist
//! is matched on the base command, with a narrow widening for a fixed set
//! of `git` verbs. Each invocation gets a wall-clock timeout; on expiry the
//! whole process group is killed and the result is flagged `killed`.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::model::TestResult;

/// Base commands a sandbox may execute.
pub const ALLOWED_COMMANDS: &[&str] = &["npm", "pytest", "node", "python"];

/// `git` verbs the allowlist is widened to.
pub const ALLOWED_GIT_VERBS: &[&str] =
    &["status", "log", "show", "add", "commit", "init", "config"];

/// Output bytes retained per stream (the tail).
pub const OUTPUT_CAP_BYTES: usize = 2048;

/// Captured result of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process died to a signal.
    pub exit_code: i32,
    pub duration_ms: u64,
    /// True when the command hit its timeout and was killed.
    pub killed: bool,
}

impl CommandOutput {
    /// Refusal result for a command that failed the allowlist.
    pub fn disallowed(command_line: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("command not allowed: {command_line}"),
            exit_code: 1,
            duration_ms: 0,
            killed: false,
        }
    }

    /// Fold this output into a [`TestResult`] with the given counts.
    pub fn into_test_result(self, passed: u32, failed: u32) -> TestResult {
        TestResult {
            passed,
            failed,
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code: self.exit_code,
            duration_ms: self.duration_ms,
            killed: self.killed,
        }
    }
}

/// Check a command line against the allowlist.
///
/// The base command must be one of [`ALLOWED_COMMANDS`], or `git` followed
/// by a verb from [`ALLOWED_GIT_VERBS`].
pub fn is_allowed(command_line: &str) -> bool {
    let mut parts = command_line.split_whitespace();
    let Some(base) = parts.next() else {
        return false;
    };
    if ALLOWED_COMMANDS.contains(&base) {
        return true;
    }
    if base == "git" {
        return parts
            .next()
            .is_some_and(|verb| ALLOWED_GIT_VERBS.contains(&verb));
    }
    false
}

/// Keep only the trailing `cap` bytes of `s`, on a char boundary.
pub fn truncate_tail(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut start = s.len() - cap;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Run an allowlisted command in `cwd` with a wall-clock timeout.
///
/// The caller is expected to have checked [`is_allowed`] first; this
/// function refuses disallowed commands as well, returning the same
/// exit-code-1 result rather than spawning.
///
/// On timeout the process group is killed (so runaway children of the
/// command die with it) and `killed` is set in the output.
pub async fn run(command_line: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutput> {
    if !is_allowed(command_line) {
        return Ok(CommandOutput::disallowed(command_line));
    }

    let mut parts = command_line.split_whitespace();
    let program = parts.next().context("empty command line")?;
    let args: Vec<&str> = parts.collect();

    let start = Instant::now();
    let mut command = Command::new(program);
    command
        .args(&args)
        .current_dir(cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    // Give the child its own process group so a timeout kill reaches any
    // grandchildren too.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command {command_line:?}"))?;

    let child_pid = child.id();

    // Take the pipe handles so we can read them concurrently with waiting.
    // Reading while waiting avoids deadlock when the child fills a pipe.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    match tokio::time::timeout(timeout, async {
        let (wait_result, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
        (wait_result, stdout, stderr)
    })
    .await
    {
        Ok((Ok(status), stdout, stderr)) => Ok(CommandOutput {
            stdout: truncate_tail(&stdout, OUTPUT_CAP_BYTES),
            stderr: truncate_tail(&stderr, OUTPUT_CAP_BYTES),
            exit_code: status.code().unwrap_or(-1),
            duration_ms: elapsed_ms(start),
            killed: false,
        }),
        Ok((Err(e), _, _)) => {
            Err(e).with_context(|| format!("failed to wait on command {command_line:?}"))
        }
        Err(_elapsed) => {
            kill_process_group(child_pid);
            let _ = child.kill().await;
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!(
                    "command {command_line:?} timed out after {}s",
                    timeout.as_secs()
                ),
                exit_code: -1,
                duration_ms: elapsed_ms(start),
                killed: true,
            })
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Kill the process group rooted at `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // Negative pid targets the whole group.
        let ret = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        if ret != 0 {
            tracing::debug!(pid, "process group kill failed (already gone?)");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {
    // Child::kill handles the direct child; grandchildren are on their own.
}
