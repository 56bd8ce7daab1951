//! One-shot local pipeline runs.
//!
//! Drives a single task to its terminal state without the HTTP edge,
//! printing the event stream as it arrives. Useful for smoke-testing a
//! template or a prompt change from the shell.

use std::time::Duration;

use anyhow::{Result, bail};
use uuid::Uuid;

use otter_core::Engine;
use otter_core::model::{TaskRequest, TaskState, Template};

/// Ceiling for a single local run; generous next to the per-command 30 s
/// sandbox timeout and the agent retry sleeps.
const RUN_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn run_task(
    engine: &Engine,
    template: Template,
    instruction: String,
    task_id: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let task_id = task_id.unwrap_or_else(|| {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("cli-{}", &suffix[..8])
    });

    let mut rx = engine.subscribe();
    let run = engine.submit(TaskRequest {
        task_id: task_id.clone(),
        template,
        instruction,
        model,
    })?;

    println!("run {} ({} / {})", run.run_id, run.task_id, run.template);

    let deadline = tokio::time::Instant::now() + RUN_TIMEOUT;
    let terminal = loop {
        let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => bail!("event stream closed before the run finished"),
            Err(_) => bail!("run {task_id} did not finish within {RUN_TIMEOUT:?}"),
        };
        if event.task_id != task_id {
            continue;
        }
        println!("[{:>2}] {:<12} {}", event.iteration, event.stage.to_string(), event.message);
        if event.stage.is_terminal() {
            break event.stage;
        }
    };

    match terminal {
        TaskState::Done => Ok(()),
        _ => {
            let error = engine
                .query(&task_id)
                .and_then(|q| q.events.last().cloned())
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("run failed: {error}");
        }
    }
}
