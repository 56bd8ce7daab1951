mod config;
mod run_cmd;
mod serve_cmd;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use otter_core::Engine;
use otter_core::model::Template;

use config::OtterConfig;

#[derive(Parser)]
#[command(name = "otter", about = "Deterministic multi-agent coding task orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and event stream
    Serve {
        /// Bind host (overrides OTTER_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides OTTER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Drive a single task to completion and print its events
    Run {
        /// Workspace template: react, express, flask, or generic
        #[arg(long)]
        template: String,
        /// The coding instruction
        #[arg(long)]
        instruction: String,
        /// Task id (defaults to a generated one)
        #[arg(long)]
        task_id: Option<String>,
        /// Model hint forwarded with the task
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let config = OtterConfig::resolve(host.as_deref(), port)?;
            init_tracing(config.debug);
            let engine = build_engine(&config);
            serve_cmd::run_serve(engine, &config.host, config.port).await
        }
        Commands::Run {
            template,
            instruction,
            task_id,
            model,
        } => {
            let config = OtterConfig::resolve(None, None)?;
            init_tracing(config.debug);
            let template: Template = template
                .parse()
                .with_context(|| format!("unknown template {template:?}"))?;
            let engine = build_engine(&config);
            run_cmd::run_task(&engine, template, instruction, task_id, model).await
        }
    }
}

fn build_engine(config: &OtterConfig) -> Engine {
    let service = config.completion_service();
    if service.is_none() {
        tracing::warn!("no completion-service credential; agents run on deterministic stubs");
    }
    Engine::new(config.engine_config(), service)
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "otter=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
