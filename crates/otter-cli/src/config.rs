//! Configuration for the otter binary.
//!
//! Provides a TOML config file at `~/.config/otter/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use otter_core::EngineConfig;
use otter_core::agent::{AgentConfig, CompletionService, HttpCompletionService, HttpServiceConfig};
use otter_core::sandbox::SandboxConfig;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8081;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Credential for the completion service.
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the otter config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/otter` or `~/.config/otter`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("otter");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("otter")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct OtterConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub debug: bool,
    pub host: String,
    pub port: u16,
    pub sandbox_root: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
}

impl OtterConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - API key: `OTTER_API_KEY` > `OPENAI_API_KEY` > config file; absent
    ///   means the deterministic stubs answer every agent call.
    /// - Model: `OTTER_MODEL` > config file > default.
    /// - Host/port: CLI flags > `OTTER_HOST`/`OTTER_PORT` > config file >
    ///   defaults.
    pub fn resolve(cli_host: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let file_config = load_config().ok();

        let api_key = std::env::var("OTTER_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.service.api_key.clone()))
            .filter(|k| !k.is_empty());

        let model = std::env::var("OTTER_MODEL")
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.service.model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let debug = std::env::var("OTTER_DEBUG")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        let host = cli_host
            .map(str::to_string)
            .or_else(|| std::env::var("OTTER_HOST").ok())
            .or_else(|| file_config.as_ref().and_then(|c| c.server.host.clone()))
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match cli_port {
            Some(port) => port,
            None => match std::env::var("OTTER_PORT") {
                Ok(raw) => raw
                    .parse()
                    .with_context(|| format!("OTTER_PORT is not a valid port: {raw:?}"))?,
                Err(_) => file_config
                    .as_ref()
                    .and_then(|c| c.server.port)
                    .unwrap_or(DEFAULT_PORT),
            },
        };

        let sandbox_root = std::env::var("OTTER_SANDBOX_ROOT").ok().map(PathBuf::from);
        let templates_dir = std::env::var("OTTER_TEMPLATES_DIR").ok().map(PathBuf::from);

        Ok(Self {
            api_key,
            model,
            debug,
            host,
            port,
            sandbox_root,
            templates_dir,
        })
    }

    /// Build the engine configuration this config implies.
    pub fn engine_config(&self) -> EngineConfig {
        let default_sandbox = SandboxConfig::default();
        EngineConfig {
            sandbox: SandboxConfig {
                root: self
                    .sandbox_root
                    .clone()
                    .unwrap_or(default_sandbox.root),
                templates_dir: self
                    .templates_dir
                    .clone()
                    .or_else(|| Some(PathBuf::from("templates")).filter(|p| p.is_dir())),
                command_timeout: Duration::from_secs(30),
            },
            agent: AgentConfig::default(),
            ..EngineConfig::default()
        }
    }

    /// Build the completion service, if a credential is configured.
    pub fn completion_service(&self) -> Option<Arc<dyn CompletionService>> {
        let api_key = self.api_key.as_ref()?;
        let service_config = HttpServiceConfig {
            model: self.model.clone(),
            ..HttpServiceConfig::new(api_key.clone())
        };
        Some(HttpCompletionService::shared(service_config))
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
