//! The agent client.
//!
//! Converts prompt templates plus structured inputs into validated
//! structured outputs, shielding the orchestrator from vendor failure
//! modes: invalid JSON and invalid diffs are retried with a corrective
//! prompt, vendor errors are retried as-is, and after `max_retries`
//! attempts the client falls back to the deterministic stub for the role.
//! Agent calls therefore never fail the pipeline.

pub mod prompt;
pub mod provider;
pub mod stub;

use std::sync::Arc;
use std::time::Duration;

use crate::diff;
use crate::memory::Example;
use crate::model::{AgentRole, Plan, Template, TestReport, TestResult};
use crate::sandbox::SandboxDescription;

pub use provider::{CompletionService, HttpCompletionService, HttpServiceConfig};

/// Tunables for the agent client.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Attempts per role before the stub fallback.
    pub max_retries: u32,
    /// Sleep between attempts.
    pub retry_delay: Duration,
    pub plan_max_tokens: u32,
    pub code_max_tokens: u32,
    pub test_max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            plan_max_tokens: 500,
            code_max_tokens: 1000,
            test_max_tokens: 500,
        }
    }
}

/// Result of one agent call, with its accounting.
#[derive(Debug, Clone)]
pub struct AgentOutcome<T> {
    pub artifact: T,
    /// Failed attempts before success or fallback.
    pub retries: u32,
    /// Failure mode per failed attempt (`invalid_json`, `invalid_diff`,
    /// `vendor_error`).
    pub failure_modes: Vec<String>,
    /// True when the deterministic stub was used.
    pub used_stub: bool,
    /// Rough token estimate for all prompt/response traffic.
    pub estimated_tokens: u64,
}

/// Client for the three pipeline roles.
///
/// With no completion service configured the client goes straight to the
/// stubs, which keeps the pipeline fully deterministic.
pub struct AgentClient {
    service: Option<Arc<dyn CompletionService>>,
    config: AgentConfig,
}

impl AgentClient {
    pub fn new(service: Option<Arc<dyn CompletionService>>, config: AgentConfig) -> Self {
        Self { service, config }
    }

    /// A client that always answers with the deterministic stubs.
    pub fn stub_only() -> Self {
        Self::new(None, AgentConfig::default())
    }

    /// Ask the planner for a [`Plan`].
    pub async fn call_planner(
        &self,
        instruction: &str,
        template: Template,
        task_id: &str,
        examples: &[Example],
    ) -> AgentOutcome<Plan> {
        let base_prompt = prompt::planner(instruction, template, examples);
        self.call_with_retries(
            AgentRole::Planner,
            task_id,
            base_prompt,
            self.config.plan_max_tokens,
            parse_plan,
            || stub::plan(template),
        )
        .await
    }

    /// Ask the coder for a unified diff.
    pub async fn call_coder(
        &self,
        plan: &Plan,
        template: Template,
        task_id: &str,
        description: &SandboxDescription,
        examples: &[Example],
    ) -> AgentOutcome<String> {
        let base_prompt = prompt::coder(plan, template, description, examples);
        self.call_with_retries(
            AgentRole::Coder,
            task_id,
            base_prompt,
            self.config.code_max_tokens,
            parse_diff,
            || stub::diff(template),
        )
        .await
    }

    /// Ask the tester for a [`TestReport`].
    ///
    /// The fallback is the tester stub, which derives its status from the
    /// actual results.
    pub async fn call_tester(
        &self,
        results: &TestResult,
        template: Template,
        task_id: &str,
    ) -> AgentOutcome<TestReport> {
        let base_prompt = prompt::tester(results, template);
        self.call_with_retries(
            AgentRole::Tester,
            task_id,
            base_prompt,
            self.config.test_max_tokens,
            parse_report,
            || stub::report(results),
        )
        .await
    }

    /// Shared retry loop: attempt, validate, sleep, correct, fall back.
    async fn call_with_retries<T>(
        &self,
        role: AgentRole,
        task_id: &str,
        base_prompt: String,
        max_tokens: u32,
        validate: impl Fn(&str) -> Result<T, String>,
        fallback: impl FnOnce() -> T,
    ) -> AgentOutcome<T> {
        let mut retries = 0u32;
        let mut failure_modes = Vec::new();
        let mut estimated_tokens = 0u64;
        let mut corrective: Option<String> = None;

        if let Some(service) = &self.service {
            for attempt in 1..=self.config.max_retries {
                let prompt = match &corrective {
                    Some(suffix) => format!("{base_prompt}{suffix}"),
                    None => base_prompt.clone(),
                };
                estimated_tokens += estimate_tokens(&prompt);

                let failure = match service.complete(&prompt, max_tokens).await {
                    Ok(response) => {
                        estimated_tokens += estimate_tokens(&response);
                        match validate(&response) {
                            Ok(artifact) => {
                                tracing::debug!(
                                    task_id,
                                    role = %role,
                                    attempt,
                                    "agent produced a valid artifact"
                                );
                                return AgentOutcome {
                                    artifact,
                                    retries,
                                    failure_modes,
                                    used_stub: false,
                                    estimated_tokens,
                                };
                            }
                            Err(mode) => mode,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(task_id, role = %role, attempt, error = %e, "vendor call failed");
                        "vendor_error".to_string()
                    }
                };

                tracing::warn!(
                    task_id,
                    role = %role,
                    attempt,
                    failure_mode = %failure,
                    "agent attempt rejected"
                );
                corrective = Some(prompt::corrective(&failure));
                failure_modes.push(failure);
                retries += 1;

                if attempt < self.config.max_retries {
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }

        tracing::info!(task_id, role = %role, retries, "falling back to deterministic stub");
        AgentOutcome {
            artifact: fallback(),
            retries,
            failure_modes,
            used_stub: true,
            estimated_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Output validation
// ---------------------------------------------------------------------------

fn parse_plan(response: &str) -> Result<Plan, String> {
    parse_json_object(response).ok_or_else(|| "invalid_json".to_string())
}

fn parse_report(response: &str) -> Result<TestReport, String> {
    parse_json_object(response).ok_or_else(|| "invalid_json".to_string())
}

fn parse_diff(response: &str) -> Result<String, String> {
    let text = strip_code_fences(response);
    match diff::parse_and_validate(&text) {
        Ok(_) => Ok(text),
        Err(_) => Err("invalid_diff".to_string()),
    }
}

/// Parse a response as a JSON object of type `T`.
///
/// A whole-body parse is tried first; on failure the first brace-matched
/// `{ ... }` substring is extracted and parsed once more.
fn parse_json_object<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    let trimmed = response.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let candidate = extract_json(trimmed)?;
    serde_json::from_str(candidate).ok()
}

/// Extract the first balanced `{ ... }` substring, respecting strings and
/// escapes.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strip a surrounding Markdown code fence, if present.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the info string ("diff", "json", ...) on the opening fence.
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        if let Some(inner) = body.strip_suffix("```") {
            return inner.trim_end_matches(' ').to_string();
        }
    }
    trimmed.to_string()
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}
