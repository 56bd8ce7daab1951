//! Memory of successful outcomes.
//!
//! A bounded, FIFO-evicted history of plans and diffs from runs that
//! passed, indexed by template. Retrieval is a linear scan from the most
//! recent entry backwards with word-set Jaccard similarity; at capacity
//! 100 a scan is trivial.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::DiffStats;
use crate::model::{Plan, Template};

/// Default capacity per entry kind.
pub const DEFAULT_MAX_MEMORIES: usize = 100;

/// Plan entries whose instruction similarity exceeds this are retrieved.
pub const SIMILARITY_THRESHOLD: f64 = 0.30;

/// A remembered successful plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMemory {
    pub template: Template,
    pub instruction: String,
    pub plan: Plan,
    pub stats: SuccessMetrics,
    pub stored_at: DateTime<Utc>,
    /// Short SHA-256 of the plan content, for logging and deduplication.
    pub content_hash: String,
}

/// A remembered successful diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffMemory {
    pub template: Template,
    pub plan: Plan,
    pub diff: String,
    pub stats: SuccessMetrics,
    pub stored_at: DateTime<Utc>,
    pub content_hash: String,
}

/// Success metrics carried on a memory entry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SuccessMetrics {
    pub iterations: u64,
    pub tests_passed: u32,
    pub diff_stats: Option<DiffStats>,
}

/// A retrieved hint for prompt composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Example {
    Plan {
        instruction: String,
        plan: Plan,
    },
    Diff {
        diff: String,
    },
}

/// Counts exposed by the memory-stats endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryStats {
    pub successful_plans: usize,
    pub successful_diffs: usize,
    pub max_memories: usize,
}

/// Bounded rings of successful plans and diffs.
#[derive(Debug)]
pub struct MemoryStore {
    plans: VecDeque<PlanMemory>,
    diffs: VecDeque<DiffMemory>,
    max_memories: usize,
}

impl MemoryStore {
    pub fn new(max_memories: usize) -> Self {
        Self {
            plans: VecDeque::new(),
            diffs: VecDeque::new(),
            max_memories: max_memories.max(1),
        }
    }

    /// Record a plan from a passed run. Oldest entry is evicted at capacity.
    pub fn store_successful_plan(
        &mut self,
        template: Template,
        instruction: &str,
        plan: &Plan,
        stats: SuccessMetrics,
    ) {
        let content_hash = short_hash(&format!("{instruction}{:?}", plan.plan));
        tracing::debug!(template = %template, hash = %content_hash, "storing successful plan");
        self.plans.push_back(PlanMemory {
            template,
            instruction: instruction.to_string(),
            plan: plan.clone(),
            stats,
            stored_at: Utc::now(),
            content_hash,
        });
        while self.plans.len() > self.max_memories {
            self.plans.pop_front();
        }
    }

    /// Record a diff from a passed run. Oldest entry is evicted at capacity.
    pub fn store_successful_diff(
        &mut self,
        template: Template,
        plan: &Plan,
        diff: &str,
        stats: SuccessMetrics,
    ) {
        let content_hash = short_hash(diff);
        tracing::debug!(template = %template, hash = %content_hash, "storing successful diff");
        self.diffs.push_back(DiffMemory {
            template,
            plan: plan.clone(),
            diff: diff.to_string(),
            stats,
            stored_at: Utc::now(),
            content_hash,
        });
        while self.diffs.len() > self.max_memories {
            self.diffs.pop_front();
        }
    }

    /// Retrieve up to `max_examples` hints for a new task.
    ///
    /// Plan entries matching the template whose instruction word-set
    /// Jaccard similarity exceeds 0.30 come first (most recent first);
    /// remaining slots are filled with the most recent matching diffs.
    pub fn get_similar_examples(
        &self,
        template: Template,
        instruction: &str,
        max_examples: usize,
    ) -> Vec<Example> {
        let mut examples = Vec::new();
        let target = word_set(instruction);

        for entry in self.plans.iter().rev() {
            if examples.len() >= max_examples {
                return examples;
            }
            if entry.template != template {
                continue;
            }
            let similarity = jaccard(&target, &word_set(&entry.instruction));
            if similarity > SIMILARITY_THRESHOLD {
                tracing::debug!(
                    hash = %entry.content_hash,
                    similarity,
                    "retrieved plan hint"
                );
                examples.push(Example::Plan {
                    instruction: entry.instruction.clone(),
                    plan: entry.plan.clone(),
                });
            }
        }

        for entry in self.diffs.iter().rev() {
            if examples.len() >= max_examples {
                break;
            }
            if entry.template != template {
                continue;
            }
            examples.push(Example::Diff {
                diff: entry.diff.clone(),
            });
        }

        examples
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            successful_plans: self.plans.len(),
            successful_diffs: self.diffs.len(),
            max_memories: self.max_memories,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMORIES)
    }
}

fn short_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(content.as_bytes()))[..12].to_string()
}

/// Lowercased alphanumeric word set of a text.
fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of two word sets.
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
