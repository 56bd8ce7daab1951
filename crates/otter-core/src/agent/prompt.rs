//! Prompt composition for the three agent roles.
//!
//! Each role has a fixed instruction template concatenated with the task
//! inputs and up to two memory hints. The hint section is fenced and
//! labeled so the model can ignore it.

use crate::memory::Example;
use crate::model::{Plan, Template, TestResult};
use crate::sandbox::SandboxDescription;

/// Render the fenced memory-hint section, or an empty string.
fn hint_section(examples: &[Example]) -> String {
    if examples.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "\n--- BEGIN PRIOR EXAMPLES (successful past outcomes, reference only) ---\n",
    );
    for example in examples {
        match example {
            Example::Plan { instruction, plan } => {
                out.push_str(&format!(
                    "Past instruction: {instruction}\nPast plan: {}\n",
                    serde_json::to_string(plan).unwrap_or_default()
                ));
            }
            Example::Diff { diff } => {
                out.push_str(&format!("Past diff:\n{diff}\n"));
            }
        }
    }
    out.push_str("--- END PRIOR EXAMPLES ---\n");
    out
}

pub fn planner(instruction: &str, template: Template, examples: &[Example]) -> String {
    format!(
        "You are the planner agent in a three-stage coding pipeline.\n\
         Break the instruction into a short ordered plan.\n\
         \n\
         Template: {template}\n\
         Instruction: {instruction}\n\
         {}\n\
         Respond with a single JSON object and nothing else, with keys:\n\
         \"plan\" (list of step strings), \"files_to_modify\" (list of paths),\n\
         \"estimated_time\" (string).",
        hint_section(examples)
    )
}

pub fn coder(
    plan: &Plan,
    template: Template,
    description: &SandboxDescription,
    examples: &[Example],
) -> String {
    format!(
        "You are the coder agent in a three-stage coding pipeline.\n\
         Implement the plan as a minimal unified diff.\n\
         \n\
         Template: {template}\n\
         Workspace root: {}\n\
         Workspace files: {}\n\
         Plan: {}\n\
         {}\n\
         Respond with only a unified diff using '--- a/<path>', '+++ b/<path>',\n\
         '@@' hunk headers and ' ', '+', '-' body lines, at most 50 lines,\n\
         ending with a line 'COMMIT: <message>'. Never delete package or\n\
         manifest files.",
        description.root,
        description.files.join(", "),
        serde_json::to_string(&plan.plan).unwrap_or_default(),
        hint_section(examples)
    )
}

pub fn tester(results: &TestResult, template: Template) -> String {
    format!(
        "You are the tester agent in a three-stage coding pipeline.\n\
         Summarize the validation results below.\n\
         \n\
         Template: {template}\n\
         Results: {}\n\
         \n\
         Respond with a single JSON object and nothing else, with keys:\n\
         \"test_summary\" (string), \"test_results\" (the results object\n\
         echoed back), \"recommendations\" (list of strings), and \"status\"\n\
         (one of \"passed\", \"failed\", \"partial\").",
        serde_json::to_string(results).unwrap_or_default()
    )
}

/// Corrective suffix appended on retry attempts.
pub fn corrective(reason: &str) -> String {
    format!("\n\nYour previous response was rejected: {reason}. Follow the output format exactly.")
}
