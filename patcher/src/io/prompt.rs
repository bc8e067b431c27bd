//! Agent instructions: the `AGENTS.md` file and the short command-line prompt.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::ReferenceDiff;

/// Instruction file written at the workspace root.
pub const INSTRUCTIONS_FILE: &str = "AGENTS.md";

const INSTRUCTIONS_TEMPLATE: &str = include_str!("prompts/agents.md");
const PROMPT_TEMPLATE: &str = include_str!("prompts/prompt.txt");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("instructions", INSTRUCTIONS_TEMPLATE)
        .expect("instructions template should be valid");
    env.add_template("prompt", PROMPT_TEMPLATE)
        .expect("prompt template should be valid");
    env
});

#[derive(Debug, Clone, Serialize)]
struct PovContext {
    path: String,
    crash_log: String,
}

#[derive(Debug, Clone, Serialize)]
struct DiffContext<'a> {
    text: &'a str,
    changed_files: &'a [String],
}

/// Everything the instruction file mentions.
#[derive(Debug, Clone)]
pub struct InstructionInputs<'a> {
    /// `(POV path, crash log path)` in POV order.
    pub povs: &'a [(PathBuf, PathBuf)],
    pub harness: &'a str,
    pub patches_dir: &'a Path,
    pub session_dir: &'a Path,
    pub language: &'a str,
    pub sanitizer: &'a str,
    pub builder: &'a str,
    pub framework_bin: &'a str,
    pub reference_diff: Option<&'a ReferenceDiff>,
}

pub fn render_instructions(input: &InstructionInputs<'_>) -> Result<String> {
    let povs: Vec<PovContext> = input
        .povs
        .iter()
        .map(|(pov, log)| PovContext {
            path: pov.display().to_string(),
            crash_log: log.display().to_string(),
        })
        .collect();
    let reference_diff = input.reference_diff.map(|diff| DiffContext {
        text: diff.text.trim_end(),
        changed_files: &diff.changed_files,
    });
    let template = ENGINE.get_template("instructions")?;
    let rendered = template.render(context! {
        povs => povs,
        harness => input.harness,
        patches_dir => input.patches_dir.display().to_string(),
        session_dir => input.session_dir.display().to_string(),
        language => input.language,
        sanitizer => input.sanitizer,
        builder => input.builder,
        framework_bin => input.framework_bin,
        reference_diff => reference_diff,
    })?;
    Ok(rendered)
}

/// One-line prompt passed on the agent command line.
pub fn render_prompt(pov_count: usize, session_dir: &Path) -> Result<String> {
    let template = ENGINE.get_template("prompt")?;
    let rendered = template.render(context! {
        pov_count => pov_count,
        session_dir => session_dir.display().to_string(),
        instructions_file => INSTRUCTIONS_FILE,
    })?;
    Ok(rendered.trim().to_string())
}
