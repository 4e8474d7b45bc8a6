#![forbid(unsafe_code)]

//! Assembly of the effective prompt sent to the executor CLI.

use kl_storage::TaskRow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Upper bound on inlined context-file content. Everything past the budget
/// is cut with a marker rather than silently dropped.
pub(crate) const CONTEXT_FILE_BUDGET: usize = 16 * 1024;

pub(crate) const CONTEXT_PREAMBLE: &str = "Project Conventions (follow these):";

/// Builds the prompt: shared-context preamble, inlined context files
/// (bounded), the task prompt, then the expected outputs. Unreadable
/// context files become warnings, never errors.
pub(crate) fn build_prompt(
    task: &TaskRow,
    shared: &BTreeMap<String, String>,
    working_dir: &Path,
) -> (String, Vec<String>) {
    let mut out = String::new();
    let mut warnings = Vec::new();

    if !shared.is_empty() {
        out.push_str(CONTEXT_PREAMBLE);
        out.push('\n');
        for (key, value) in shared {
            out.push_str(&format!("- {key}: {value}\n"));
        }
        out.push('\n');
    }

    if !task.context_files.is_empty() {
        let mut remaining = CONTEXT_FILE_BUDGET;
        out.push_str("Context files to review:\n");
        for raw in &task.context_files {
            let path = resolve(working_dir, raw);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    out.push_str(&format!("--- {raw} ---\n"));
                    if remaining == 0 {
                        out.push_str("… (context budget exhausted)\n");
                        continue;
                    }
                    let chars = content.chars().count();
                    if chars <= remaining {
                        remaining -= chars;
                        out.push_str(&content);
                    } else {
                        out.extend(content.chars().take(remaining));
                        out.push_str("\n… (truncated)");
                        remaining = 0;
                    }
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                Err(err) => {
                    warnings.push(format!("context file {raw} unreadable: {err}"));
                }
            }
        }
        out.push('\n');
    }

    out.push_str("Task:\n");
    out.push_str(&task.prompt);
    out.push('\n');

    if !task.expected_outputs.is_empty() {
        out.push_str("\nExpected outputs:\n");
        for path in &task.expected_outputs {
            out.push_str(&format!("- {path}\n"));
        }
    }

    (out, warnings)
}

pub(crate) fn resolve(working_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}
