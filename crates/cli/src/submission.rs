#![forbid(unsafe_code)]

//! Submission file format: a JSON array (or single object) of task specs
//! mirroring the `add_task` input surface.

use kl_core::model::VerificationHook;
use kl_storage::NewTask;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct SubmissionTask {
    pub prompt: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub verification_hooks: Vec<VerificationHook>,
    #[serde(default = "default_auto_verify")]
    pub auto_verify: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

fn default_auto_verify() -> bool {
    true
}

impl From<SubmissionTask> for NewTask {
    fn from(value: SubmissionTask) -> Self {
        NewTask {
            prompt: value.prompt,
            working_dir: value.working_dir,
            context_files: value.context_files,
            expected_outputs: value.expected_outputs,
            verification_hooks: value.verification_hooks,
            auto_verify: value.auto_verify,
            metadata: value.metadata,
            priority: value.priority,
            job_id: value.job_id,
            parent_task_id: value.parent_task_id,
            depends_on: value.depends_on,
        }
    }
}

pub(crate) fn parse_submission(text: &str) -> Result<Vec<SubmissionTask>, String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value(item).map_err(|e| format!("task #{}: {e}", i + 1))
            })
            .collect(),
        object @ serde_json::Value::Object(_) => serde_json::from_value(object)
            .map(|task| vec![task])
            .map_err(|e| format!("task: {e}")),
        _ => Err("expected a JSON object or array of objects".to_string()),
    }
}
