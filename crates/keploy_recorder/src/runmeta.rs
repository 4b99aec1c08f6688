use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::util::{append_line, write_string};

pub const POLICY_ID: &str = "keploy_recorder/v1";

/// Contents of `run_meta.json`. Written when the run directory is created and
/// rewritten once the run ends, whether it succeeded or aborted.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunMeta {
    pub status: String,
    pub stage: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub error: Option<String>,
    pub keploy_bin: String,
    pub project_dir: String,
    pub fixture_dir: String,
    pub metadata_file: String,
    pub endpoint: String,
    pub app_command: String,
    pub capture_timeout: String,
    pub calls: u32,
    pub use_sudo: bool,
    pub timeout_wrapper: bool,
    pub record_command: String,
    pub capture_outcome: Option<String>,
    pub capture_exit_code: Option<i32>,
    pub capture_duration_ms: Option<u64>,
    pub ready_attempts_used: Option<u32>,
    pub requests_succeeded: Option<u32>,
    pub requests_failed: Option<u32>,
    pub fixtures_after_capture: Option<usize>,
    pub metadata_removed: Option<bool>,
    pub fixtures_after_workaround: Option<usize>,
    pub sanitize_duration_ms: Option<u64>,
    pub fixtures: Option<usize>,
    pub secret_files: Option<usize>,
    pub secret_lines: Option<usize>,
    pub classification: Option<String>,
    pub run_dir: String,
    pub record_log: String,
    pub sanitize_log: String,
    pub trace_id: Option<String>,
    pub policy_id: Option<String>,
    pub evidence_ledger: Option<String>,
    pub fastapi_output_mode: Option<String>,
    pub fastapi_agent_mode: Option<bool>,
    pub sqlmodel_output_mode: Option<String>,
    pub sqlmodel_agent_mode: Option<bool>,
}

impl RunMeta {
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_string(path, &content)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&content)?)
    }
}

/// One line of `evidence_ledger.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: String,
    pub trace_id: String,
    pub decision_id: String,
    pub action: String,
    pub evidence_terms: Vec<String>,
    pub fallback_active: bool,
    pub fallback_reason: Option<String>,
    pub policy_id: String,
}

impl DecisionRecord {
    pub fn append_jsonl(&self, path: &Path) -> Result<()> {
        let line = serde_json::to_string(self)?;
        append_line(path, &line)
    }
}
