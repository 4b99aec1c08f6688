use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::capture::{command_from_argv, render_command_line, sanitize_argv};
use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::fixtures::{SecretReport, secret_reports};
use crate::util::{CliOutput, display_relative};

#[derive(Debug, Clone, Serialize)]
pub struct SanitizeReport {
    pub duration_ms: u64,
    pub secret_reports: Vec<SecretReport>,
}

impl SanitizeReport {
    #[must_use]
    pub fn secret_lines(&self) -> usize {
        self.secret_reports.iter().map(|report| report.lines).sum()
    }
}

/// Run `keploy sanitize` from the project directory, where Keploy finds the
/// fixture tree. Only a zero exit status counts as success; the secret
/// reports are inspected afterwards.
pub fn run_sanitize(
    cfg: &RecorderConfig,
    log_path: &Path,
    ui: &CliOutput,
) -> Result<SanitizeReport> {
    let argv = sanitize_argv(cfg);
    ui.info(&format!("sanitizing: {}", render_command_line(&argv)));

    let started = Instant::now();
    let status = command_from_argv(&argv, &cfg.project_dir, log_path)?.status()?;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    if !status.success() {
        ui.error(&format!("keploy sanitize failed after {duration_ms}ms"));
        return Err(RecorderError::SanitizeFailed {
            exit_code: status.code().unwrap_or(1),
            log: log_path.to_path_buf(),
        });
    }
    ui.success(&format!("keploy sanitize finished in {duration_ms}ms"));

    let reports = secret_reports(&cfg.fixture_dir_path());
    if reports.is_empty() {
        ui.warning(
            "no secret report produced: either no secrets were detected or detection did not run",
        );
    }
    for report in &reports {
        let shown = display_relative(&cfg.project_dir, &report.path);
        match &report.unreadable {
            Some(reason) => ui.warning(&format!("{shown}: could not count lines ({reason})")),
            None => ui.info(&format!(
                "{shown}: ~{} sensitive values ({} lines)",
                report.lines, report.lines
            )),
        }
    }

    Ok(SanitizeReport {
        duration_ms,
        secret_reports: reports,
    })
}
