use std::path::Path;

use serde::Serialize;

use crate::config::RecorderConfig;
use crate::fixtures::{SecretReport, count_fixture_files, secret_reports};
use crate::util::{CliOutput, display_relative};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// At or above the requested call count.
    Full,
    /// Below target but at least half of it.
    Partial,
    Shortfall,
}

impl Classification {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Shortfall => "shortfall",
        }
    }
}

#[must_use]
pub fn classify(fixtures: usize, target: usize, sufficient: usize) -> Classification {
    if fixtures >= target {
        Classification::Full
    } else if fixtures >= sufficient {
        Classification::Partial
    } else {
        Classification::Shortfall
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalSummary {
    pub fixtures: usize,
    pub secret_files: usize,
    pub secret_lines: usize,
    pub target: usize,
    pub sufficient: usize,
    pub classification: Classification,
    pub secret_reports: Vec<SecretReport>,
}

impl FinalSummary {
    #[must_use]
    pub fn headline(&self) -> String {
        match self.classification {
            Classification::Full => {
                format!("Successfully generated {} test cases", self.fixtures)
            }
            Classification::Partial => format!(
                "Generated {} of {} targeted test cases",
                self.fixtures, self.target
            ),
            Classification::Shortfall => format!(
                "Only {} test cases generated (target {})",
                self.fixtures, self.target
            ),
        }
    }
}

/// Recount the fixture directory after sanitizing. Nothing here can fail the
/// run; unreadable secret reports count as zero lines.
#[must_use]
pub fn summarize(cfg: &RecorderConfig) -> FinalSummary {
    let fixture_dir = cfg.fixture_dir_path();
    let fixtures = count_fixture_files(&fixture_dir);
    let reports = secret_reports(&fixture_dir);
    let target = cfg.target_fixture_count();
    let sufficient = cfg.sufficient_fixture_count();

    FinalSummary {
        fixtures,
        secret_files: reports.len(),
        secret_lines: reports.iter().map(|report| report.lines).sum(),
        target,
        sufficient,
        classification: classify(fixtures, target, sufficient),
        secret_reports: reports,
    }
}

pub fn report_summary(summary: &FinalSummary, project_dir: &Path, ui: &CliOutput) {
    ui.rule(Some("summary"));
    ui.info(&format!("fixtures: {}", summary.fixtures));
    ui.info(&format!("secret files: {}", summary.secret_files));
    ui.info(&format!("secret count (lines): {}", summary.secret_lines));
    for report in &summary.secret_reports {
        let shown = display_relative(project_dir, &report.path);
        match &report.unreadable {
            Some(reason) => ui.warning(&format!("  {shown} (unreadable: {reason})")),
            None => ui.info(&format!("  {shown} ({} lines)", report.lines)),
        }
    }

    match summary.classification {
        Classification::Full => ui.success(&summary.headline()),
        Classification::Partial => {
            ui.success(&summary.headline());
            ui.info(&format!(
                "{} fixtures is below the target but still enough to demonstrate the recorded behavior",
                summary.fixtures
            ));
        }
        Classification::Shortfall => {
            ui.warning(&summary.headline());
            ui.warning(
                "consider a longer --timeout, or check that the application stays healthy under load",
            );
        }
    }
}
