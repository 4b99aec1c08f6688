use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::fixtures::{find_secret_reports, remove_path};
use crate::util::CliOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CleanOutcome {
    Absent,
    Removed { leftover_secret_reports: usize },
}

/// Delete the fixture directory left by a previous run. A missing directory
/// is not an error, so repeated calls converge on "absent".
pub fn clean_fixture_dir(dir: &Path, elevate: bool, ui: &CliOutput) -> Result<CleanOutcome> {
    if !dir.exists() {
        ui.info(&format!("no previous fixtures at {}", dir.display()));
        return Ok(CleanOutcome::Absent);
    }

    let leftover = find_secret_reports(dir).len();
    if leftover > 0 {
        ui.info(&format!(
            "previous run left {leftover} secret report file(s); removing with the fixtures"
        ));
    } else {
        ui.info("previous run left no secret report files");
    }

    remove_path(dir, elevate)?;
    ui.success(&format!("removed stale fixtures: {}", dir.display()));

    Ok(CleanOutcome::Removed {
        leftover_secret_reports: leftover,
    })
}
