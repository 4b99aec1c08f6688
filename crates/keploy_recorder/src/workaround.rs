//! Keploy occasionally writes raw binary bytes into `keploy.yml`, which then
//! breaks every later command that loads it. The file is regenerated by
//! Keploy, so a corrupt copy is deleted rather than repaired.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{RecorderError, Result};
use crate::fixtures::{count_fixture_files, remove_path};
use crate::util::CliOutput;

/// ASCII control bytes other than tab, LF and CR, plus DEL.
#[must_use]
pub fn is_disallowed_control_byte(byte: u8) -> bool {
    matches!(byte, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F)
}

#[must_use]
pub fn first_disallowed_byte(bytes: &[u8]) -> Option<(usize, u8)> {
    bytes
        .iter()
        .position(|byte| is_disallowed_control_byte(*byte))
        .map(|offset| (offset, bytes[offset]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkaroundOutcome {
    Absent,
    Clean,
    Removed { offset: usize, byte: u8 },
}

impl WorkaroundOutcome {
    #[must_use]
    pub fn removed(&self) -> bool {
        matches!(self, Self::Removed { .. })
    }
}

pub fn apply_corruption_workaround(
    metadata_path: &Path,
    elevate: bool,
    ui: &CliOutput,
) -> Result<WorkaroundOutcome> {
    if !metadata_path.exists() {
        ui.info(&format!("no metadata file at {}", metadata_path.display()));
        return Ok(WorkaroundOutcome::Absent);
    }

    let bytes = fs::read(metadata_path)?;
    let Some((offset, byte)) = first_disallowed_byte(&bytes) else {
        ui.success(&format!("{} is clean", metadata_path.display()));
        return Ok(WorkaroundOutcome::Clean);
    };

    remove_path(metadata_path, elevate)?;
    ui.warning(&format!(
        "{} contained control byte 0x{byte:02X} at offset {offset}; deleted it",
        metadata_path.display()
    ));
    Ok(WorkaroundOutcome::Removed { offset, byte })
}

/// Fixtures must survive the workaround untouched.
pub fn verify_fixtures_survived(fixture_dir: &Path) -> Result<usize> {
    match count_fixture_files(fixture_dir) {
        0 => Err(RecorderError::NoFixtures {
            dir: fixture_dir.to_path_buf(),
            context: "after the corruption workaround".to_string(),
        }),
        count => Ok(count),
    }
}
