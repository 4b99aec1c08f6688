//! Discovery of the artifacts Keploy leaves in the fixture directory.
//!
//! Keploy nests its output (`keploy/<test-set>/tests/test-N.yaml`,
//! `keploy/<test-set>/secret.yaml`), so every lookup walks the whole tree.
//! Nothing here parses file contents.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::error::{RecorderError, Result};

const YAML_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

fn has_yaml_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| YAML_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// `test-*.yaml`: one recorded HTTP exchange.
#[must_use]
pub fn is_fixture_file(path: &Path) -> bool {
    file_name(path).is_some_and(|name| name.starts_with("test-")) && has_yaml_extension(path)
}

/// YAML files whose name mentions `secret` and that are not fixtures.
#[must_use]
pub fn is_secret_report(path: &Path) -> bool {
    file_name(path).is_some_and(|name| name.to_ascii_lowercase().contains("secret"))
        && has_yaml_extension(path)
        && !is_fixture_file(path)
}

/// Collect all regular files in a directory (recursive). Unreadable
/// directories are skipped.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        // Symlinks are never followed.
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_files(&entry.path(), out);
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
}

fn find_matching(dir: &Path, predicate: fn(&Path) -> bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_files(dir, &mut files);
    files.retain(|path| predicate(path));
    files.sort();
    files
}

#[must_use]
pub fn find_fixture_files(dir: &Path) -> Vec<PathBuf> {
    find_matching(dir, is_fixture_file)
}

#[must_use]
pub fn count_fixture_files(dir: &Path) -> usize {
    find_fixture_files(dir).len()
}

#[must_use]
pub fn find_secret_reports(dir: &Path) -> Vec<PathBuf> {
    find_matching(dir, is_secret_report)
}

pub fn count_lines(path: &Path) -> Result<usize> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut count = 0_usize;
    for line in reader.split(b'\n') {
        line?;
        count += 1;
    }
    Ok(count)
}

/// One secret report and its line count. Lines approximate the number of
/// redacted values; the report format is not parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretReport {
    pub path: PathBuf,
    pub lines: usize,
    /// Why the report could not be read; `lines` is 0 in that case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unreadable: Option<String>,
}

/// Reports are informational, so a file that cannot be read (root-owned,
/// removed mid-scan) is kept with zero lines instead of failing the run.
#[must_use]
pub fn secret_reports(dir: &Path) -> Vec<SecretReport> {
    reports_for(find_secret_reports(dir))
}

fn reports_for(paths: Vec<PathBuf>) -> Vec<SecretReport> {
    paths
        .into_iter()
        .map(|path| match count_lines(&path) {
            Ok(lines) => SecretReport {
                path,
                lines,
                unreadable: None,
            },
            Err(error) => SecretReport {
                path,
                lines: 0,
                unreadable: Some(error.to_string()),
            },
        })
        .collect()
}

/// Remove a file or directory tree. Keploy runs elevated, so its output is
/// usually root-owned; with `elevate` a permission failure is retried
/// through `sudo -n rm -rf`.
pub fn remove_path(path: &Path, elevate: bool) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied && elevate => {
            let status = Command::new("sudo")
                .arg("-n")
                .arg("rm")
                .arg("-rf")
                .arg("--")
                .arg(path)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?;
            if status.success() {
                Ok(())
            } else {
                Err(RecorderError::exit(
                    1,
                    format!("sudo rm -rf {} failed", path.display()),
                ))
            }
        }
        Err(error) => Err(RecorderError::Io(error)),
    }
}
