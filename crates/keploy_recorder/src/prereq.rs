use std::process::{Command, Stdio};

use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::util::{CliOutput, display_relative, ensure_executable, ensure_exists, require_command};

/// Check every path and wrapper command the run depends on, stopping at the
/// first one missing. Nothing on disk is touched.
pub fn check_prerequisites(cfg: &RecorderConfig, ui: &CliOutput) -> Result<()> {
    ensure_executable(&cfg.keploy_bin)?;
    ui.success(&format!("keploy: {}", cfg.keploy_bin.display()));

    ensure_exists(&cfg.project_dir)?;
    if !cfg.project_dir.is_dir() {
        return Err(RecorderError::invalid(format!(
            "project dir is not a directory: {}",
            cfg.project_dir.display()
        )));
    }
    ui.success(&format!("project: {}", cfg.project_dir.display()));

    // A custom start command owns its own interpreter and entry point.
    if cfg.app_command.as_deref().is_none_or(|command| command.trim().is_empty()) {
        let entry = cfg.app_entry_path();
        ensure_exists(&entry)?;
        if !entry.is_file() {
            return Err(RecorderError::invalid(format!(
                "app entry is not a file: {}",
                entry.display()
            )));
        }
        ui.success(&format!(
            "app entry: {}",
            display_relative(&cfg.project_dir, &entry)
        ));

        let python = cfg.python_path();
        ensure_executable(&python)?;
        ui.success(&format!(
            "interpreter: {}",
            display_relative(&cfg.project_dir, &python)
        ));
    }

    if cfg.use_sudo {
        require_command("sudo")?;
    }
    if cfg.timeout_wrapper {
        require_command("timeout")?;
    }
    Ok(())
}

/// Prompt for sudo credentials up front. The capture child runs in its own
/// process group without a terminal, so it relies on a cached timestamp.
pub fn refresh_sudo_credentials(ui: &CliOutput) -> Result<()> {
    ui.info("validating sudo credentials");
    let status = Command::new("sudo")
        .arg("-v")
        .stdin(Stdio::inherit())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(RecorderError::exit(
            1,
            "sudo could not validate credentials; rerun with --no-sudo if elevation is not needed",
        ))
    }
}
