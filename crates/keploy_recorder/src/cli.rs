use std::path::PathBuf;

use clap::Parser;
use clap::error::ErrorKind;

use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::workflow::run_workflow;

#[derive(Debug, Default, Parser)]
#[command(
    name = "keploy_recorder",
    about = "Record Keploy fixtures against a live application, repair them, and sanitize secrets",
    version
)]
pub struct Cli {
    /// Capture wall-clock timeout (e.g. 60s, 2m, 90).
    #[arg(short = 't', long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// Number of requests to send while recording.
    #[arg(short = 'c', long, value_name = "COUNT")]
    pub calls: Option<u32>,

    /// key=value settings file applied before flags.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long = "project-dir")]
    pub project_dir: Option<PathBuf>,

    #[arg(long = "keploy-bin")]
    pub keploy_bin: Option<PathBuf>,

    /// Interpreter used to start the application (relative to project dir).
    #[arg(long)]
    pub python: Option<PathBuf>,

    /// Application entry-point file (relative to project dir).
    #[arg(long = "app-entry")]
    pub app_entry: Option<PathBuf>,

    /// Full start command; replaces `<python> <app-entry>`.
    #[arg(long = "app-command")]
    pub app_command: Option<String>,

    /// URL polled for readiness and hit for traffic.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Extra recording tags, comma-separated key=value pairs.
    #[arg(long)]
    pub metadata: Option<String>,

    #[arg(long, value_name = "DURATION")]
    pub warmup: Option<String>,

    #[arg(long, value_name = "DURATION")]
    pub grace: Option<String>,

    /// Pause between generated requests.
    #[arg(long, value_name = "DURATION")]
    pub pause: Option<String>,

    #[arg(long = "ready-attempts", value_parser = clap::value_parser!(u32).range(1..))]
    pub ready_attempts: Option<u32>,

    #[arg(long = "ready-interval", value_name = "DURATION")]
    pub ready_interval: Option<String>,

    #[arg(long = "run-root")]
    pub run_root: Option<PathBuf>,

    #[arg(long = "run-name")]
    pub run_name: Option<String>,

    /// Run keploy without sudo.
    #[arg(long)]
    pub no_sudo: bool,

    /// Do not wrap keploy record in coreutils `timeout`.
    #[arg(long)]
    pub no_timeout_wrapper: bool,

    /// Check prerequisites and print the plan without recording.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub no_evidence_ledger: bool,
}

pub fn run_from_env() -> Result<()> {
    match Cli::try_parse() {
        Ok(cli) => run(cli),
        Err(error) => handle_parse_error(&error),
    }
}

fn handle_parse_error(error: &clap::Error) -> Result<()> {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            error.print()?;
            Ok(())
        }
        _ => Err(RecorderError::Usage(error.render().to_string())),
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let cfg = RecorderConfig::resolve(&cli)?;
    run_workflow(&cfg)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use crate::error::RecorderError;

    use super::{Cli, handle_parse_error, run};

    #[test]
    fn short_flags_parse_timeout_and_calls() {
        let cli = Cli::try_parse_from(["keploy_recorder", "-t", "90s", "-c", "40"])
            .expect("short flags parse");
        assert_eq!(cli.timeout.as_deref(), Some("90s"));
        assert_eq!(cli.calls, Some(40));
    }

    #[test]
    fn unknown_flag_maps_to_usage_error_with_exit_one() {
        let error = Cli::try_parse_from(["keploy_recorder", "--bogus"])
            .expect_err("unknown flag should fail");
        match handle_parse_error(&error).expect_err("usage error") {
            RecorderError::Usage(message) => {
                assert!(message.contains("--bogus"));
                assert!(message.contains("Usage:"));
            }
            other => panic!("expected Usage, got {other}"),
        }
        assert_eq!(RecorderError::Usage(String::new()).exit_code(), 1);
    }

    #[test]
    fn help_is_not_an_error() {
        let error =
            Cli::try_parse_from(["keploy_recorder", "--help"]).expect_err("help short-circuits");
        assert!(handle_parse_error(&error).is_ok());
    }

    #[test]
    fn ready_attempts_must_be_positive() {
        assert!(Cli::try_parse_from(["keploy_recorder", "--ready-attempts", "0"]).is_err());
    }

    #[test]
    fn run_stops_at_missing_project_dir() {
        let result = run(Cli {
            project_dir: Some(PathBuf::from("/nonexistent/keploy_recorder/project")),
            keploy_bin: Some(PathBuf::from("/bin/sh")),
            no_sudo: true,
            no_timeout_wrapper: true,
            run_root: Some(std::env::temp_dir().join("keploy_recorder_cli_test")),
            ..Cli::default()
        });

        match result.expect_err("missing project dir should fail") {
            RecorderError::MissingPath { path } => {
                assert_eq!(path, PathBuf::from("/nonexistent/keploy_recorder/project"));
            }
            other => panic!("expected MissingPath, got {other}"),
        }
    }
}
