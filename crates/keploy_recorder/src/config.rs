use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::error::{RecorderError, Result};
use crate::util::{duration_literal, parse_duration_value, resolve_under, shell_single_quote};

/// Per-request bound for generated traffic.
pub const TRAFFIC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request bound for readiness polls.
pub const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Slack granted to the external `timeout` wrapper before the recorder's own
/// bound terminates the capture process tree.
pub const WRAPPER_SLACK: Duration = Duration::from_secs(15);

/// `key=value` settings loaded from a `--config` file.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub values: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                RecorderError::MissingPath {
                    path: path.to_path_buf(),
                }
            } else {
                RecorderError::Io(error)
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            values: parse_config_content(&content),
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|raw| {
            let value = raw.trim().to_ascii_lowercase();
            matches!(value.as_str(), "1" | "true" | "yes" | "on")
        })
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<u32>().map_err(|_| {
                    RecorderError::invalid(format!(
                        "{}: {key} must be a non-negative integer, got {raw:?}",
                        self.path.display()
                    ))
                })
            })
            .transpose()
    }

    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>> {
        self.get(key).map(parse_duration_value).transpose()
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }
}

#[must_use]
pub fn parse_config_content(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim().to_string();
        let mut value = value_raw.trim().to_string();

        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }

        values.insert(key, value);
    }

    values
}

/// Fully resolved settings for one run. Built once, then shared by reference
/// with every workflow step.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub keploy_bin: PathBuf,
    pub project_dir: PathBuf,
    pub fixture_dir: PathBuf,
    pub metadata_file: PathBuf,
    pub python: PathBuf,
    pub app_entry: PathBuf,
    pub app_command: Option<String>,
    pub endpoint: String,
    pub capture_timeout: Duration,
    pub calls: u32,
    pub warmup: Duration,
    pub grace: Duration,
    pub request_pause: Duration,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub metadata_tags: Option<String>,
    pub run_root: PathBuf,
    pub run_name: Option<String>,
    pub use_sudo: bool,
    pub timeout_wrapper: bool,
    pub dry_run: bool,
    pub evidence_ledger: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            keploy_bin: PathBuf::from("/usr/local/bin/keploy"),
            project_dir: PathBuf::from("."),
            fixture_dir: PathBuf::from("keploy"),
            metadata_file: PathBuf::from("keploy/keploy.yml"),
            python: PathBuf::from("venv/bin/python"),
            app_entry: PathBuf::from("app.py"),
            app_command: None,
            endpoint: "http://127.0.0.1:5000/".to_string(),
            capture_timeout: Duration::from_secs(60),
            calls: 100,
            warmup: Duration::from_secs(5),
            grace: Duration::from_secs(3),
            request_pause: Duration::from_millis(200),
            ready_attempts: 30,
            ready_interval: Duration::from_secs(2),
            metadata_tags: None,
            run_root: PathBuf::from("/tmp/keploy_recorder/runs"),
            run_name: None,
            use_sudo: true,
            timeout_wrapper: true,
            dry_run: false,
            evidence_ledger: true,
        }
    }
}

impl RecorderConfig {
    /// Defaults, then the optional config file, then flags.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = &cli.config {
            cfg.apply_file(&ConfigFile::load(path)?)?;
        }
        cfg.apply_args(cli)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_file(&mut self, file: &ConfigFile) -> Result<()> {
        if let Some(value) = file.get_path("keploy_bin") {
            self.keploy_bin = value;
        }
        if let Some(value) = file.get_path("project_dir") {
            self.project_dir = value;
        }
        if let Some(value) = file.get_path("fixture_dir") {
            self.fixture_dir = value;
        }
        if let Some(value) = file.get_path("metadata_file") {
            self.metadata_file = value;
        }
        if let Some(value) = file.get_path("python") {
            self.python = value;
        }
        if let Some(value) = file.get_path("app_entry") {
            self.app_entry = value;
        }
        if let Some(value) = file.get("app_command") {
            self.app_command = Some(value.to_string());
        }
        if let Some(value) = file.get("endpoint") {
            self.endpoint = value.to_string();
        }
        if let Some(value) = file.get_duration("timeout")? {
            self.capture_timeout = value;
        }
        if let Some(value) = file.get_u32("calls")? {
            self.calls = value;
        }
        if let Some(value) = file.get_duration("warmup")? {
            self.warmup = value;
        }
        if let Some(value) = file.get_duration("grace")? {
            self.grace = value;
        }
        if let Some(value) = file.get_duration("pause")? {
            self.request_pause = value;
        }
        if let Some(value) = file.get_u32("ready_attempts")? {
            self.ready_attempts = value;
        }
        if let Some(value) = file.get_duration("ready_interval")? {
            self.ready_interval = value;
        }
        if let Some(value) = file.get("metadata") {
            self.metadata_tags = Some(value.to_string());
        }
        if let Some(value) = file.get_path("run_root") {
            self.run_root = value;
        }
        if let Some(value) = file.get_bool("use_sudo") {
            self.use_sudo = value;
        }
        if let Some(value) = file.get_bool("timeout_wrapper") {
            self.timeout_wrapper = value;
        }
        Ok(())
    }

    pub fn apply_args(&mut self, args: &Cli) -> Result<()> {
        if let Some(value) = &args.timeout {
            self.capture_timeout = parse_duration_value(value)?;
        }
        if let Some(value) = args.calls {
            self.calls = value;
        }
        if let Some(value) = &args.project_dir {
            self.project_dir = value.clone();
        }
        if let Some(value) = &args.keploy_bin {
            self.keploy_bin = value.clone();
        }
        if let Some(value) = &args.python {
            self.python = value.clone();
        }
        if let Some(value) = &args.app_entry {
            self.app_entry = value.clone();
        }
        if let Some(value) = &args.app_command {
            self.app_command = Some(value.clone());
        }
        if let Some(value) = &args.endpoint {
            self.endpoint = value.clone();
        }
        if let Some(value) = &args.metadata {
            self.metadata_tags = Some(value.clone());
        }
        if let Some(value) = &args.warmup {
            self.warmup = parse_duration_value(value)?;
        }
        if let Some(value) = &args.grace {
            self.grace = parse_duration_value(value)?;
        }
        if let Some(value) = &args.pause {
            self.request_pause = parse_duration_value(value)?;
        }
        if let Some(value) = args.ready_attempts {
            self.ready_attempts = value;
        }
        if let Some(value) = &args.ready_interval {
            self.ready_interval = parse_duration_value(value)?;
        }
        if let Some(value) = &args.run_root {
            self.run_root = value.clone();
        }
        if let Some(value) = &args.run_name {
            self.run_name = Some(value.clone());
        }
        if args.no_sudo {
            self.use_sudo = false;
        }
        if args.no_timeout_wrapper {
            self.timeout_wrapper = false;
        }
        if args.dry_run {
            self.dry_run = true;
        }
        if args.no_evidence_ledger {
            self.evidence_ledger = false;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture_timeout.is_zero() {
            return Err(RecorderError::invalid("capture timeout must be positive"));
        }
        if self.ready_attempts == 0 {
            return Err(RecorderError::invalid("ready attempts must be at least 1"));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(RecorderError::invalid(format!(
                "endpoint must be an http(s) URL: {}",
                self.endpoint
            )));
        }
        if let Some(tags) = &self.metadata_tags
            && tags.split(',').any(|tag| !tag.contains('='))
        {
            return Err(RecorderError::invalid(format!(
                "metadata tags must be comma-separated key=value pairs: {tags}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn fixture_dir_path(&self) -> PathBuf {
        resolve_under(&self.project_dir, &self.fixture_dir)
    }

    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        resolve_under(&self.project_dir, &self.metadata_file)
    }

    #[must_use]
    pub fn python_path(&self) -> PathBuf {
        resolve_under(&self.project_dir, &self.python)
    }

    #[must_use]
    pub fn app_entry_path(&self) -> PathBuf {
        resolve_under(&self.project_dir, &self.app_entry)
    }

    /// Command line Keploy runs (and records) as the target application.
    #[must_use]
    pub fn app_start_command(&self) -> String {
        match self.app_command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => command.to_string(),
            _ => format!(
                "{} {}",
                shell_single_quote(&self.python_path().display().to_string()),
                shell_single_quote(&self.app_entry_path().display().to_string())
            ),
        }
    }

    /// Tags attached to the recording session via `--metadata`.
    #[must_use]
    pub fn recording_metadata(&self) -> String {
        let mut tags = vec![
            "recorder=keploy_recorder".to_string(),
            format!("target_calls={}", self.calls),
            format!("timeout={}", duration_literal(self.capture_timeout)),
        ];
        if let Some(extra) = self.metadata_tags.as_deref().map(str::trim)
            && !extra.is_empty()
        {
            tags.push(extra.to_string());
        }
        tags.join(",")
    }

    /// Fixture count that is still enough to demonstrate the captured behavior.
    #[must_use]
    pub fn sufficient_fixture_count(&self) -> usize {
        usize::try_from(self.calls.div_ceil(2)).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn target_fixture_count(&self) -> usize {
        usize::try_from(self.calls).unwrap_or(usize::MAX)
    }

    /// How long the recorder itself waits for the capture process, measured
    /// from spawn.
    #[must_use]
    pub fn capture_wait_bound(&self) -> Duration {
        if self.timeout_wrapper {
            self.capture_timeout.saturating_add(WRAPPER_SLACK)
        } else {
            self.capture_timeout
        }
    }
}
