use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::Serialize;
use wait_timeout::ChildExt;

use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::fixtures::count_fixture_files;
use crate::readiness::{ReadinessOutcome, ReadinessPolicy, wait_for_ready};
use crate::summary::{Classification, classify};
use crate::traffic::{TrafficPlan, TrafficTally, generate_traffic};
use crate::util::{CliOutput, duration_literal, shell_single_quote};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Exit code coreutils `timeout` reports when it had to stop the command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "exit_code", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Keploy exited on its own with status 0.
    Completed,
    /// The `timeout` wrapper stopped Keploy after the full capture window.
    TimedOut,
    /// The recorder's own wait bound expired and it stopped the process tree.
    BoundReached,
    Failed(i32),
}

impl CaptureOutcome {
    #[must_use]
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Completed,
            TIMEOUT_EXIT_CODE => Self::TimedOut,
            other => Self::Failed(other),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::TimedOut | Self::BoundReached => TIMEOUT_EXIT_CODE,
            Self::Failed(code) => *code,
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::BoundReached => "bound_reached",
            Self::Failed(_) => "failed",
        }
    }
}

fn elevation_prefix(cfg: &RecorderConfig) -> Vec<OsString> {
    if cfg.use_sudo {
        vec!["sudo".into(), "-n".into(), "-E".into()]
    } else {
        Vec::new()
    }
}

/// `[sudo -n -E] [timeout <t>] keploy record --metadata <tags> -c <app>`
#[must_use]
pub fn record_argv(cfg: &RecorderConfig) -> Vec<OsString> {
    let mut argv = elevation_prefix(cfg);
    if cfg.timeout_wrapper {
        argv.push("timeout".into());
        argv.push(duration_literal(cfg.capture_timeout).into());
    }
    argv.push(cfg.keploy_bin.clone().into_os_string());
    argv.push("record".into());
    argv.push("--metadata".into());
    argv.push(cfg.recording_metadata().into());
    argv.push("-c".into());
    argv.push(cfg.app_start_command().into());
    argv
}

/// `[sudo -n -E] keploy sanitize`
#[must_use]
pub fn sanitize_argv(cfg: &RecorderConfig) -> Vec<OsString> {
    let mut argv = elevation_prefix(cfg);
    argv.push(cfg.keploy_bin.clone().into_os_string());
    argv.push("sanitize".into());
    argv
}

/// Build a command from an argv list, running inside the project directory
/// with both output streams written to `log_path`.
pub fn command_from_argv(
    argv: &[OsString],
    project_dir: &Path,
    log_path: &Path,
) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RecorderError::invalid("empty command line"))?;

    let log_file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;
    let log_err = log_file.try_clone()?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_err));
    Ok(command)
}

#[must_use]
pub fn render_command_line(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| {
            let value = arg.to_string_lossy();
            if value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
            {
                value.into_owned()
            } else {
                shell_single_quote(&value)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn terminate_process_tree(root_pid: u32, elevated: bool) {
    if root_pid == 0 {
        return;
    }

    fn collect_descendant_pids(root_pid: u32) -> Vec<u32> {
        use std::collections::{HashSet, VecDeque};

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([root_pid]);
        let mut descendants = Vec::new();

        while let Some(parent_pid) = queue.pop_front() {
            let output = match Command::new("pgrep")
                .arg("-P")
                .arg(parent_pid.to_string())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output()
            {
                Ok(output) => output,
                Err(_) => continue,
            };

            for line in String::from_utf8_lossy(&output.stdout).lines() {
                let Ok(child_pid) = line.trim().parse::<u32>() else {
                    continue;
                };
                if child_pid == 0 || !visited.insert(child_pid) {
                    continue;
                }
                descendants.push(child_pid);
                queue.push_back(child_pid);
            }
        }

        descendants
    }

    let kill_command = || {
        if elevated {
            let mut command = Command::new("sudo");
            command.arg("-n").arg("kill");
            command
        } else {
            Command::new("kill")
        }
    };

    let kill_targets = |signal: &str, targets: &[String]| {
        if targets.is_empty() {
            return;
        }
        let mut command = kill_command();
        command.arg(signal).arg("--").args(targets);
        command.stdout(Stdio::null()).stderr(Stdio::null());
        let _ = command.status();
    };

    let mut pids = collect_descendant_pids(root_pid);
    pids.push(root_pid);
    pids.sort_unstable();
    pids.dedup();

    let mut targets = pids.iter().map(u32::to_string).collect::<Vec<_>>();
    targets.push(format!("-{root_pid}"));

    kill_targets("-TERM", &targets);
    thread::sleep(Duration::from_millis(250));
    kill_targets("-KILL", &targets);
}

#[cfg(not(unix))]
fn terminate_process_tree(_root_pid: u32, _elevated: bool) {}

/// Handle on the background `keploy record` process.
#[derive(Debug)]
pub struct CaptureSession {
    child: Child,
    elevated: bool,
    started: Instant,
}

impl CaptureSession {
    pub fn spawn(cfg: &RecorderConfig, log_path: &Path) -> Result<Self> {
        let argv = record_argv(cfg);
        let mut command = command_from_argv(&argv, &cfg.project_dir, log_path)?;

        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        Ok(Self {
            child,
            elevated: cfg.use_sudo,
            started: Instant::now(),
        })
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Time left before `bound`, measured from spawn, expires.
    #[must_use]
    pub fn remaining(&self, bound: Duration) -> Duration {
        bound.saturating_sub(self.started.elapsed())
    }

    /// Best-effort stop of the whole process tree; failures are swallowed.
    pub fn terminate(&mut self) {
        terminate_process_tree(self.child.id(), self.elevated);
        let _ = self.child.kill();
        let _ = self.child.wait_timeout(Duration::from_secs(2));
    }

    /// Wait until the process exits or `bound` (measured from spawn) expires.
    pub fn wait(mut self, bound: Duration) -> Result<CaptureOutcome> {
        let remaining = self.remaining(bound);
        match self.child.wait_timeout(remaining)? {
            Some(status) => Ok(CaptureOutcome::from_exit_code(status.code().unwrap_or(1))),
            None => {
                self.terminate();
                Ok(CaptureOutcome::BoundReached)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub outcome: CaptureOutcome,
    pub readiness: ReadinessOutcome,
    pub traffic: TrafficTally,
    pub duration_ms: u64,
    pub log_path: PathBuf,
}

/// The flush pause never sleeps past what is left of the wait bound.
#[must_use]
pub fn grace_within_bound(grace: Duration, remaining: Duration) -> Duration {
    grace.min(remaining)
}

/// Record while driving traffic: spawn Keploy, wait for the application,
/// send the planned requests, then wait for the capture to finish.
///
/// Readiness polling and traffic always run to completion, so the wait bound
/// is enforced from the flush pause onwards. A recorder that overran the
/// bound during traffic is stopped right after the last request.
pub fn run_capture(
    cfg: &RecorderConfig,
    client: &Client,
    log_path: &Path,
    ui: &CliOutput,
) -> Result<CaptureReport> {
    ui.info(&format!(
        "starting capture: {}",
        render_command_line(&record_argv(cfg))
    ));
    let started = Instant::now();
    let mut session = CaptureSession::spawn(cfg, log_path)?;
    ui.info(&format!(
        "keploy record running (pid {}), warming up for {}",
        session.pid(),
        duration_literal(cfg.warmup)
    ));
    thread::sleep(cfg.warmup);

    let policy = ReadinessPolicy {
        max_attempts: cfg.ready_attempts,
        interval: cfg.ready_interval,
        ..ReadinessPolicy::default()
    };
    let readiness = wait_for_ready(client, &cfg.endpoint, &policy, ui);
    if !readiness.ready {
        ui.error("application never became ready; stopping capture");
        session.terminate();
        return Err(RecorderError::NotReady {
            endpoint: cfg.endpoint.clone(),
            attempts: readiness.attempts,
        });
    }

    let traffic = generate_traffic(
        client,
        &cfg.endpoint,
        &TrafficPlan::new(cfg.calls, cfg.request_pause),
        ui,
    );

    let grace = grace_within_bound(cfg.grace, session.remaining(cfg.capture_wait_bound()));
    ui.info(&format!("letting keploy flush for {}", duration_literal(grace)));
    thread::sleep(grace);

    let outcome = session.wait(cfg.capture_wait_bound())?;
    match outcome {
        CaptureOutcome::Completed => ui.success("keploy record exited cleanly"),
        CaptureOutcome::TimedOut => ui.success(&format!(
            "keploy record ran for its full {} window",
            duration_literal(cfg.capture_timeout)
        )),
        CaptureOutcome::BoundReached => ui.warning(&format!(
            "keploy record outlived {}; stopped it",
            duration_literal(cfg.capture_wait_bound())
        )),
        CaptureOutcome::Failed(code) => ui.error(&format!("keploy record exited with {code}")),
    }

    Ok(CaptureReport {
        outcome,
        readiness,
        traffic,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        log_path: log_path.to_path_buf(),
    })
}

/// Post-conditions after the capture process has exited: a successful
/// outcome and at least one fixture. Returns the fixture count.
pub fn verify_capture(
    report: &CaptureReport,
    cfg: &RecorderConfig,
    ui: &CliOutput,
) -> Result<usize> {
    if !report.outcome.is_success() {
        return Err(RecorderError::CaptureFailed {
            exit_code: report.outcome.exit_code(),
            log: report.log_path.clone(),
        });
    }

    let fixture_dir = cfg.fixture_dir_path();
    let fixtures = count_fixture_files(&fixture_dir);
    if !fixture_dir.is_dir() || fixtures == 0 {
        return Err(RecorderError::NoFixtures {
            dir: fixture_dir,
            context: "after capture".to_string(),
        });
    }

    let target = cfg.target_fixture_count();
    match classify(fixtures, target, cfg.sufficient_fixture_count()) {
        Classification::Full => {
            ui.success(&format!("captured {fixtures} fixtures (met target of {target})"));
        }
        Classification::Partial => ui.success(&format!(
            "captured {fixtures} fixtures (below target of {target}, sufficient to proceed)"
        )),
        Classification::Shortfall => ui.warning(&format!(
            "captured only {fixtures} fixtures (fewer than {} of {target} targeted)",
            cfg.sufficient_fixture_count()
        )),
    }

    Ok(fixtures)
}
