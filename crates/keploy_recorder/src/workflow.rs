use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::capture::{
    CaptureOutcome, record_argv, render_command_line, run_capture, sanitize_argv, verify_capture,
};
use crate::cleaner::clean_fixture_dir;
use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::prereq::{check_prerequisites, refresh_sudo_credentials};
use crate::readiness::http_client;
use crate::runmeta::{DecisionRecord, POLICY_ID, RunMeta};
use crate::sanitize::run_sanitize;
use crate::summary::{FinalSummary, report_summary, summarize};
use crate::util::{
    CliOutput, OutputIntegration, append_line, duration_literal, ensure_dir, now_compact_timestamp,
    now_utc_iso, output_for, write_string,
};
use crate::workaround::{WorkaroundOutcome, apply_corruption_workaround, verify_fixtures_survived};

/// Furthest point a run reached; an aborted run keeps the last stage it
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PrereqOk,
    Cleaned,
    Capturing,
    Captured,
    WorkaroundApplied,
    Sanitized,
    Reported,
}

impl Stage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrereqOk => "prereq_ok",
            Self::Cleaned => "cleaned",
            Self::Capturing => "capturing",
            Self::Captured => "captured",
            Self::WorkaroundApplied => "workaround_applied",
            Self::Sanitized => "sanitized",
            Self::Reported => "reported",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub meta: PathBuf,
    pub summary: PathBuf,
    pub ledger: PathBuf,
    pub record_log: PathBuf,
    pub sanitize_log: PathBuf,
}

impl RunPaths {
    #[must_use]
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            meta: run_dir.join("run_meta.json"),
            summary: run_dir.join("run_summary.txt"),
            ledger: run_dir.join("evidence_ledger.jsonl"),
            record_log: run_dir.join("record.log"),
            sanitize_log: run_dir.join("sanitize.log"),
        }
    }
}

struct DecisionEvent {
    action: &'static str,
    evidence_terms: Vec<String>,
    fallback_reason: Option<String>,
}

struct RecorderRun<'a> {
    cfg: &'a RecorderConfig,
    ui: &'a CliOutput,
    integration: &'a OutputIntegration,
    paths: RunPaths,
    trace_id: String,
    started: SystemTime,
    meta: RunMeta,
    stage: Stage,
    decisions: u32,
}

impl<'a> RecorderRun<'a> {
    fn open(
        cfg: &'a RecorderConfig,
        ui: &'a CliOutput,
        integration: &'a OutputIntegration,
    ) -> Result<Self> {
        let timestamp = now_compact_timestamp();
        let run_name = cfg.run_name.clone().unwrap_or_else(|| timestamp.clone());
        let paths = RunPaths::new(&cfg.run_root.join(run_name));
        ensure_dir(&paths.run_dir)?;

        let trace_id = format!("trace-{timestamp}-{}", std::process::id());
        let record_command = render_command_line(&record_argv(cfg));
        let meta = RunMeta {
            status: "running".to_string(),
            stage: Stage::PrereqOk.as_str().to_string(),
            started_at: now_utc_iso(),
            keploy_bin: cfg.keploy_bin.display().to_string(),
            project_dir: cfg.project_dir.display().to_string(),
            fixture_dir: cfg.fixture_dir_path().display().to_string(),
            metadata_file: cfg.metadata_path().display().to_string(),
            endpoint: cfg.endpoint.clone(),
            app_command: cfg.app_start_command(),
            capture_timeout: duration_literal(cfg.capture_timeout),
            calls: cfg.calls,
            use_sudo: cfg.use_sudo,
            timeout_wrapper: cfg.timeout_wrapper,
            record_command: record_command.clone(),
            run_dir: paths.run_dir.display().to_string(),
            record_log: paths.record_log.display().to_string(),
            sanitize_log: paths.sanitize_log.display().to_string(),
            trace_id: Some(trace_id.clone()),
            policy_id: Some(POLICY_ID.to_string()),
            evidence_ledger: cfg
                .evidence_ledger
                .then(|| paths.ledger.display().to_string()),
            fastapi_output_mode: Some(integration.fastapi_mode.clone()),
            fastapi_agent_mode: Some(integration.fastapi_agent),
            sqlmodel_output_mode: Some(integration.sqlmodel_mode.clone()),
            sqlmodel_agent_mode: Some(integration.sqlmodel_agent),
            ..RunMeta::default()
        };

        let header = format!(
            "keploy_recorder run\nstarted_at={}\nproject_dir={}\nfixture_dir={}\nendpoint={}\ncalls={}\ncapture_timeout={}\nwait_bound={}\nuse_sudo={}\ntimeout_wrapper={}\nrecord_command={}\nrun_dir={}\ntrace_id={}\nfastapi_output_mode={}\nsqlmodel_output_mode={}\n",
            meta.started_at,
            meta.project_dir,
            meta.fixture_dir,
            cfg.endpoint,
            cfg.calls,
            meta.capture_timeout,
            duration_literal(cfg.capture_wait_bound()),
            cfg.use_sudo,
            cfg.timeout_wrapper,
            record_command,
            meta.run_dir,
            trace_id,
            integration.fastapi_mode,
            integration.sqlmodel_mode,
        );
        write_string(&paths.summary, &header)?;
        meta.write_to_path(&paths.meta)?;

        let mut run = Self {
            cfg,
            ui,
            integration,
            paths,
            trace_id,
            started: SystemTime::now(),
            meta,
            stage: Stage::PrereqOk,
            decisions: 0,
        };
        run.decide(DecisionEvent {
            action: "config_resolved",
            evidence_terms: vec![
                format!("calls={}", cfg.calls),
                format!("timeout={}", duration_literal(cfg.capture_timeout)),
                format!("wait_bound={}", duration_literal(cfg.capture_wait_bound())),
                format!("use_sudo={}", cfg.use_sudo),
                format!("timeout_wrapper={}", cfg.timeout_wrapper),
            ],
            fallback_reason: (!cfg.timeout_wrapper)
                .then(|| "no timeout wrapper; relying on the recorder's own bound".to_string()),
        })?;
        Ok(run)
    }

    fn decide(&mut self, event: DecisionEvent) -> Result<()> {
        if !self.cfg.evidence_ledger {
            return Ok(());
        }
        self.decisions += 1;
        DecisionRecord {
            timestamp: now_utc_iso(),
            trace_id: self.trace_id.clone(),
            decision_id: format!("decision-{:04}", self.decisions),
            action: event.action.to_string(),
            evidence_terms: event.evidence_terms,
            fallback_active: event.fallback_reason.is_some(),
            fallback_reason: event.fallback_reason,
            policy_id: POLICY_ID.to_string(),
        }
        .append_jsonl(&self.paths.ledger)
    }

    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        self.meta.stage = stage.as_str().to_string();
    }

    fn execute(&mut self) -> Result<FinalSummary> {
        let cfg = self.cfg;
        let ui = self.ui;

        if cfg.use_sudo {
            refresh_sudo_credentials(ui)?;
        }

        ui.rule(Some("clean"));
        clean_fixture_dir(&cfg.fixture_dir_path(), cfg.use_sudo, ui)?;
        self.advance(Stage::Cleaned);

        ui.rule(Some("capture"));
        let client = http_client()?;
        self.advance(Stage::Capturing);
        let report = run_capture(cfg, &client, &self.paths.record_log, ui)?;
        self.meta.capture_outcome = Some(report.outcome.label().to_string());
        self.meta.capture_exit_code = Some(report.outcome.exit_code());
        self.meta.capture_duration_ms = Some(report.duration_ms);
        self.meta.ready_attempts_used = Some(report.readiness.attempts);
        self.meta.requests_succeeded = Some(report.traffic.successful);
        self.meta.requests_failed = Some(report.traffic.failed);
        self.decide(DecisionEvent {
            action: "capture_finalize",
            evidence_terms: vec![
                format!("outcome={}", report.outcome.label()),
                format!("exit_code={}", report.outcome.exit_code()),
                format!("ready_attempts={}", report.readiness.attempts),
                format!("requests_succeeded={}", report.traffic.successful),
                format!("requests_failed={}", report.traffic.failed),
            ],
            fallback_reason: (report.outcome == CaptureOutcome::BoundReached).then(|| {
                format!(
                    "keploy record outlived {}; process tree terminated",
                    duration_literal(cfg.capture_wait_bound())
                )
            }),
        })?;

        let fixtures = verify_capture(&report, cfg, ui)?;
        self.meta.fixtures_after_capture = Some(fixtures);
        self.advance(Stage::Captured);

        ui.rule(Some("metadata check"));
        let workaround = apply_corruption_workaround(&cfg.metadata_path(), cfg.use_sudo, ui)?;
        self.meta.metadata_removed = Some(workaround.removed());
        self.decide(DecisionEvent {
            action: "corruption_workaround",
            evidence_terms: vec![format!(
                "metadata={}",
                match workaround {
                    WorkaroundOutcome::Absent => "absent",
                    WorkaroundOutcome::Clean => "clean",
                    WorkaroundOutcome::Removed { .. } => "removed",
                }
            )],
            fallback_reason: match workaround {
                WorkaroundOutcome::Removed { offset, byte } => Some(format!(
                    "control byte 0x{byte:02X} at offset {offset}"
                )),
                _ => None,
            },
        })?;
        let surviving = verify_fixtures_survived(&cfg.fixture_dir_path())?;
        self.meta.fixtures_after_workaround = Some(surviving);
        self.advance(Stage::WorkaroundApplied);

        ui.rule(Some("sanitize"));
        let sanitized = run_sanitize(cfg, &self.paths.sanitize_log, ui)?;
        self.meta.sanitize_duration_ms = Some(sanitized.duration_ms);
        self.decide(DecisionEvent {
            action: "sanitize_finalize",
            evidence_terms: vec![
                format!("duration_ms={}", sanitized.duration_ms),
                format!("secret_files={}", sanitized.secret_reports.len()),
                format!("secret_lines={}", sanitized.secret_lines()),
            ],
            fallback_reason: sanitized
                .secret_reports
                .is_empty()
                .then(|| "no secret report produced".to_string()),
        })?;
        self.advance(Stage::Sanitized);

        let summary = summarize(cfg);
        report_summary(&summary, &cfg.project_dir, ui);
        self.meta.fixtures = Some(summary.fixtures);
        self.meta.secret_files = Some(summary.secret_files);
        self.meta.secret_lines = Some(summary.secret_lines);
        self.meta.classification = Some(summary.classification.as_str().to_string());
        self.advance(Stage::Reported);
        Ok(summary)
    }

    fn close(&mut self, status: &str, error: Option<&RecorderError>) -> Result<()> {
        let finished_at = now_utc_iso();
        let duration_seconds = SystemTime::now()
            .duration_since(self.started)
            .map_or(0_i64, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));

        self.meta.status = status.to_string();
        self.meta.finished_at = Some(finished_at.clone());
        self.meta.duration_seconds = Some(duration_seconds);
        self.meta.error = error.map(ToString::to_string);
        self.meta.write_to_path(&self.paths.meta)?;

        let optional =
            |value: Option<usize>| value.map_or_else(|| "null".to_string(), |v| v.to_string());
        let tail = format!(
            "finished_at={}\nduration_seconds={}\nfinal_status={}\nstage={}\ncapture_outcome={}\nfixtures={}\nsecret_files={}\nsecret_lines={}\nmetadata_removed={}\nclassification={}",
            finished_at,
            duration_seconds,
            status,
            self.stage.as_str(),
            self.meta.capture_outcome.as_deref().unwrap_or("null"),
            optional(self.meta.fixtures.or(self.meta.fixtures_after_capture)),
            optional(self.meta.secret_files),
            optional(self.meta.secret_lines),
            self.meta
                .metadata_removed
                .map_or_else(|| "null".to_string(), |v| v.to_string()),
            self.meta.classification.as_deref().unwrap_or("null"),
        );
        append_line(&self.paths.summary, &tail)
    }

    fn dry_run(&mut self) -> Result<()> {
        let record_command = render_command_line(&record_argv(self.cfg));
        let sanitize_command = render_command_line(&sanitize_argv(self.cfg));
        self.ui.success("dry run complete; nothing was recorded");
        self.ui.info(&format!("would record: {record_command}"));
        self.ui.info(&format!("would sanitize: {sanitize_command}"));
        self.ui
            .info(&format!("run directory: {}", self.paths.run_dir.display()));
        self.close("dry_run", None)?;

        if self.integration.should_emit_json() {
            println!(
                "{}",
                serde_json::json!({
                    "command": "record",
                    "status": "dry_run_ok",
                    "run_dir": self.paths.run_dir.display().to_string(),
                    "record_command": record_command,
                    "sanitize_command": sanitize_command,
                    "integration": self.integration,
                })
            );
        }
        Ok(())
    }
}

/// Drive one recording session end to end. Prerequisite failures leave no
/// trace on disk; any later failure is recorded in the run directory before
/// it is returned.
pub fn run_workflow(cfg: &RecorderConfig) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    ui.rule(Some("prerequisites"));
    check_prerequisites(cfg, &ui)?;

    let mut run = RecorderRun::open(cfg, &ui, &integration)?;
    if cfg.dry_run {
        return run.dry_run();
    }

    match run.execute() {
        Ok(summary) => {
            run.close("ok", None)?;
            ui.info(&format!("run directory: {}", run.paths.run_dir.display()));
            if integration.should_emit_json() {
                println!(
                    "{}",
                    serde_json::json!({
                        "command": "record",
                        "status": "ok",
                        "fixtures": summary.fixtures,
                        "secret_files": summary.secret_files,
                        "secret_lines": summary.secret_lines,
                        "classification": summary.classification,
                        "run_dir": run.paths.run_dir.display().to_string(),
                        "integration": integration,
                    })
                );
            }
            Ok(())
        }
        Err(error) => {
            ui.error(&format!("aborted after stage {}", run.stage.as_str()));
            if let Err(close_error) = run.close("failed", Some(&error)) {
                ui.warning(&format!("could not record failed run: {close_error}"));
            }
            ui.info(&format!("run directory: {}", run.paths.run_dir.display()));
            Err(error)
        }
    }
}
