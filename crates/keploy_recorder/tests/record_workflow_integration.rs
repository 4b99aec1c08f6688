#![cfg(unix)]

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::{TempDir, tempdir};

const FAKE_KEPLOY: &str = r#"#!/bin/sh
[ -n "$FAKE_MARKER" ] && echo "$1" >> "$FAKE_MARKER"
case "$1" in
record)
    [ -n "$FAKE_PID_FILE" ] && echo $$ > "$FAKE_PID_FILE"
    [ -n "$FAKE_RECORD_SLEEP" ] && sleep "$FAKE_RECORD_SLEEP"
    mkdir -p keploy
    n=${FAKE_FIXTURES:-0}
    if [ "$n" -gt 0 ]; then
        mkdir -p keploy/test-set-0/tests
        i=1
        while [ "$i" -le "$n" ]; do
            printf 'kind: Http\n' > "keploy/test-set-0/tests/test-$i.yaml"
            i=$((i + 1))
        done
    fi
    if [ "$FAKE_CORRUPT" = 1 ]; then
        printf 'path: \001\002garbage\n' > keploy/keploy.yml
    else
        printf 'path: ./\n' > keploy/keploy.yml
    fi
    echo "recorded $n"
    exit "${FAKE_RECORD_EXIT:-0}"
    ;;
sanitize)
    if [ "${FAKE_SANITIZE_EXIT:-0}" -ne 0 ]; then
        echo "sanitize broke" >&2
        exit "$FAKE_SANITIZE_EXIT"
    fi
    lines=${FAKE_SECRET_LINES:-0}
    if [ "$lines" -gt 0 ]; then
        mkdir -p keploy/test-set-0
        : > keploy/test-set-0/secret.yaml
        i=1
        while [ "$i" -le "$lines" ]; do
            echo "secret-$i: redacted" >> keploy/test-set-0/secret.yaml
            i=$((i + 1))
        done
    fi
    exit 0
    ;;
esac
exit 64
"#;

fn recorder_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_keploy_recorder"))
}

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).expect("write executable");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

struct Workspace {
    temp: TempDir,
    keploy: PathBuf,
    project: PathBuf,
    run_root: PathBuf,
    marker: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("venv").join("bin")).expect("venv");
        write_executable(
            &project.join("venv").join("bin").join("python"),
            "#!/bin/sh\nexit 0\n",
        );
        fs::write(project.join("app.py"), "app = None\n").expect("app entry");

        let keploy = temp.path().join("keploy");
        write_executable(&keploy, FAKE_KEPLOY);

        Self {
            run_root: temp.path().join("runs"),
            marker: temp.path().join("marker"),
            keploy,
            project,
            temp,
        }
    }

    fn fixture_dir(&self) -> PathBuf {
        self.project.join("keploy")
    }

    fn run_dir(&self) -> PathBuf {
        self.run_root.join("it")
    }

    fn meta(&self) -> Value {
        let content =
            fs::read_to_string(self.run_dir().join("run_meta.json")).expect("read run_meta");
        serde_json::from_str(&content).expect("parse run_meta")
    }

    fn marker_lines(&self) -> Vec<String> {
        fs::read_to_string(&self.marker)
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    fn run(&self, endpoint: &str, extra_args: &[&str], env: &[(&str, &str)]) -> Output {
        let mut command = Command::new(recorder_bin());
        command
            .arg("--keploy-bin")
            .arg(&self.keploy)
            .arg("--project-dir")
            .arg(&self.project)
            .arg("--run-root")
            .arg(&self.run_root)
            .args(["--run-name", "it", "--endpoint", endpoint])
            .args(["--no-sudo", "--no-timeout-wrapper"])
            .args(["--grace", "0s", "--pause", "0ms", "--ready-interval", "100ms"])
            .args(extra_args)
            .env("FAKE_MARKER", &self.marker);
        if !extra_args.contains(&"--warmup") {
            command.args(["--warmup", "0s"]);
        }
        for (key, value) in env {
            command.env(key, value);
        }
        command.output().expect("run keploy_recorder")
    }
}

/// Always answers 200 and counts requests.
fn spawn_app_server() -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut buf = [0_u8; 2048];
            let _ = stream.read(&mut buf);
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
            );
        }
    });
    (format!("http://127.0.0.1:{port}/"), hits)
}

fn closed_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}/")
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn full_run_records_sanitizes_and_reports_full_success() {
    let ws = Workspace::new();
    let (endpoint, hits) = spawn_app_server();
    let stale = ws.fixture_dir().join("old-set").join("tests");
    fs::create_dir_all(&stale).expect("stale dir");
    fs::write(stale.join("test-999.yaml"), "").expect("stale fixture");

    let output = ws.run(
        &endpoint,
        &[],
        &[("FAKE_FIXTURES", "120"), ("FAKE_SECRET_LINES", "8")],
    );
    assert!(output.status.success(), "run failed: {}", stderr_text(&output));

    let meta = ws.meta();
    assert_eq!(meta["status"], "ok");
    assert_eq!(meta["stage"], "reported");
    assert_eq!(meta["capture_outcome"], "completed");
    assert_eq!(meta["fixtures"], 120);
    assert_eq!(meta["secret_files"], 1);
    assert_eq!(meta["secret_lines"], 8);
    assert_eq!(meta["metadata_removed"], false);
    assert_eq!(meta["classification"], "full");
    assert_eq!(meta["requests_succeeded"], 100);
    assert_eq!(meta["requests_failed"], 0);
    assert!(hits.load(Ordering::SeqCst) >= 101);

    assert!(!stale.exists(), "previous fixtures should be removed");
    assert_eq!(ws.marker_lines(), ["record", "sanitize"]);

    let ledger = fs::read_to_string(ws.run_dir().join("evidence_ledger.jsonl")).expect("ledger");
    let actions = ledger
        .lines()
        .map(|line| {
            let record: Value = serde_json::from_str(line).expect("decision json");
            record["action"].as_str().expect("action").to_string()
        })
        .collect::<Vec<_>>();
    assert_eq!(
        actions,
        [
            "config_resolved",
            "capture_finalize",
            "corruption_workaround",
            "sanitize_finalize"
        ]
    );

    let summary = fs::read_to_string(ws.run_dir().join("run_summary.txt")).expect("summary");
    assert!(summary.contains("final_status=ok"));
    assert!(summary.contains("fixtures=120"));
}

#[test]
fn zero_fixtures_aborts_before_workaround_and_sanitize() {
    let ws = Workspace::new();
    let (endpoint, _) = spawn_app_server();

    let output = ws.run(&endpoint, &["-c", "5"], &[("FAKE_FIXTURES", "0")]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("no fixture files found"));

    let meta = ws.meta();
    assert_eq!(meta["status"], "failed");
    assert_eq!(meta["stage"], "capturing");
    assert!(meta["metadata_removed"].is_null());
    assert_eq!(ws.marker_lines(), ["record"]);
}

#[test]
fn corrupt_metadata_is_deleted_and_fixtures_survive() {
    let ws = Workspace::new();
    let (endpoint, _) = spawn_app_server();

    let output = ws.run(
        &endpoint,
        &[],
        &[("FAKE_FIXTURES", "75"), ("FAKE_CORRUPT", "1")],
    );
    assert!(output.status.success(), "run failed: {}", stderr_text(&output));

    assert!(!ws.fixture_dir().join("keploy.yml").exists());
    let meta = ws.meta();
    assert_eq!(meta["metadata_removed"], true);
    assert_eq!(meta["fixtures_after_workaround"], 75);
    assert_eq!(meta["fixtures"], 75);
    assert_eq!(meta["classification"], "partial");
    assert_eq!(meta["secret_files"], 0);
}

#[test]
fn readiness_exhaustion_kills_capture_and_exits_one() {
    let ws = Workspace::new();
    let pid_file = ws.temp.path().join("record.pid");
    let started = Instant::now();

    let output = ws.run(
        &closed_endpoint(),
        &["--ready-attempts", "2", "--warmup", "1s", "-t", "60s"],
        &[
            ("FAKE_RECORD_SLEEP", "30"),
            ("FAKE_PID_FILE", pid_file.to_str().expect("pid path")),
        ],
    );

    assert_eq!(output.status.code(), Some(1));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(stderr_text(&output).contains("never became ready"));

    let meta = ws.meta();
    assert_eq!(meta["status"], "failed");
    assert_eq!(meta["stage"], "capturing");
    assert!(meta["capture_outcome"].is_null());

    let pid = fs::read_to_string(&pid_file).expect("pid file");
    let alive = Command::new("kill")
        .args(["-0", pid.trim()])
        .stderr(std::process::Stdio::null())
        .status()
        .expect("kill -0");
    assert!(!alive.success(), "capture process {} still running", pid.trim());
    assert_eq!(ws.marker_lines(), ["record"]);
}

#[test]
fn sanitize_failure_exits_one_without_secret_verification() {
    let ws = Workspace::new();
    let (endpoint, _) = spawn_app_server();

    let output = ws.run(
        &endpoint,
        &["-c", "10"],
        &[
            ("FAKE_FIXTURES", "10"),
            ("FAKE_SANITIZE_EXIT", "2"),
            ("FAKE_SECRET_LINES", "4"),
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("keploy sanitize failed (exit=2)"));

    let meta = ws.meta();
    assert_eq!(meta["status"], "failed");
    assert_eq!(meta["stage"], "workaround_applied");
    assert!(meta["secret_files"].is_null());
    assert!(meta["classification"].is_null());

    let log = fs::read_to_string(ws.run_dir().join("sanitize.log")).expect("sanitize log");
    assert!(log.contains("sanitize broke"));
}

#[test]
fn wrapper_timeout_exit_code_counts_as_success() {
    let ws = Workspace::new();
    let (endpoint, _) = spawn_app_server();

    let output = ws.run(
        &endpoint,
        &["-c", "4"],
        &[("FAKE_FIXTURES", "4"), ("FAKE_RECORD_EXIT", "124")],
    );
    assert!(output.status.success(), "run failed: {}", stderr_text(&output));
    let meta = ws.meta();
    assert_eq!(meta["capture_outcome"], "timed_out");
    assert_eq!(meta["capture_exit_code"], 124);
}

#[test]
fn other_capture_exit_codes_are_fatal() {
    let ws = Workspace::new();
    let (endpoint, _) = spawn_app_server();

    let output = ws.run(
        &endpoint,
        &["-c", "2"],
        &[("FAKE_FIXTURES", "2"), ("FAKE_RECORD_EXIT", "3")],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("keploy record failed (exit=3)"));
    assert_eq!(ws.meta()["capture_outcome"], "failed");
    assert_eq!(ws.marker_lines(), ["record"]);
}

#[test]
fn missing_keploy_binary_stops_before_cleaning() {
    let ws = Workspace::new();
    let stale = ws.fixture_dir().join("test-set-0").join("tests");
    fs::create_dir_all(&stale).expect("stale dir");
    fs::write(stale.join("test-1.yaml"), "").expect("stale fixture");

    let output = Command::new(recorder_bin())
        .arg("--keploy-bin")
        .arg(ws.temp.path().join("absent-keploy"))
        .arg("--project-dir")
        .arg(&ws.project)
        .arg("--run-root")
        .arg(&ws.run_root)
        .args(["--no-sudo", "--no-timeout-wrapper"])
        .output()
        .expect("run keploy_recorder");

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_text(&output).contains("absent-keploy"));
    assert!(stale.join("test-1.yaml").exists());
    assert!(!ws.run_root.exists());
}

#[test]
fn dry_run_reports_plan_without_touching_fixtures() {
    let ws = Workspace::new();
    let stale = ws.fixture_dir().join("test-set-0").join("tests");
    fs::create_dir_all(&stale).expect("stale dir");
    fs::write(stale.join("test-1.yaml"), "").expect("stale fixture");

    let output = ws.run(&closed_endpoint(), &["--dry-run"], &[]);
    assert!(output.status.success(), "dry run failed: {}", stderr_text(&output));
    assert!(stale.join("test-1.yaml").exists());
    assert!(ws.marker_lines().is_empty());
    assert_eq!(ws.meta()["status"], "dry_run");
}

#[test]
fn config_file_values_are_overridden_by_flags() {
    let ws = Workspace::new();
    let config = ws.temp.path().join("recorder.conf");
    fs::write(
        &config,
        "# recorder settings\ncalls=7\ntimeout=\"45s\"\nmetadata=team=payments\n",
    )
    .expect("config");

    let output = ws.run(
        &closed_endpoint(),
        &["--dry-run", "--config", config.to_str().expect("config path"), "-c", "3"],
        &[],
    );
    assert!(output.status.success(), "dry run failed: {}", stderr_text(&output));

    let meta = ws.meta();
    assert_eq!(meta["calls"], 3);
    assert_eq!(meta["capture_timeout"], "45s");
    let record_command = meta["record_command"].as_str().expect("record command");
    assert!(record_command.contains("target_calls=3"));
    assert!(record_command.contains("team=payments"));
}

#[test]
fn help_exits_zero_and_unknown_flag_exits_one() {
    let help = Command::new(recorder_bin())
        .arg("--help")
        .output()
        .expect("run --help");
    assert!(help.status.success());
    let text = String::from_utf8_lossy(&help.stdout);
    assert!(text.contains("--calls"));
    assert!(text.contains("--timeout"));

    let bogus = Command::new(recorder_bin())
        .arg("--bogus")
        .output()
        .expect("run --bogus");
    assert_eq!(bogus.status.code(), Some(1));
    assert!(stderr_text(&bogus).contains("--bogus"));
}
