//! Integration tests for the namespace sandbox runner
//!
//! Runs fall back to degraded mode where clone() is refused. Hosts that
//! cannot start a sandbox at all skip these tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};
use upletbox::sandbox::{RunInputs, RunPhase};
use upletbox::{IsolatedRunner, SandboxConfig, SandboxFailureKind, SandboxRunner};

struct Fixture {
    dir: tempfile::TempDir,
    runner: IsolatedRunner,
}

impl Fixture {
    fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["algo", "data", "runs"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let run = dir.path().join("algo/run");
        fs::write(&run, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&run, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.path().join("data/sample.csv"), b"1,2,3\n").unwrap();

        let mut config = SandboxConfig::default();
        config.workspace_root = dir.path().join("runs");
        config.allow_degraded = true;
        config.kill_grace = Duration::from_millis(100);
        Self {
            runner: IsolatedRunner::new(config).unwrap(),
            dir,
        }
    }

    fn inputs(&self) -> RunInputs {
        RunInputs::new(self.dir.path().join("algo"), self.dir.path().join("data"))
    }

    fn runs_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("runs")
    }
}

fn is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).map_or(true, |mut entries| entries.next().is_none())
}

/// True when this host can start a sandbox at all
fn sandbox_available() -> bool {
    let fixture = Fixture::new("exit 0");
    match fixture.runner.predict(&fixture.inputs(), Duration::from_secs(10)) {
        Err(e) if e.sandbox_kind() == Some(SandboxFailureKind::SetupFailure) => {
            eprintln!("skipping: sandbox unavailable on this host: {}", e);
            false
        }
        _ => true,
    }
}

#[test]
fn test_test_run_reads_perf_json_from_output() {
    if !sandbox_available() {
        return;
    }
    let fixture = Fixture::new(
        r#"test -f data/sample.csv || exit 9
echo '{"perf": 0.25, "metrics": {"auc": 0.5}}' > output/perf.json"#,
    );

    let score = fixture
        .runner
        .test(&fixture.inputs(), Duration::from_secs(10))
        .unwrap();
    assert_eq!(score.perf, 0.25);
    assert_eq!(score.metrics["auc"], 0.5);

    let record = fixture.runner.last_run().unwrap();
    assert_eq!(record.outcome(), Some(RunPhase::Completed));
    assert!(record.torn_down());
    assert!(is_empty(&fixture.runs_dir()));
}

#[test]
fn test_train_run_returns_model_and_score() {
    if !sandbox_available() {
        return;
    }
    let fixture = Fixture::new(
        r#"[ "$1" = train ] || exit 8
printf weights > output/model
echo '{"perf": 0.5}' > output/perf.json"#,
    );

    let output = fixture
        .runner
        .train(&fixture.inputs(), Duration::from_secs(10))
        .unwrap();
    assert_eq!(output.model, b"weights");
    assert_eq!(output.score.perf, 0.5);
}

#[test]
fn test_nonzero_exit_is_an_execution_failure() {
    if !sandbox_available() {
        return;
    }
    let fixture = Fixture::new("exit 3");

    let err = fixture
        .runner
        .predict(&fixture.inputs(), Duration::from_secs(10))
        .unwrap_err();
    assert_eq!(err.sandbox_kind(), Some(SandboxFailureKind::ExecutionFailure));
    assert_eq!(
        fixture.runner.last_run().unwrap().outcome(),
        Some(RunPhase::Crashed)
    );
}

#[test]
fn test_missing_output_is_an_execution_failure() {
    if !sandbox_available() {
        return;
    }
    let fixture = Fixture::new("exit 0");

    let err = fixture
        .runner
        .test(&fixture.inputs(), Duration::from_secs(10))
        .unwrap_err();
    assert_eq!(err.sandbox_kind(), Some(SandboxFailureKind::ExecutionFailure));
    assert!(err.to_string().contains("perf.json"));
}

#[test]
fn test_timeout_tears_down_the_whole_run() {
    if !sandbox_available() {
        return;
    }
    let fixture = Fixture::new("sleep 30");

    let started = Instant::now();
    let err = fixture
        .runner
        .predict(&fixture.inputs(), Duration::from_millis(300))
        .unwrap_err();
    assert_eq!(err.sandbox_kind(), Some(SandboxFailureKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));

    let record = fixture.runner.last_run().unwrap();
    assert_eq!(record.outcome(), Some(RunPhase::TimedOut));
    assert!(record.torn_down());
    assert!(is_empty(&fixture.runs_dir()));

    let pid = nix::unistd::Pid::from_raw(record.proxy_pid.unwrap());
    assert_eq!(
        nix::sys::signal::kill(pid, None),
        Err(nix::errno::Errno::ESRCH)
    );
}

#[test]
fn test_canceled_run_reports_timeout() {
    if !sandbox_available() {
        return;
    }
    let fixture = Fixture::new("sleep 30");
    let inputs = fixture.inputs();
    inputs.cancel.store(true, std::sync::atomic::Ordering::SeqCst);

    let err = fixture
        .runner
        .predict(&inputs, Duration::from_secs(30))
        .unwrap_err();
    assert_eq!(err.sandbox_kind(), Some(SandboxFailureKind::Timeout));
}
