//! Quality gate: test-suite runs and regression checks.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::{Failure, failure_from_diagnostics};
use crate::core::regression::{BaselineSnapshot, RegressionReport, TestRun, TestStatus, compare};
use crate::io::process::{Termination, run_command_with_timeout};

const PHASE: &str = "tests";

#[derive(Debug, Clone)]
pub struct TestRequest {
    /// Tree to test; the project root when `None`.
    pub workdir: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
}

/// Runs the project's test suite and reports per-test outcomes.
///
/// Test identifiers must be stable across runs for regression diffing.
pub trait TestRunner: Send + Sync {
    fn run(&self, request: &TestRequest, cancel: &CancelToken) -> Result<TestRun, Failure>;
}

/// Test runner backed by a configured command.
///
/// A failing suite is an expected outcome and is not an error; only runs that
/// produce no recognizable results, time out, or are cancelled are failures.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run(&self, request: &TestRequest, cancel: &CancelToken) -> Result<TestRun, Failure> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(Failure::Validation("test command is empty".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(request.workdir.as_ref().unwrap_or(&self.workdir));

        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes, cancel)
            .map_err(|e| failure_from_diagnostics(PHASE, &format!("{e:#}")))?;

        if let Some(path) = &request.log_path {
            let written = path
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(path, output.render_log(PHASE)));
            if let Err(e) = written {
                warn!(err = %e, path = %path.display(), "failed to write test log");
            }
        }

        match output.termination {
            Termination::Cancelled => return Err(Failure::Cancelled),
            Termination::TimedOut => {
                return Err(Failure::Timeout {
                    phase: PHASE.to_string(),
                    after: self.timeout,
                });
            }
            Termination::Exited => {}
        }

        let combined = format!("{}\n{}", output.stdout_lossy(), output.stderr_lossy());
        let run = parse_test_output(&combined);
        if run.results.is_empty() {
            if output.success() {
                // An empty suite is a valid, if uninformative, baseline.
                return Ok(run);
            }
            warn!(exit_code = ?output.status.code(), "test command failed without test results");
            return Err(failure_from_diagnostics(PHASE, &combined));
        }
        info!(tests = run.results.len(), exit_code = ?output.status.code(), "test run parsed");
        Ok(run)
    }
}

static CARGO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test (\S+) \.\.\. (ok|FAILED|ignored)").expect("cargo test regex")
});
static PYTEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+::\S+) (PASSED|FAILED|ERROR)").expect("pytest regex")
});
static GO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*--- (PASS|FAIL): (\S+)").expect("go test regex"));

/// Extract per-test outcomes from cargo, pytest (`-v`) or `go test -v` output.
pub fn parse_test_output(output: &str) -> TestRun {
    let mut run = TestRun::default();
    for line in output.lines() {
        let line = line.trim_end();
        if let Some(caps) = CARGO_RE.captures(line) {
            match &caps[2] {
                "ok" => run.record(&caps[1], TestStatus::Passed),
                "FAILED" => run.record(&caps[1], TestStatus::Failed),
                _ => {}
            }
        } else if let Some(caps) = PYTEST_RE.captures(line) {
            let status = if &caps[2] == "PASSED" {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            };
            run.record(&caps[1], status);
        } else if let Some(caps) = GO_RE.captures(line) {
            let status = if &caps[1] == "PASS" {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            };
            run.record(&caps[2], status);
        }
    }
    run
}

pub struct QualityGate {
    runner: Arc<dyn TestRunner>,
}

impl QualityGate {
    pub fn new(runner: Arc<dyn TestRunner>) -> Self {
        Self { runner }
    }

    /// Run the suite once and capture the outcome as a baseline.
    #[instrument(skip_all)]
    pub fn snapshot(
        &self,
        request: &TestRequest,
        cancel: &CancelToken,
    ) -> Result<BaselineSnapshot, Failure> {
        let run = self.runner.run(request, cancel)?;
        let mut snapshot = BaselineSnapshot::from_run(&run);
        snapshot.captured_at = Some(Utc::now());
        info!(passed = snapshot.passed, failed = snapshot.failed, "snapshot captured");
        Ok(snapshot)
    }

    /// Run the suite and compare it to `baseline`.
    #[instrument(skip_all)]
    pub fn check(
        &self,
        baseline: &BaselineSnapshot,
        request: &TestRequest,
        cancel: &CancelToken,
    ) -> Result<RegressionReport, Failure> {
        let current = self.snapshot(request, cancel)?;
        let report = compare(baseline, &current);
        if report.has_regressions() {
            warn!(regressions = ?report.regressions, "regressions detected");
        } else if !report.is_empty() {
            info!(
                new_failures = ?report.new_failures,
                fixed = ?report.fixed,
                "suite changed without regressions"
            );
        }
        Ok(report)
    }
}
