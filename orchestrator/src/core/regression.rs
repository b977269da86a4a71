//! Test-run snapshots and regression comparison.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one test in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Parsed result of one test-suite run, keyed by stable test identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    pub results: BTreeMap<String, TestStatus>,
}

impl TestRun {
    pub fn record(&mut self, id: impl Into<String>, status: TestStatus) {
        let id = id.into();
        // A test reported twice counts as failed if either report failed.
        let entry = self.results.entry(id).or_insert(status);
        if status == TestStatus::Failed {
            *entry = TestStatus::Failed;
        }
    }

    fn ids_with(&self, status: TestStatus) -> BTreeSet<String> {
        self.results
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Test-suite state captured before any task of a work request runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub passed: usize,
    pub failed: usize,
    pub passing: BTreeSet<String>,
    pub failing: BTreeSet<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl BaselineSnapshot {
    pub fn from_run(run: &TestRun) -> Self {
        let passing = run.ids_with(TestStatus::Passed);
        let failing = run.ids_with(TestStatus::Failed);
        Self {
            passed: passing.len(),
            failed: failing.len(),
            passing,
            failing,
            captured_at: None,
        }
    }
}

/// Difference between the baseline and a post-task run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegressionReport {
    /// Passing in the baseline, failing now.
    pub regressions: Vec<String>,
    /// Failing in the baseline and still failing; not the task's responsibility.
    pub preexisting: Vec<String>,
    /// Failing now but absent from the baseline.
    pub new_failures: Vec<String>,
    /// Failing in the baseline, passing now.
    pub fixed: Vec<String>,
}

impl RegressionReport {
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    /// No test changed outcome. Preexisting failures are carried over, not changes.
    pub fn is_empty(&self) -> bool {
        self.regressions.is_empty() && self.new_failures.is_empty() && self.fixed.is_empty()
    }
}

/// Compare two snapshots. Only baseline-passing tests that now fail are regressions.
pub fn compare(baseline: &BaselineSnapshot, current: &BaselineSnapshot) -> RegressionReport {
    let mut report = RegressionReport::default();
    for id in &current.failing {
        if baseline.passing.contains(id) {
            report.regressions.push(id.clone());
        } else if baseline.failing.contains(id) {
            report.preexisting.push(id.clone());
        } else {
            report.new_failures.push(id.clone());
        }
    }
    report.fixed = baseline
        .failing
        .intersection(&current.passing)
        .cloned()
        .collect();
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, TestStatus)]) -> BaselineSnapshot {
        let mut run = TestRun::default();
        for (id, status) in entries {
            run.record(*id, *status);
        }
        BaselineSnapshot::from_run(&run)
    }

    #[test]
    fn identical_snapshots_have_no_regressions() {
        let base = snapshot(&[("a", TestStatus::Passed), ("b", TestStatus::Passed)]);
        let report = compare(&base, &base);
        assert!(report.is_empty());
        assert_eq!(report, RegressionReport::default());
    }

    #[test]
    fn identical_snapshots_with_preexisting_failures_report_no_regressions() {
        let base = snapshot(&[("a", TestStatus::Passed), ("b", TestStatus::Failed)]);
        let report = compare(&base, &base);
        assert!(!report.has_regressions());
        assert_eq!(report.preexisting, vec!["b".to_string()]);
        assert!(report.is_empty());
    }

    #[test]
    fn passing_to_failing_is_a_regression() {
        let base = snapshot(&[("a", TestStatus::Passed), ("b", TestStatus::Failed)]);
        let current = snapshot(&[
            ("a", TestStatus::Failed),
            ("b", TestStatus::Failed),
            ("c", TestStatus::Failed),
        ]);
        let report = compare(&base, &current);
        assert_eq!(report.regressions, vec!["a".to_string()]);
        assert_eq!(report.preexisting, vec!["b".to_string()]);
        assert_eq!(report.new_failures, vec!["c".to_string()]);
    }

    #[test]
    fn fixed_tests_are_reported_separately() {
        let base = snapshot(&[("a", TestStatus::Failed)]);
        let current = snapshot(&[("a", TestStatus::Passed)]);
        let report = compare(&base, &current);
        assert!(!report.has_regressions());
        assert_eq!(report.fixed, vec!["a".to_string()]);
    }

    #[test]
    fn duplicate_reports_fail_closed() {
        let mut run = TestRun::default();
        run.record("a", TestStatus::Passed);
        run.record("a", TestStatus::Failed);
        run.record("a", TestStatus::Passed);
        assert_eq!(run.results["a"], TestStatus::Failed);
    }
}
