//! Fail-closed verification verdicts.
//!
//! A `VerificationResult` can only report `passed = true` when no finding of a
//! blocking category is present. Its fields are private so no caller can build
//! an approving result around a security or logic finding.

use serde::{Deserialize, Serialize};

use crate::core::regression::RegressionReport;

/// Category of a reviewer finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    Security,
    LogicDefect,
    /// Acceptance criteria not met.
    Incomplete,
    /// Non-blocking remark.
    Advisory,
}

impl FindingCategory {
    pub fn is_blocking(self) -> bool {
        !matches!(self, FindingCategory::Advisory)
    }

    fn prefix(self) -> &'static str {
        match self {
            FindingCategory::Security => "security",
            FindingCategory::LogicDefect => "logic",
            FindingCategory::Incomplete => "incomplete",
            FindingCategory::Advisory => "note",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: FindingCategory,
    pub message: String,
}

/// Raw reviewer verdict as parsed from the review agent's reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub approved: bool,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    passed: bool,
    reasons: Vec<String>,
}

impl VerificationResult {
    /// Apply the fail-closed policy to a review.
    ///
    /// Any blocking finding forces `passed = false`, regardless of `approved`.
    pub fn from_review(review: &Review) -> Self {
        let blocking = review.findings.iter().any(|f| f.category.is_blocking());
        let mut reasons: Vec<String> = review
            .findings
            .iter()
            .filter(|f| f.category.is_blocking())
            .map(|f| format!("{}: {}", f.category.prefix(), f.message.trim()))
            .collect();
        let passed = review.approved && !blocking;
        if !passed && reasons.is_empty() {
            reasons.push("reviewer rejected the change without details".to_string());
        }
        Self { passed, reasons }
    }

    /// Fold a quality-gate report in. Regressions force a rejection even if the
    /// review approved.
    pub fn with_regressions(mut self, report: &RegressionReport) -> Self {
        if report.has_regressions() {
            self.passed = false;
            self.reasons.push(format!(
                "regression: previously passing tests now fail: {}",
                report.regressions.join(", ")
            ));
        }
        self
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn into_reasons(self) -> Vec<String> {
        self.reasons
    }
}
