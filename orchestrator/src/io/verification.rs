//! Verification agent adapter.
//!
//! Each review launches a fresh reviewer agent, so the verdict cannot lean on
//! anything the executing agent said about its own work beyond the summary
//! that is shown to the reviewer as a claim.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::Failure;
use crate::core::types::{EffortTier, Task};
use crate::core::verdict::{Review, VerificationResult};
use crate::io::agent::{AgentLauncher, AgentRole, InvokeRequest, parse_reply_json};
use crate::io::execution::ExecutionResult;
use crate::io::prompt::render_review;

pub struct VerificationAdapter {
    launcher: Arc<dyn AgentLauncher>,
    timeout: Duration,
}

impl VerificationAdapter {
    pub fn new(launcher: Arc<dyn AgentLauncher>, timeout: Duration) -> Self {
        Self { launcher, timeout }
    }

    /// Review an execution result in `workdir` against the task's acceptance criteria.
    ///
    /// The fail-closed policy is applied by [`VerificationResult::from_review`];
    /// nothing here can turn a blocking finding into a pass.
    #[instrument(skip_all, fields(task = %task.id))]
    pub fn verify(
        &self,
        task: &Task,
        result: &ExecutionResult,
        workdir: &Path,
        log_path: Option<PathBuf>,
        cancel: &CancelToken,
    ) -> Result<VerificationResult, Failure> {
        let root = workdir.display().to_string();
        let prompt = render_review(task, &task.acceptance, result, &root).map_err(|e| {
            warn!(err = %format!("{e:#}"), "review prompt failed to render");
            Failure::Validation("review prompt could not be rendered".to_string())
        })?;

        let reviewer = self.launcher.launch(AgentRole::Reviewer);
        let reply = reviewer.invoke(
            &InvokeRequest {
                label: task.id.clone(),
                workdir: workdir.to_path_buf(),
                prompt,
                // Reviews always run at the standard tier.
                effort: EffortTier::Standard,
                timeout: self.timeout,
                log_path,
            },
            cancel,
        )?;

        let review: Review = parse_reply_json(AgentRole::Reviewer.as_str(), &reply.text)?;
        let verdict = VerificationResult::from_review(&review);
        info!(
            approved = review.approved,
            findings = review.findings.len(),
            passed = verdict.passed(),
            "review finished"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskKind;
    use crate::test_support::{ScriptedLauncher, approve_reply};

    fn verify_with(reply: &str) -> Result<VerificationResult, Failure> {
        let launcher = ScriptedLauncher::new();
        launcher.script_reviewer("A", vec![Ok(reply.to_string())]);
        let adapter = VerificationAdapter::new(Arc::new(launcher), Duration::from_secs(5));
        let task = Task::new("A", TaskKind::Feature, "do a");
        adapter.verify(
            &task,
            &ExecutionResult {
                summary: "all good, tests pass".to_string(),
                ..ExecutionResult::default()
            },
            Path::new("/worktrees/A"),
            None,
            &CancelToken::new(),
        )
    }

    #[test]
    fn approval_passes() {
        let verdict = verify_with(&approve_reply()).expect("verify");
        assert!(verdict.passed());
    }

    #[test]
    fn security_finding_fails_even_when_approved() {
        let verdict = verify_with(
            r#"{"approved": true, "findings": [{"category": "security", "message": "token logged"}]}"#,
        )
        .expect("verify");
        assert!(!verdict.passed());
        assert_eq!(verdict.reasons(), ["security: token logged"]);
    }

    #[test]
    fn unreadable_review_is_a_failure_not_a_pass() {
        let err = verify_with("LGTM!").unwrap_err();
        assert!(matches!(err, Failure::MalformedReply(_)));
    }

    #[test]
    fn review_uses_reviewer_role() {
        let launcher = ScriptedLauncher::new();
        let adapter = VerificationAdapter::new(Arc::new(launcher.clone()), Duration::from_secs(5));
        let task = Task::new("A", TaskKind::Docs, "doc");
        adapter
            .verify(
                &task,
                &ExecutionResult::default(),
                Path::new("/worktrees/A"),
                None,
                &CancelToken::new(),
            )
            .expect("verify");
        let calls = launcher.invocations("A");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].role, AgentRole::Reviewer);
        assert_eq!(calls[0].workdir, PathBuf::from("/worktrees/A"));
    }
}
