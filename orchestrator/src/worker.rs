//! One attempt of one task: execution, review, quality gate.
//!
//! Workers never change task state. They report progress to the scheduler over
//! a channel and the scheduler applies every transition.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::Failure;
use crate::core::regression::BaselineSnapshot;
use crate::core::types::{EffortTier, Task};
use crate::io::execution::{ExecutionAdapter, ExecutionRequest, ProjectContext};
use crate::io::init::OrchestratorPaths;
use crate::io::quality::{QualityGate, TestRequest};
use crate::io::verification::VerificationAdapter;

/// Adapters shared by every worker.
pub struct Pipeline {
    pub execution: ExecutionAdapter,
    pub verification: VerificationAdapter,
    pub gate: QualityGate,
    pub paths: OrchestratorPaths,
}

/// Everything a worker needs for one attempt; owned so it can move to a thread.
#[derive(Debug, Clone)]
pub struct AttemptJob {
    pub task: Task,
    pub attempt: u32,
    pub effort: EffortTier,
    /// Reasons of the last rejected review, for fix attempts.
    pub feedback: Vec<String>,
    /// The task's worktree.
    pub workdir: PathBuf,
    pub project: ProjectContext,
    pub baseline: Arc<BaselineSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Execution finished; review and tests are starting.
    Verifying { task: String },
    Finished { task: String, outcome: AttemptOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Review approved and no regressions.
    Approved { changed_files: Vec<String> },
    /// Review or quality gate rejected the change.
    Rejected {
        reasons: Vec<String>,
        regressions: Vec<String>,
        changed_files: Vec<String>,
    },
    /// A raised failure, to be classified by the scheduler.
    Failed {
        failure: Failure,
        changed_files: Vec<String>,
    },
    /// Stopped by cancellation; the task stays where it is for recovery.
    Cancelled,
}

impl Pipeline {
    /// Run one attempt and report `Verifying` and `Finished` on `events`.
    ///
    /// A panic inside the attempt is reported as an unrecognized failure so the
    /// scheduler never waits on a worker that is gone.
    pub fn run_attempt(&self, job: AttemptJob, events: &Sender<WorkerEvent>, cancel: &CancelToken) {
        let task = job.task.id.clone();
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.attempt(&job, events, cancel))) {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task = %task, "worker panicked");
                AttemptOutcome::Failed {
                    failure: Failure::Unrecognized {
                        phase: "worker".to_string(),
                    },
                    changed_files: Vec::new(),
                }
            }
        };
        if events.send(WorkerEvent::Finished { task, outcome }).is_err() {
            debug!("scheduler gone before attempt finished");
        }
    }

    #[instrument(skip_all, fields(task = %job.task.id, attempt = job.attempt, effort = job.effort.as_str()))]
    fn attempt(
        &self,
        job: &AttemptJob,
        events: &Sender<WorkerEvent>,
        cancel: &CancelToken,
    ) -> AttemptOutcome {
        let task = &job.task;
        let result = match self.execution.execute(
            &ExecutionRequest {
                task,
                effort: job.effort,
                project: &job.project,
                feedback: &job.feedback,
                workdir: job.workdir.clone(),
                log_path: Some(self.paths.attempt_log(&task.id, job.attempt, "execution")),
            },
            cancel,
        ) {
            Ok(result) => result,
            Err(failure) => return failed(failure, Vec::new()),
        };

        if events
            .send(WorkerEvent::Verifying {
                task: task.id.clone(),
            })
            .is_err()
        {
            return AttemptOutcome::Cancelled;
        }

        let verdict = match self.verification.verify(
            task,
            &result,
            &job.workdir,
            Some(self.paths.attempt_log(&task.id, job.attempt, "verification")),
            cancel,
        ) {
            Ok(verdict) => verdict,
            Err(failure) => return failed(failure, result.changed_files),
        };

        let report = match self.gate.check(
            &job.baseline,
            &TestRequest {
                workdir: Some(job.workdir.clone()),
                log_path: Some(self.paths.attempt_log(&task.id, job.attempt, "tests")),
            },
            cancel,
        ) {
            Ok(report) => report,
            Err(failure) => return failed(failure, result.changed_files),
        };

        let verdict = verdict.with_regressions(&report);
        if verdict.passed() {
            info!("attempt approved");
            AttemptOutcome::Approved {
                changed_files: result.changed_files,
            }
        } else {
            info!(reasons = verdict.reasons().len(), "attempt rejected");
            AttemptOutcome::Rejected {
                reasons: verdict.into_reasons(),
                regressions: report.regressions,
                changed_files: result.changed_files,
            }
        }
    }
}

fn failed(failure: Failure, changed_files: Vec<String>) -> AttemptOutcome {
    if failure == Failure::Cancelled {
        return AttemptOutcome::Cancelled;
    }
    warn!(failure = %failure, "attempt failed");
    AttemptOutcome::Failed {
        failure,
        changed_files,
    }
}
