//! Execution agent adapter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::Failure;
use crate::core::types::{EffortTier, Task};
use crate::io::agent::{AgentLauncher, AgentRole, InvokeRequest, parse_reply_json};
use crate::io::prompt::render_execute;
use crate::io::safety::GitSafety;

/// Project-level context handed to the execution agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectContext {
    pub root: String,
    pub work_request: Option<String>,
    pub story: Option<String>,
    /// `"<id>: <headline>"` for tasks already committed.
    pub completed: Vec<String>,
}

/// What an execution produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub summary: String,
    pub changed_files: Vec<String>,
    pub diff: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplyStatus {
    Done,
    Unsatisfiable,
}

#[derive(Debug, Clone, Deserialize)]
struct ExecutionReply {
    status: ReplyStatus,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    changed_files: Vec<String>,
}

/// Per-attempt parameters.
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub task: &'a Task,
    pub effort: EffortTier,
    pub project: &'a ProjectContext,
    /// Reasons from the last rejected review; empty on first attempts.
    pub feedback: &'a [String],
    /// The task's worktree.
    pub workdir: PathBuf,
    pub log_path: Option<PathBuf>,
}

pub struct ExecutionAdapter {
    launcher: Arc<dyn AgentLauncher>,
    safety: Arc<GitSafety>,
    timeout: Duration,
}

impl ExecutionAdapter {
    pub fn new(
        launcher: Arc<dyn AgentLauncher>,
        safety: Arc<GitSafety>,
        timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            safety,
            timeout,
        }
    }

    /// Run the execution agent for one attempt and collect its changeset.
    ///
    /// The changeset is read from the task's worktree; the paths the agent
    /// reports are only compared against it.
    #[instrument(skip_all, fields(task = %request.task.id, effort = request.effort.as_str(), fix = !request.feedback.is_empty()))]
    pub fn execute(
        &self,
        request: &ExecutionRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, Failure> {
        let prompt = render_execute(request.task, request.effort, request.project, request.feedback)
            .map_err(|e| {
                warn!(err = %format!("{e:#}"), "execution prompt failed to render");
                Failure::Validation("execution prompt could not be rendered".to_string())
            })?;

        let agent = self.launcher.launch(AgentRole::Executor);
        let reply = agent.invoke(
            &InvokeRequest {
                label: request.task.id.clone(),
                workdir: request.workdir.clone(),
                prompt,
                effort: request.effort,
                timeout: self.timeout,
                log_path: request.log_path.clone(),
            },
            cancel,
        )?;

        let parsed: ExecutionReply = parse_reply_json(AgentRole::Executor.as_str(), &reply.text)?;
        if parsed.status == ReplyStatus::Unsatisfiable {
            warn!("agent reported the task unsatisfiable");
            return Err(Failure::MalformedTask(format!(
                "execution agent declined task {}",
                request.task.id
            )));
        }

        let (changed_files, diff) = self.safety.changes(&request.task.id).map_err(|e| {
            warn!(err = %format!("{e:#}"), "changeset collection failed");
            Failure::Unrecognized {
                phase: "diff collection".to_string(),
            }
        })?;
        let unchanged: Vec<String> = normalize_paths(parsed.changed_files)
            .into_iter()
            .filter(|path| !changed_files.contains(path))
            .collect();
        if !unchanged.is_empty() {
            debug!(?unchanged, "agent reported paths it did not change");
        }
        info!(files = changed_files.len(), diff_bytes = diff.len(), "execution finished");
        Ok(ExecutionResult {
            summary: parsed.summary,
            changed_files,
            diff,
        })
    }
}

/// Trim, drop empties and `./` prefixes, and dedupe reported paths.
fn normalize_paths(paths: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in paths {
        let path = path.trim();
        let path = path.strip_prefix("./").unwrap_or(path);
        if path.is_empty() || out.iter().any(|p| p == path) {
            continue;
        }
        out.push(path.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskKind;
    use crate::test_support::{RecordingVcs, ScriptedLauncher, done_reply};

    fn adapter(launcher: ScriptedLauncher, vcs: RecordingVcs) -> ExecutionAdapter {
        ExecutionAdapter::new(
            Arc::new(launcher),
            Arc::new(GitSafety::new(Box::new(vcs))),
            Duration::from_secs(5),
        )
    }

    fn execute(adapter: &ExecutionAdapter, task: &Task) -> Result<ExecutionResult, Failure> {
        let project = ProjectContext::default();
        adapter.execute(
            &ExecutionRequest {
                task,
                effort: EffortTier::Standard,
                project: &project,
                feedback: &[],
                workdir: PathBuf::from("/worktrees/A"),
                log_path: None,
            },
            &CancelToken::new(),
        )
    }

    #[test]
    fn changeset_comes_from_the_worktree_not_the_reply() {
        let launcher = ScriptedLauncher::new();
        launcher.script_executor("A", vec![Ok(done_reply(&["./src/a.rs", "src/claimed.rs"]))]);
        let vcs = RecordingVcs::new();
        vcs.set_changed_files("A", &["src/a.rs", "src/extra.rs"]);
        let task = Task::new("A", TaskKind::Feature, "do a");

        let result = execute(&adapter(launcher.clone(), vcs), &task).expect("execute");
        assert_eq!(result.changed_files, vec!["src/a.rs", "src/extra.rs"]);
        let calls = launcher.invocations("A");
        assert_eq!(calls[0].effort, EffortTier::Standard);
        assert_eq!(calls[0].workdir, PathBuf::from("/worktrees/A"));
    }

    #[test]
    fn unsatisfiable_reply_is_malformed_task() {
        let launcher = ScriptedLauncher::new();
        launcher.script_executor(
            "A",
            vec![Ok(r#"{"status":"unsatisfiable","summary":"contradiction"}"#.to_string())],
        );
        let task = Task::new("A", TaskKind::Feature, "do a");
        let err = execute(&adapter(launcher, RecordingVcs::new()), &task).unwrap_err();
        assert!(matches!(err, Failure::MalformedTask(_)));
    }

    #[test]
    fn normalizes_reported_paths() {
        let paths = normalize_paths(vec![
            "./src/a.rs".to_string(),
            "src/a.rs".to_string(),
            " ".to_string(),
        ]);
        assert_eq!(paths, vec!["src/a.rs"]);
    }
}
