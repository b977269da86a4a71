//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between core components and the
//! persisted state file. They must not depend on external state or I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification tag declared for every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
    Config,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Feature => "feature",
            TaskKind::Bugfix => "bugfix",
            TaskKind::Refactor => "refactor",
            TaskKind::Test => "test",
            TaskKind::Docs => "docs",
            TaskKind::Config => "config",
        }
    }
}

/// Lifecycle state of a task.
///
/// `Done` and `Blocked` are terminal. Every other state is transient and is
/// persisted before the scheduler yields control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not yet graph-validated, or waiting on prerequisites.
    Pending,
    /// Every prerequisite is `Done`.
    Ready,
    /// Assigned to a worker, execution in progress.
    Running,
    /// Execution finished, awaiting review and the quality gate.
    Verifying,
    /// Review approved, commit pending.
    Passed,
    /// Committed.
    Done,
    /// The latest attempt failed, next step not yet decided.
    Failed,
    /// Waiting for the next attempt (backoff or fix loop).
    Retrying,
    /// Terminal failure.
    Blocked,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Blocked)
    }

    /// States owned by a worker or by an undecided outcome.
    ///
    /// A task persisted in one of these states has nobody driving it after a
    /// restart.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskState::Running
                | TaskState::Verifying
                | TaskState::Passed
                | TaskState::Failed
                | TaskState::Retrying
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Verifying => "verifying",
            TaskState::Passed => "passed",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Blocked => "blocked",
        }
    }
}

/// Hint controlling how much reasoning budget the execution agent applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortTier {
    Minimal,
    Standard,
    Deep,
}

impl EffortTier {
    /// The next tier up, saturating at `Deep`.
    pub fn raised(self) -> Self {
        match self {
            EffortTier::Minimal => EffortTier::Standard,
            EffortTier::Standard | EffortTier::Deep => EffortTier::Deep,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EffortTier::Minimal => "minimal",
            EffortTier::Standard => "standard",
            EffortTier::Deep => "deep",
        }
    }
}

/// Repository reference captured before a task starts running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// Task the checkpoint protects.
    pub task_id: String,
    /// Full HEAD sha at capture time.
    pub head: String,
}

/// The atomic schedulable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    /// Owning story, filled in when a work request is flattened.
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default = "pending")]
    pub state: TaskState,
    /// Number of times the task entered `Running`.
    #[serde(default)]
    pub attempts: u32,
    /// Number of verification rejections (review or regression).
    #[serde(default)]
    pub fix_attempts: u32,
    #[serde(default)]
    pub effort: Option<EffortTier>,
    /// Reasons from the most recent verification rejection.
    #[serde(default)]
    pub verification_reasons: Option<Vec<String>>,
    /// Operator-facing diagnostics accumulated across attempts.
    #[serde(default)]
    pub diagnostics: Vec<String>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointRef>,
    /// Files reported changed by the latest execution.
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn pending() -> TaskState {
    TaskState::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind,
            prerequisites: Vec::new(),
            acceptance: Vec::new(),
            story: None,
            state: TaskState::Pending,
            attempts: 0,
            fix_attempts: 0,
            effort: None,
            verification_reasons: None,
            diagnostics: Vec::new(),
            checkpoint: None,
            changed_files: Vec::new(),
            commit: None,
            updated_at: None,
        }
    }

    pub fn with_prerequisites<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites = prerequisites.into_iter().map(Into::into).collect();
        self
    }

    /// First line of the description, used for commit subjects.
    pub fn headline(&self) -> &str {
        self.description.lines().next().unwrap_or("").trim()
    }
}

/// A story groups tasks inside a work request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub tasks: Vec<Task>,
}

/// Top-level decomposed unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub id: String,
    pub title: String,
    pub stories: Vec<Story>,
}

impl WorkRequest {
    /// Flatten stories into the ordered task list, tagging each task with its story.
    pub fn into_tasks(self) -> Vec<Task> {
        let mut tasks = Vec::new();
        for story in self.stories {
            for mut task in story.tasks {
                task.story = Some(story.id.clone());
                tasks.push(task);
            }
        }
        tasks
    }

    pub fn story_headers(&self) -> Vec<StoryHeader> {
        self.stories
            .iter()
            .map(|story| StoryHeader {
                id: story.id.clone(),
                title: story.title.clone(),
            })
            .collect()
    }
}

/// Story identity kept in the persisted state (tasks are stored flat).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryHeader {
    pub id: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_raise_saturates_at_deep() {
        assert_eq!(EffortTier::Minimal.raised(), EffortTier::Standard);
        assert_eq!(EffortTier::Standard.raised(), EffortTier::Deep);
        assert_eq!(EffortTier::Deep.raised(), EffortTier::Deep);
    }

    #[test]
    fn in_flight_states_exclude_schedulable_and_terminal() {
        for state in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Done,
            TaskState::Blocked,
        ] {
            assert!(!state.is_in_flight(), "{state:?}");
        }
        assert!(TaskState::Running.is_in_flight());
        assert!(TaskState::Verifying.is_in_flight());
    }

    #[test]
    fn minimal_task_record_deserializes_with_defaults() {
        let task: Task =
            serde_json::from_str(r#"{"id":"a","description":"do it","kind":"docs"}"#)
                .expect("parse");
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.prerequisites.is_empty());
        assert!(task.checkpoint.is_none());
    }

    #[test]
    fn flattening_tags_tasks_with_story() {
        let request = WorkRequest {
            id: "wr".to_string(),
            title: "WR".to_string(),
            stories: vec![Story {
                id: "s1".to_string(),
                title: "Story".to_string(),
                tasks: vec![Task::new("a", TaskKind::Feature, "A")],
            }],
        };
        let tasks = request.into_tasks();
        assert_eq!(tasks[0].story.as_deref(), Some("s1"));
    }
}
