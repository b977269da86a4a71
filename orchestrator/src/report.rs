//! Run summaries for `run` and `status`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::graph::Graph;
use crate::core::types::TaskState;
use crate::exit_codes;
use crate::io::store::PersistedRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task is `Done`.
    Complete,
    /// Nothing left to run, but some tasks are blocked.
    Blocked,
    /// Stopped by a cancellation request.
    Cancelled,
    /// Work remains (status of a run that is not active).
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub story: Option<String>,
    pub state: TaskState,
    pub attempts: u32,
    pub fix_attempts: u32,
    pub commit: Option<String>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoryRollup {
    pub id: String,
    pub title: String,
    pub counts: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub work_request_id: String,
    pub title: String,
    pub outcome: RunOutcome,
    pub tasks: Vec<TaskSummary>,
    /// Pending tasks that can never run, with the blocked tasks they wait on.
    pub blocked_by_dependency: Vec<(String, Vec<String>)>,
    pub stories: Vec<StoryRollup>,
}

impl RunReport {
    /// Summarize a persisted run. `cancelled` marks a run stopped on request;
    /// a run whose tasks all finished is complete regardless.
    pub fn from_run(run: &PersistedRun, cancelled: bool) -> Result<Self> {
        let graph = Graph::build(run.tasks.clone()).context("persisted tasks are inconsistent")?;
        let blocked_by_dependency: Vec<(String, Vec<String>)> = graph
            .blocked_by_dependency()
            .into_iter()
            .map(|(task, roots)| (task.id.clone(), roots))
            .collect();

        let all_done = graph.count_in(TaskState::Done) == graph.len();
        let settled = graph
            .tasks()
            .iter()
            .all(|t| t.state.is_terminal() || blocked_by_dependency.iter().any(|(id, _)| *id == t.id));
        let outcome = if all_done {
            RunOutcome::Complete
        } else if cancelled {
            RunOutcome::Cancelled
        } else if settled {
            RunOutcome::Blocked
        } else {
            RunOutcome::Incomplete
        };

        let stories = run
            .stories
            .iter()
            .map(|story| {
                let mut counts = BTreeMap::new();
                for task in graph
                    .tasks()
                    .iter()
                    .filter(|t| t.story.as_deref() == Some(story.id.as_str()))
                {
                    *counts.entry(task.state.as_str()).or_insert(0) += 1;
                }
                StoryRollup {
                    id: story.id.clone(),
                    title: story.title.clone(),
                    counts,
                }
            })
            .collect();

        let tasks = graph
            .tasks()
            .iter()
            .map(|t| TaskSummary {
                id: t.id.clone(),
                story: t.story.clone(),
                state: t.state,
                attempts: t.attempts,
                fix_attempts: t.fix_attempts,
                commit: t.commit.clone(),
                diagnostics: t.diagnostics.clone(),
            })
            .collect();

        Ok(Self {
            work_request_id: run.work_request_id.clone(),
            title: run.title.clone(),
            outcome,
            tasks,
            blocked_by_dependency,
            stories,
        })
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Complete => exit_codes::OK,
            RunOutcome::Blocked => exit_codes::BLOCKED,
            RunOutcome::Cancelled | RunOutcome::Incomplete => exit_codes::CANCELLED,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskSummary> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Plain-text rendering for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} ({}): {:?}",
            self.title, self.work_request_id, self.outcome
        );
        for story in &self.stories {
            let counts: Vec<String> = story
                .counts
                .iter()
                .map(|(state, n)| format!("{state}={n}"))
                .collect();
            let _ = writeln!(out, "  story {} {}: {}", story.id, story.title, counts.join(" "));
        }
        for task in &self.tasks {
            let _ = write!(
                out,
                "  {:<16} {:<10} attempts={}",
                task.id,
                task.state.as_str(),
                task.attempts
            );
            if let Some(commit) = &task.commit {
                let _ = write!(out, " commit={}", commit.get(..12).unwrap_or(commit));
            }
            out.push('\n');
            if task.state == TaskState::Blocked {
                for line in &task.diagnostics {
                    let _ = writeln!(out, "      - {line}");
                }
            }
        }
        for (id, roots) in &self.blocked_by_dependency {
            let _ = writeln!(out, "  {id} blocked by dependency on {}", roots.join(", "));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StoryHeader, Task, TaskKind};

    fn run(tasks: Vec<Task>) -> PersistedRun {
        PersistedRun {
            work_request_id: "wr".to_string(),
            title: "Work".to_string(),
            stories: vec![StoryHeader {
                id: "s".to_string(),
                title: "Story".to_string(),
            }],
            tasks,
            baseline: None,
        }
    }

    fn with_state(mut task: Task, state: TaskState) -> Task {
        task.state = state;
        task.story = Some("s".to_string());
        task
    }

    #[test]
    fn all_done_is_complete() {
        let report = RunReport::from_run(
            &run(vec![with_state(Task::new("a", TaskKind::Docs, "a"), TaskState::Done)]),
            false,
        )
        .expect("report");
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(report.exit_code(), exit_codes::OK);
        assert_eq!(report.stories[0].counts["done"], 1);
    }

    #[test]
    fn blocked_root_reports_dependents() {
        let report = RunReport::from_run(
            &run(vec![
                with_state(Task::new("a", TaskKind::Feature, "a"), TaskState::Blocked),
                with_state(
                    Task::new("b", TaskKind::Feature, "b").with_prerequisites(["a"]),
                    TaskState::Pending,
                ),
            ]),
            false,
        )
        .expect("report");
        assert_eq!(report.outcome, RunOutcome::Blocked);
        assert_eq!(
            report.blocked_by_dependency,
            vec![("b".to_string(), vec!["a".to_string()])]
        );
        assert!(report.render().contains("b blocked by dependency on a"));
    }

    #[test]
    fn interrupted_run_is_incomplete() {
        let report = RunReport::from_run(
            &run(vec![with_state(Task::new("a", TaskKind::Docs, "a"), TaskState::Running)]),
            false,
        )
        .expect("report");
        assert_eq!(report.outcome, RunOutcome::Incomplete);
    }
}
