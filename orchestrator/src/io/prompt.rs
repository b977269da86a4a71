//! Prompt rendering for execution and review agents.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{EffortTier, Task};
use crate::io::execution::{ExecutionResult, ProjectContext};

const EXECUTE_TEMPLATE: &str = include_str!("prompts/execute.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");

/// Diff bytes shown to the reviewer before truncating.
pub const REVIEW_DIFF_LIMIT: usize = 60_000;

#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    kind: &'static str,
    description: &'a str,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            kind: task.kind.as_str(),
            description: task.description.trim(),
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("execute", EXECUTE_TEMPLATE)
            .expect("execute template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        Self { env }
    }
}

/// Render the execution prompt. `feedback` carries the reasons of the last
/// rejected review and is empty on a first attempt.
pub fn render_execute(
    task: &Task,
    effort: EffortTier,
    project: &ProjectContext,
    feedback: &[String],
) -> Result<String> {
    let engine = PromptEngine::new();
    let template = engine.env.get_template("execute")?;
    let rendered = template.render(context! {
        task => TaskContext::from_task(task),
        acceptance => &task.acceptance,
        effort => effort.as_str(),
        project => project,
        feedback => feedback,
    })?;
    debug!(task = %task.id, bytes = rendered.len(), "rendered execution prompt");
    Ok(rendered)
}

/// Render the review prompt for an execution result.
pub fn render_review(
    task: &Task,
    acceptance: &[String],
    result: &ExecutionResult,
    root: &str,
) -> Result<String> {
    let (diff, diff_truncated) = truncate_at_boundary(&result.diff, REVIEW_DIFF_LIMIT);
    let engine = PromptEngine::new();
    let template = engine.env.get_template("review")?;
    let rendered = template.render(context! {
        task => TaskContext::from_task(task),
        acceptance => acceptance,
        root => root,
        summary => result.summary.trim(),
        changed_files => &result.changed_files,
        diff => diff,
        diff_truncated => diff_truncated,
    })?;
    debug!(task = %task.id, bytes = rendered.len(), diff_truncated, "rendered review prompt");
    Ok(rendered)
}

/// Cut `text` to at most `limit` bytes on a char boundary; returns the kept
/// prefix and the number of bytes dropped.
fn truncate_at_boundary(text: &str, limit: usize) -> (&str, usize) {
    if text.len() <= limit {
        return (text, 0);
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskKind;

    fn task() -> Task {
        let mut task = Task::new("D", TaskKind::Feature, "Add retry to the HTTP client");
        task.acceptance = vec!["retries 3 times".to_string()];
        task
    }

    fn project() -> ProjectContext {
        ProjectContext {
            root: "/repo".to_string(),
            work_request: Some("Harden client".to_string()),
            story: Some("Resilience".to_string()),
            completed: vec!["A: Add config".to_string()],
        }
    }

    #[test]
    fn execute_prompt_includes_task_and_effort() {
        let out = render_execute(&task(), EffortTier::Standard, &project(), &[]).expect("render");
        assert!(out.contains("## Task D (feature)"));
        assert!(out.contains("Add retry to the HTTP client"));
        assert!(out.contains("- retries 3 times"));
        assert!(out.contains("Effort tier: **standard**"));
        assert!(out.contains("- A: Add config"));
        assert!(!out.contains("Reviewer feedback"));
    }

    #[test]
    fn execute_prompt_carries_feedback_on_fix_attempt() {
        let feedback = vec!["logic: missing error handling".to_string()];
        let out = render_execute(&task(), EffortTier::Deep, &project(), &feedback).expect("render");
        assert!(out.contains("Reviewer feedback"));
        assert!(out.contains("- logic: missing error handling"));
        assert!(out.contains("Effort tier: **deep**"));
    }

    #[test]
    fn review_prompt_truncates_large_diffs() {
        let result = ExecutionResult {
            summary: "did it".to_string(),
            changed_files: vec!["src/a.rs".to_string()],
            diff: "x".repeat(REVIEW_DIFF_LIMIT + 10),
        };
        let t = task();
        let out = render_review(&t, &t.acceptance, &result, "/repo").expect("render");
        assert!(out.contains("Files: src/a.rs"));
        assert!(out.contains("[diff truncated: 10 more bytes not shown]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (kept, dropped) = truncate_at_boundary("aé", 2);
        assert_eq!(kept, "a");
        assert_eq!(dropped, 2);
    }
}
