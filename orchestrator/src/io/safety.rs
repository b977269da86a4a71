//! Git safety layer: per-task worktrees with serialized checkpoint, commit
//! and rollback.
//!
//! Each task attempt edits its own detached worktree, so a task's changeset is
//! exactly what its worktree holds. Committing applies that changeset onto the
//! main HEAD; rolling back removes the worktree. Every repository-mutating
//! call goes through a single exclusive lock.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{CheckpointRef, Task};
use crate::io::git::Git;

/// Version-control primitives the safety layer needs.
pub trait Vcs: Send + Sync {
    /// HEAD of the main working tree.
    fn head(&self) -> Result<String>;
    /// Directory of `task`'s worktree.
    fn worktree_path(&self, task: &str) -> PathBuf;
    /// Create `task`'s worktree detached at `head`, replacing a stale one.
    fn add_worktree(&self, task: &str, head: &str) -> Result<()>;
    /// Remove `task`'s worktree and everything in it; no-op when absent.
    fn remove_worktree(&self, task: &str) -> Result<()>;
    /// Paths changed in `task`'s worktree.
    fn changed_files(&self, task: &str) -> Result<Vec<String>>;
    /// Diff of every change in `task`'s worktree.
    fn diff(&self, task: &str) -> Result<String>;
    /// Commit `task`'s worktree and apply it onto the main HEAD; returns the new HEAD.
    fn commit(&self, task: &str, message: &str) -> Result<String>;
}

/// [`Vcs`] over the `git` CLI, with task worktrees under `worktrees_dir`.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    main: Git,
    worktrees_dir: PathBuf,
}

impl GitWorktrees {
    pub fn new(root: &Path, worktrees_dir: &Path) -> Self {
        Self {
            main: Git::new(root),
            worktrees_dir: worktrees_dir.to_path_buf(),
        }
    }

    fn tree(&self, task: &str) -> Git {
        Git::new(self.worktree_path(task))
    }
}

impl Vcs for GitWorktrees {
    fn head(&self) -> Result<String> {
        self.main.head_sha()
    }

    fn worktree_path(&self, task: &str) -> PathBuf {
        self.worktrees_dir.join(task)
    }

    fn add_worktree(&self, task: &str, head: &str) -> Result<()> {
        let path = self.worktree_path(task);
        self.main.worktree_remove(&path)?;
        self.main
            .worktree_add(&path, head)
            .with_context(|| format!("create worktree for {task}"))
    }

    fn remove_worktree(&self, task: &str) -> Result<()> {
        self.main.worktree_remove(&self.worktree_path(task))
    }

    fn changed_files(&self, task: &str) -> Result<Vec<String>> {
        self.tree(task).changed_paths()
    }

    fn diff(&self, task: &str) -> Result<String> {
        self.tree(task).diff_paths(&[])
    }

    fn commit(&self, task: &str, message: &str) -> Result<String> {
        let tree = self.tree(task);
        tree.add_all()?;
        let sha = tree.commit_staged_allow_empty(message)?;
        self.main
            .cherry_pick(&sha)
            .with_context(|| format!("apply {task} onto HEAD"))
    }
}

/// Commit subject for a finished task; always names the task id.
pub fn commit_message(task: &Task) -> String {
    let headline = task.headline();
    let mut msg = if headline.is_empty() {
        format!("task({}): {}", task.id, task.kind.as_str())
    } else {
        format!("task({}): {headline}", task.id)
    };
    msg.push_str(&format!(
        "\n\nkind: {}\nattempts: {}",
        task.kind.as_str(),
        task.attempts
    ));
    if let Some(story) = &task.story {
        msg.push_str(&format!("\nstory: {story}"));
    }
    msg
}

pub struct GitSafety {
    vcs: Box<dyn Vcs>,
    lock: Mutex<()>,
}

impl GitSafety {
    pub fn new(vcs: Box<dyn Vcs>) -> Self {
        Self {
            vcs,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("git safety lock poisoned"))
    }

    /// Record the current HEAD for `task_id` and give the task a fresh worktree there.
    #[instrument(skip_all, fields(task = task_id))]
    pub fn checkpoint(&self, task_id: &str) -> Result<CheckpointRef> {
        let _guard = self.guard()?;
        let head = self.vcs.head()?;
        self.vcs.add_worktree(task_id, &head)?;
        debug!(head = %head, "checkpoint captured");
        Ok(CheckpointRef {
            task_id: task_id.to_string(),
            head,
        })
    }

    /// Where `task_id`'s agents and tests run.
    pub fn workdir(&self, task_id: &str) -> PathBuf {
        self.vcs.worktree_path(task_id)
    }

    /// Files the task changed and their diff, read together.
    pub fn changes(&self, task_id: &str) -> Result<(Vec<String>, String)> {
        let _guard = self.guard()?;
        let files = self.vcs.changed_files(task_id)?;
        let diff = self.vcs.diff(task_id)?;
        Ok((files, diff))
    }

    /// Commit the task's changes with a message referencing its id, then drop its worktree.
    #[instrument(skip_all, fields(task = %task.id))]
    pub fn commit(&self, task: &Task, message: &str) -> Result<String> {
        let _guard = self.guard()?;
        let sha = self.vcs.commit(&task.id, message)?;
        info!(sha = %sha, "task committed");
        if let Err(e) = self.vcs.remove_worktree(&task.id) {
            warn!(err = %format!("{e:#}"), "committed worktree left behind");
        }
        Ok(sha)
    }

    /// Discard a task's changes by removing its worktree.
    ///
    /// The main tree is never touched, so commits of other tasks and edits
    /// made outside the orchestrator survive.
    #[instrument(skip_all, fields(task = %checkpoint.task_id))]
    pub fn rollback(&self, checkpoint: &CheckpointRef) -> Result<()> {
        let _guard = self.guard()?;
        warn!(checkpoint = %checkpoint.head, "discarding task worktree");
        self.vcs.remove_worktree(&checkpoint.task_id)
    }
}
