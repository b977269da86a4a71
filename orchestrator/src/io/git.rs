//! Git adapter for orchestrator commands.
//!
//! The orchestrator checkpoints, commits and rolls back deterministically, so we
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Bytes of an untracked file rendered into a diff before truncating.
const UNTRACKED_DIFF_LIMIT: usize = 20_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the full HEAD sha.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit whatever is staged (an empty commit if nothing is) and return the new HEAD.
    #[instrument(skip_all)]
    pub fn commit_staged_allow_empty(&self, message: &str) -> Result<String> {
        debug!("committing staged changes");
        self.run_checked(&["commit", "--allow-empty", "--no-verify", "-m", message])?;
        self.head_sha()
    }

    /// Paths with uncommitted changes, untracked files included.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    /// Check out `rev` into a new detached worktree at `path`.
    #[instrument(skip_all, fields(path = %path.display(), rev))]
    pub fn worktree_add(&self, path: &Path, rev: &str) -> Result<()> {
        let path = path_arg(path)?;
        self.run_checked(&["worktree", "add", "--detach", "--quiet", path, rev])?;
        Ok(())
    }

    /// Remove the worktree at `path` with any changes in it.
    ///
    /// A missing directory only prunes the stale registration.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        if path.exists() {
            let arg = path_arg(path)?;
            if let Err(e) = self.run_checked(&["worktree", "remove", "--force", arg]) {
                warn!(err = %format!("{e:#}"), "worktree remove failed; deleting directory");
                fs::remove_dir_all(path)
                    .with_context(|| format!("remove worktree {}", path.display()))?;
            }
        }
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Apply commit `sha` on top of HEAD. A conflicting pick is aborted.
    #[instrument(skip_all, fields(sha))]
    pub fn cherry_pick(&self, sha: &str) -> Result<String> {
        let picked = self.run_checked(&[
            "cherry-pick",
            "--allow-empty",
            "--keep-redundant-commits",
            sha,
        ]);
        if let Err(e) = picked {
            if let Err(abort) = self.run_checked(&["cherry-pick", "--abort"]) {
                debug!(err = %format!("{abort:#}"), "cherry-pick abort");
            }
            return Err(e);
        }
        self.head_sha()
    }

    /// Unified diff of `paths` against HEAD; untracked files are rendered in full.
    pub fn diff_paths(&self, paths: &[String]) -> Result<String> {
        let mut args = vec!["diff", "--no-color", "HEAD", "--"];
        args.extend(paths.iter().map(String::as_str));
        let mut diff = self.run_capture(&args)?;

        let untracked: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .filter(|e| e.code == "??")
            .map(|e| e.path)
            .filter(|p| paths.is_empty() || paths.contains(p))
            .collect();
        for path in untracked {
            diff.push_str(&render_untracked(&self.workdir, &path));
        }
        Ok(diff)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 path {}", path.display()))
}

fn render_untracked(workdir: &Path, path: &str) -> String {
    let mut buf = format!("--- /dev/null\n+++ b/{path}\n");
    match fs::read(workdir.join(path)) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let mut written = 0usize;
            for line in text.lines() {
                if written > UNTRACKED_DIFF_LIMIT {
                    buf.push_str("+[truncated]\n");
                    break;
                }
                buf.push('+');
                buf.push_str(line);
                buf.push('\n');
                written += line.len() + 1;
            }
        }
        Err(e) => buf.push_str(&format!("[unreadable: {e}]\n")),
    }
    buf
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
