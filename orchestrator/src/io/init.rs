//! `.orchestrator/` workspace layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{OrchestratorConfig, write_config};
use crate::work_request::WORK_REQUEST_SCHEMA;

/// All canonical paths within `.orchestrator/` for a project root.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub dir: PathBuf,
    pub logs_dir: PathBuf,
    /// One git worktree per task attempt in progress.
    pub worktrees_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub events_path: PathBuf,
    pub stop_path: PathBuf,
    pub schema_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            logs_dir: dir.join("logs"),
            worktrees_dir: dir.join("worktrees"),
            gitignore_path: dir.join(".gitignore"),
            config_path: dir.join("config.toml"),
            state_path: dir.join("state.json"),
            events_path: dir.join("events.log"),
            stop_path: dir.join("STOP"),
            schema_path: dir.join("work_request.schema.json"),
            dir,
        }
    }

    /// Log file for one phase of one attempt, e.g. `logs/B/2-verification.log`.
    pub fn attempt_log(&self, task_id: &str, attempt: u32, phase: &str) -> PathBuf {
        self.logs_dir
            .join(task_id)
            .join(format!("{attempt}-{phase}.log"))
    }

    pub fn baseline_log(&self) -> PathBuf {
        self.logs_dir.join("baseline-tests.log")
    }
}

/// Options for `init_orchestrator`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing orchestrator-owned files.
    pub force: bool,
}

/// Create `.orchestrator/` scaffolding in `root`.
///
/// Fails if `.orchestrator/` already exists unless `options.force` is set.
/// A forced init keeps `state.json` and `events.log`.
pub fn init_orchestrator(root: &Path, options: &InitOptions) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!(
            "orchestrator init: .orchestrator exists but is not a directory"
        ));
    }
    if paths.dir.exists() && !options.force {
        return Err(anyhow!(
            "orchestrator init: .orchestrator already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.dir)?;
    create_dir(&paths.logs_dir)?;
    write_file(&paths.gitignore_path, ORCHESTRATOR_GITIGNORE)?;
    write_config(&paths.config_path, &OrchestratorConfig::default())?;
    write_file(&paths.schema_path, WORK_REQUEST_SCHEMA)?;

    Ok(paths)
}

/// Request cancellation of a running `orchestrator run` in `root`.
pub fn request_stop(paths: &OrchestratorPaths) -> Result<()> {
    create_dir(&paths.dir)?;
    write_file(&paths.stop_path, "")
}

/// Remove a stale stop request before a new run starts.
pub fn clear_stop(paths: &OrchestratorPaths) -> Result<()> {
    if paths.stop_path.exists() {
        fs::remove_file(&paths.stop_path)
            .with_context(|| format!("remove {}", paths.stop_path.display()))?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

// Task worktrees and run state must stay out of the project's git status.
const ORCHESTRATOR_GITIGNORE: &str = "*\n";
