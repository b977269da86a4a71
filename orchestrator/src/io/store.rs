//! Persisted task-state store (`.orchestrator/state.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::regression::BaselineSnapshot;
use crate::core::types::{StoryHeader, Task};

/// Everything needed to resume a work request after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRun {
    pub work_request_id: String,
    pub title: String,
    #[serde(default)]
    pub stories: Vec<StoryHeader>,
    pub tasks: Vec<Task>,
    /// Captured once before the first task runs and reused on resume.
    #[serde(default)]
    pub baseline: Option<BaselineSnapshot>,
}

pub trait StateStore: Send + Sync {
    /// `Ok(None)` when no run has been persisted.
    fn load(&self) -> Result<Option<PersistedRun>>;
    fn save(&self, run: &PersistedRun) -> Result<()>;
}

/// JSON file store with atomic replacement.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedRun>> {
        if !self.path.exists() {
            return Ok(None);
        }
        debug!(path = %self.path.display(), "loading run state");
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read run state {}", self.path.display()))?;
        let run: PersistedRun = serde_json::from_str(&contents)
            .with_context(|| format!("parse run state {}", self.path.display()))?;
        debug!(work_request = %run.work_request_id, tasks = run.tasks.len(), "run state loaded");
        Ok(Some(run))
    }

    fn save(&self, run: &PersistedRun) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(run).context("serialize run state")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}
