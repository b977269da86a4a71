//! Validation for `orchestrator validate`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::TaskState;
use crate::io::config::load_config;
use crate::io::init::OrchestratorPaths;
use crate::work_request::{check_work_request, load_work_request};

/// What a valid work request would do on a fresh start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub work_request_id: String,
    pub stories: usize,
    pub tasks: usize,
    /// Tasks with no prerequisites, dispatchable immediately.
    pub initially_ready: Vec<String>,
}

/// Validate the config in `root` and the work request at `request_path`:
/// schema, unique ids, known prerequisites and an acyclic graph.
pub fn validate_work_request(root: &Path, request_path: &Path) -> Result<ValidateOutcome> {
    let paths = OrchestratorPaths::new(root);
    load_config(&paths.config_path)
        .and_then(|cfg| cfg.validate().map(|()| cfg))
        .context("load config.toml")?;

    let request = load_work_request(request_path)?;
    let stories = request.stories.len();
    let work_request_id = request.id.clone();
    let graph = check_work_request(&request)?;
    let initially_ready = graph
        .ready_tasks()
        .into_iter()
        .filter(|t| t.state == TaskState::Pending)
        .map(|t| t.id.clone())
        .collect();

    Ok(ValidateOutcome {
        work_request_id,
        stories,
        tasks: graph.len(),
        initially_ready,
    })
}
