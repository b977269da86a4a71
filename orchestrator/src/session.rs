//! Orchestration for `orchestrator run`, `status` and `recover`.
//!
//! A session binds one project root to one work request. Starting a session
//! either resumes the persisted run of the same work request (after crash
//! recovery) or starts a fresh one.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::core::types::WorkRequest;
use crate::io::config::load_config;
use crate::io::git::Git;
use crate::io::init::{InitOptions, OrchestratorPaths, init_orchestrator};
use crate::io::sandbox::validate_docker_available;
use crate::io::store::{JsonFileStore, StateStore};
use crate::report::{RunOutcome, RunReport};
use crate::scheduler::{Orchestrator, Services};

/// Refuse to start on a dirty tree: task commits are applied onto it.
pub fn preflight(root: &Path) -> Result<()> {
    Git::new(root).ensure_clean_except_prefixes(&[".orchestrator/"])
}

/// Production services for `root`, with the sandbox checked when enabled.
pub fn production_services(root: &Path) -> Result<Services> {
    let paths = ensure_initialized(root)?;
    let cfg = load_config(&paths.config_path).context("load config.toml")?;
    if cfg.sandbox.enabled && !validate_docker_available() {
        bail!("sandbox is enabled but docker is not available");
    }
    Ok(Services::from_config(&cfg, &paths))
}

/// Run `request` to completion, resuming its persisted state if present.
pub fn run_work_request(
    root: &Path,
    request: WorkRequest,
    services: Services,
    cancel: CancelToken,
) -> Result<RunReport> {
    let paths = ensure_initialized(root)?;
    let cfg = load_config(&paths.config_path).context("load config.toml")?;

    let orchestrator = match services.store.load()? {
        Some(run) if run.work_request_id == request.id => {
            info!(work_request = %request.id, "resuming persisted run");
            Orchestrator::resume(cfg, paths, services, cancel)?
                .context("persisted run disappeared")?
        }
        Some(run) => {
            let previous = RunReport::from_run(&run, false)?;
            if previous.outcome == RunOutcome::Incomplete {
                bail!(
                    "work request '{}' is still in progress; finish it or remove {}",
                    run.work_request_id,
                    paths.state_path.display()
                );
            }
            debug!(previous = %run.work_request_id, "replacing finished run");
            Orchestrator::start(request, cfg, paths, services, cancel)?
        }
        None => Orchestrator::start(request, cfg, paths, services, cancel)?,
    };
    orchestrator.run()
}

/// Reconcile the persisted run without executing anything. Returns the ids of
/// tasks reset to `Ready`.
pub fn recover_run(root: &Path, services: Services) -> Result<Vec<String>> {
    let paths = OrchestratorPaths::new(root);
    let cfg = load_config(&paths.config_path).context("load config.toml")?;
    match Orchestrator::resume(cfg, paths, services, CancelToken::new())? {
        Some(orchestrator) => Ok(orchestrator.recovered().to_vec()),
        None => bail!("no persisted run to recover"),
    }
}

/// Summary of the persisted run, if any.
pub fn run_status(root: &Path) -> Result<Option<RunReport>> {
    let paths = OrchestratorPaths::new(root);
    let store = JsonFileStore::new(&paths.state_path);
    match store.load()? {
        Some(run) => Ok(Some(RunReport::from_run(&run, false)?)),
        None => Ok(None),
    }
}

fn ensure_initialized(root: &Path) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if !paths.dir.exists() {
        init_orchestrator(root, &InitOptions { force: false }).context("orchestrator init")?;
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TaskKind, TaskState};
    use crate::io::store::PersistedRun;
    use crate::test_support::{Harness, MemoryStore, task, work_request};

    #[test]
    fn resumes_run_of_same_work_request() {
        let mut harness = Harness::new(1).expect("harness");
        let request = work_request(vec![task("a", TaskKind::Docs, &[])]);
        let mut tasks = request.clone().into_tasks();
        tasks[0].state = TaskState::Done;
        harness.store = MemoryStore::with_run(PersistedRun {
            work_request_id: request.id.clone(),
            title: request.title.clone(),
            stories: request.story_headers(),
            tasks,
            baseline: None,
        });

        let report = run_work_request(
            harness.paths().root.as_path(),
            request,
            harness.services(),
            CancelToken::new(),
        )
        .expect("run");
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert!(harness.launcher.all_invocations().is_empty());
    }

    #[test]
    fn refuses_to_replace_unfinished_run() {
        let mut harness = Harness::new(1).expect("harness");
        let other = work_request(vec![task("x", TaskKind::Docs, &[])]);
        harness.store = MemoryStore::with_run(PersistedRun {
            work_request_id: "other".to_string(),
            title: other.title.clone(),
            stories: other.story_headers(),
            tasks: other.into_tasks(),
            baseline: None,
        });

        let err = run_work_request(
            harness.paths().root.as_path(),
            work_request(vec![task("a", TaskKind::Docs, &[])]),
            harness.services(),
            CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("still in progress"));
    }

    #[test]
    fn status_without_state_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(run_status(temp.path()).expect("status").is_none());
    }
}
