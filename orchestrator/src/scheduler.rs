//! The scheduler: sole owner of task state.
//!
//! One [`Orchestrator`] instance drives one work request. It computes
//! readiness from the graph after every change, dispatches ready tasks to
//! worker threads up to the effective pool size, and applies every state
//! transition itself, persisting each one before moving on. Workers only
//! report progress over a channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::capacity::effective_pool_size;
use crate::core::classifier::{Failure, classify};
use crate::core::effort::effort_for;
use crate::core::graph::Graph;
use crate::core::lifecycle::check_transition;
use crate::core::regression::BaselineSnapshot;
use crate::core::retry::{FailureCause, RetryDecision, decide};
use crate::core::types::{StoryHeader, Task, TaskState, WorkRequest};
use crate::io::agent::{AgentLauncher, CommandLauncher};
use crate::io::config::OrchestratorConfig;
use crate::io::execution::{ExecutionAdapter, ProjectContext};
use crate::io::init::OrchestratorPaths;
use crate::io::notify::{Event, FileNotifier, Notifications, Notifier, TracingNotifier};
use crate::io::quality::{CommandTestRunner, QualityGate, TestRequest, TestRunner};
use crate::io::resources::{ResourceProbe, SysinfoProbe};
use crate::io::safety::{GitSafety, GitWorktrees, Vcs, commit_message};
use crate::io::store::{JsonFileStore, PersistedRun, StateStore};
use crate::io::verification::VerificationAdapter;
use crate::report::RunReport;
use crate::worker::{AttemptJob, AttemptOutcome, Pipeline, WorkerEvent};

/// External collaborators of an orchestrator instance.
pub struct Services {
    pub launcher: Arc<dyn AgentLauncher>,
    pub vcs: Box<dyn Vcs>,
    pub tests: Arc<dyn TestRunner>,
    pub store: Box<dyn StateStore>,
    pub probe: Box<dyn ResourceProbe>,
    pub notifications: Notifications,
}

impl Services {
    /// Real collaborators for a project root: command agents, git worktrees,
    /// the configured test command, `state.json`, sysinfo and the event log.
    pub fn from_config(cfg: &OrchestratorConfig, paths: &OrchestratorPaths) -> Self {
        let sinks: Vec<Box<dyn Notifier>> = vec![
            Box::new(TracingNotifier),
            Box::new(FileNotifier::new(&paths.events_path)),
        ];
        Self {
            launcher: Arc::new(CommandLauncher::new(cfg.clone())),
            vcs: Box::new(GitWorktrees::new(&paths.root, &paths.worktrees_dir)),
            tests: Arc::new(CommandTestRunner {
                command: cfg.tests.command.clone(),
                workdir: paths.root.clone(),
                timeout: cfg.test_timeout(),
                output_limit_bytes: cfg.output_limit_bytes,
            }),
            store: Box::new(JsonFileStore::new(&paths.state_path)),
            probe: Box::new(SysinfoProbe::new()),
            notifications: Notifications::new(sinks),
        }
    }
}

/// A task waiting in `Retrying` until `not_before`.
#[derive(Debug, Clone)]
struct PendingRetry {
    task: String,
    not_before: Instant,
}

pub struct Orchestrator {
    cfg: OrchestratorConfig,
    paths: OrchestratorPaths,
    work_request_id: String,
    title: String,
    stories: Vec<StoryHeader>,
    graph: Graph,
    baseline: Option<Arc<BaselineSnapshot>>,
    pipeline: Arc<Pipeline>,
    safety: Arc<GitSafety>,
    store: Box<dyn StateStore>,
    probe: Box<dyn ResourceProbe>,
    notifications: Notifications,
    cancel: CancelToken,
    in_flight: HashSet<String>,
    retries: Vec<PendingRetry>,
    recovered: Vec<String>,
}

impl Orchestrator {
    /// Start a fresh run of `request`.
    ///
    /// The dependency graph is validated first; a cycle or dangling
    /// prerequisite is returned as a [`crate::core::graph::GraphError`] before
    /// anything is persisted or executed.
    pub fn start(
        request: WorkRequest,
        cfg: OrchestratorConfig,
        paths: OrchestratorPaths,
        services: Services,
        cancel: CancelToken,
    ) -> Result<Self> {
        cfg.validate()?;
        let work_request_id = request.id.clone();
        let title = request.title.clone();
        let stories = request.story_headers();
        let graph = Graph::build(request.into_tasks())?;
        info!(work_request = %work_request_id, tasks = graph.len(), "starting work request");

        let mut orchestrator = Self::assemble(
            cfg,
            paths,
            services,
            cancel,
            work_request_id,
            title,
            stories,
            graph,
            None,
        );
        orchestrator.promote_ready()?;
        orchestrator.persist()?;
        Ok(orchestrator)
    }

    /// Resume the persisted run, if any, after reconciling stale tasks.
    pub fn resume(
        cfg: OrchestratorConfig,
        paths: OrchestratorPaths,
        services: Services,
        cancel: CancelToken,
    ) -> Result<Option<Self>> {
        cfg.validate()?;
        let Some(run) = services.store.load()? else {
            return Ok(None);
        };
        let graph = Graph::build(run.tasks).context("persisted tasks are inconsistent")?;
        info!(work_request = %run.work_request_id, tasks = graph.len(), "resuming work request");

        let mut orchestrator = Self::assemble(
            cfg,
            paths,
            services,
            cancel,
            run.work_request_id,
            run.title,
            run.stories,
            graph,
            run.baseline.map(Arc::new),
        );
        orchestrator.recover()?;
        orchestrator.promote_ready()?;
        orchestrator.persist()?;
        Ok(Some(orchestrator))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        cfg: OrchestratorConfig,
        paths: OrchestratorPaths,
        services: Services,
        cancel: CancelToken,
        work_request_id: String,
        title: String,
        stories: Vec<StoryHeader>,
        graph: Graph,
        baseline: Option<Arc<BaselineSnapshot>>,
    ) -> Self {
        let safety = Arc::new(GitSafety::new(services.vcs));
        let pipeline = Arc::new(Pipeline {
            execution: ExecutionAdapter::new(
                Arc::clone(&services.launcher),
                Arc::clone(&safety),
                cfg.execution_timeout(),
            ),
            verification: VerificationAdapter::new(
                Arc::clone(&services.launcher),
                cfg.verification_timeout(),
            ),
            gate: QualityGate::new(services.tests),
            paths: paths.clone(),
        });
        Self {
            cfg,
            paths,
            work_request_id,
            title,
            stories,
            graph,
            baseline,
            pipeline,
            safety,
            store: services.store,
            probe: services.probe,
            notifications: services.notifications,
            cancel,
            in_flight: HashSet::new(),
            retries: Vec::new(),
            recovered: Vec::new(),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        self.graph.tasks()
    }

    /// Ids of tasks reset to `Ready` by recovery when this instance was resumed.
    pub fn recovered(&self) -> &[String] {
        &self.recovered
    }

    pub fn snapshot(&self) -> PersistedRun {
        PersistedRun {
            work_request_id: self.work_request_id.clone(),
            title: self.title.clone(),
            stories: self.stories.clone(),
            tasks: self.graph.tasks().to_vec(),
            baseline: self.baseline.as_deref().cloned(),
        }
    }

    /// Drive the work request until every task is settled or the run is cancelled.
    pub fn run(mut self) -> Result<RunReport> {
        let (tx, rx) = mpsc::channel();
        let result = self.drive(&tx, &rx);
        if result.is_err() {
            // Stop the workers and keep whatever they report before surfacing the error.
            self.cancel.cancel();
        }
        let drained = self.drain(&rx);
        result?;
        drained?;

        let cancelled = self.cancel.is_cancelled();
        let report = RunReport::from_run(&self.snapshot(), cancelled)?;
        self.notifications.send(&Event::WorkRequestComplete {
            id: self.work_request_id.clone(),
            done: self.graph.count_in(TaskState::Done),
            blocked: self.graph.count_in(TaskState::Blocked),
            cancelled,
        });
        info!(outcome = ?report.outcome, "work request finished");
        Ok(report)
    }

    fn drive(&mut self, tx: &Sender<WorkerEvent>, rx: &Receiver<WorkerEvent>) -> Result<()> {
        if !self.ensure_baseline()? {
            return Ok(());
        }
        loop {
            if self.cancel.is_cancelled() {
                warn!(in_flight = self.in_flight.len(), "cancellation requested");
                return Ok(());
            }
            self.dispatch_available(tx)?;
            if self.in_flight.is_empty()
                && self.retries.is_empty()
                && self.graph.count_in(TaskState::Ready) == 0
            {
                return Ok(());
            }
            match rx.recv_timeout(self.next_wakeup()) {
                Ok(event) => self.handle(event)?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("worker channel disconnected"));
                }
            }
            while let Ok(event) = rx.try_recv() {
                self.handle(event)?;
            }
        }
    }

    /// Wait for in-flight workers to report back.
    fn drain(&mut self, rx: &Receiver<WorkerEvent>) -> Result<()> {
        let mut first_err = None;
        while !self.in_flight.is_empty() {
            match rx.recv_timeout(self.cfg.poll_interval()) {
                Ok(event) => {
                    if let Err(e) = self.handle(event) {
                        warn!(err = %format!("{e:#}"), "failed to apply worker report");
                        first_err.get_or_insert(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Capture the test baseline once per work request. Returns `false` when
    /// cancelled before it completed.
    fn ensure_baseline(&mut self) -> Result<bool> {
        if self.baseline.is_some() {
            return Ok(true);
        }
        let request = TestRequest {
            workdir: None,
            log_path: Some(self.paths.baseline_log()),
        };
        match self.pipeline.gate.snapshot(&request, &self.cancel) {
            Ok(snapshot) => {
                info!(passed = snapshot.passed, failed = snapshot.failed, "baseline captured");
                self.baseline = Some(Arc::new(snapshot));
                self.persist()?;
                Ok(true)
            }
            Err(Failure::Cancelled) => Ok(false),
            Err(failure) => Err(anyhow!("baseline test run failed: {failure}")),
        }
    }

    fn next_wakeup(&self) -> Duration {
        let poll = self.cfg.poll_interval();
        let now = Instant::now();
        self.retries
            .iter()
            .map(|r| r.not_before.saturating_duration_since(now))
            .min()
            .map_or(poll, |until| until.min(poll))
    }

    fn dispatch_available(&mut self, tx: &Sender<WorkerEvent>) -> Result<()> {
        let now = Instant::now();
        let mut candidates: Vec<String> = self
            .retries
            .iter()
            .filter(|r| r.not_before <= now)
            .map(|r| r.task.clone())
            .collect();
        candidates.extend(
            self.graph
                .tasks()
                .iter()
                .filter(|t| t.state == TaskState::Ready)
                .map(|t| t.id.clone()),
        );
        if candidates.is_empty() || self.in_flight.len() >= self.cfg.max_workers {
            return Ok(());
        }

        let running = self.in_flight.len();
        let pool = effective_pool_size(&self.cfg.capacity_limits(), &self.probe.sample(), running);
        if pool < self.cfg.max_workers {
            debug!(pool, max_workers = self.cfg.max_workers, "pool reduced by resource check");
        }
        for id in candidates.into_iter().take(pool.saturating_sub(running)) {
            self.retries.retain(|r| r.task != id);
            self.dispatch(&id, tx)?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(task = %id))]
    fn dispatch(&mut self, id: &str, tx: &Sender<WorkerEvent>) -> Result<()> {
        let baseline = self
            .baseline
            .clone()
            .ok_or_else(|| anyhow!("dispatch before baseline capture"))?;
        // A fix attempt keeps the worktree holding the rejected change.
        let checkpoint = match self.task(id)?.checkpoint.clone() {
            Some(checkpoint) => checkpoint,
            None => self.safety.checkpoint(id)?,
        };
        let project = self.project_context(id);
        let workdir = self.safety.workdir(id);

        let task = self.task_mut(id)?;
        task.attempts += 1;
        let effort = effort_for(task.kind, task.fix_attempts);
        task.effort = Some(effort);
        task.checkpoint = Some(checkpoint);
        let feedback = if task.fix_attempts > 0 {
            task.verification_reasons.clone().unwrap_or_default()
        } else {
            Vec::new()
        };
        let job = AttemptJob {
            task: task.clone(),
            attempt: task.attempts,
            effort,
            feedback,
            workdir,
            project,
            baseline,
        };
        self.transition(id, TaskState::Running)?;
        info!(attempt = job.attempt, effort = effort.as_str(), "task dispatched");

        let pipeline = Arc::clone(&self.pipeline);
        let events = tx.clone();
        let cancel = self.cancel.clone();
        thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || pipeline.run_attempt(job, &events, &cancel))
            .with_context(|| format!("spawn worker for {id}"))?;
        self.in_flight.insert(id.to_string());
        Ok(())
    }

    fn project_context(&self, id: &str) -> ProjectContext {
        let story = self
            .graph
            .get(id)
            .and_then(|t| t.story.as_deref())
            .and_then(|sid| self.stories.iter().find(|s| s.id == sid))
            .map(|s| s.title.clone());
        let completed = self
            .graph
            .tasks()
            .iter()
            .filter(|t| t.state == TaskState::Done)
            .map(|t| format!("{}: {}", t.id, t.headline()))
            .collect();
        ProjectContext {
            root: self.paths.root.display().to_string(),
            work_request: Some(self.title.clone()),
            story,
            completed,
        }
    }

    fn handle(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Verifying { task } => self.transition(&task, TaskState::Verifying),
            WorkerEvent::Finished { task, outcome } => {
                self.in_flight.remove(&task);
                match outcome {
                    AttemptOutcome::Approved { changed_files } => {
                        self.on_approved(&task, changed_files)
                    }
                    AttemptOutcome::Rejected {
                        reasons,
                        regressions,
                        changed_files,
                    } => self.on_rejected(&task, reasons, regressions, changed_files),
                    AttemptOutcome::Failed {
                        failure,
                        changed_files,
                    } => self.on_failed(&task, &failure, changed_files),
                    AttemptOutcome::Cancelled => {
                        // Left in Running/Verifying; recovery reconciles it on the next start.
                        info!(task = %task, "attempt cancelled");
                        Ok(())
                    }
                }
            }
        }
    }

    fn on_approved(&mut self, id: &str, changed_files: Vec<String>) -> Result<()> {
        merge_changed_files(self.task_mut(id)?, changed_files);
        self.transition(id, TaskState::Passed)?;

        let task = self.task(id)?.clone();
        match self.safety.commit(&task, &commit_message(&task)) {
            Ok(sha) => {
                let task = self.task_mut(id)?;
                task.commit = Some(sha);
                task.checkpoint = None;
                task.verification_reasons = None;
                self.transition(id, TaskState::Done)?;
                self.promote_ready()
            }
            Err(e) => {
                warn!(task = %id, err = %format!("{e:#}"), "commit failed");
                let failure = Failure::Unrecognized {
                    phase: "commit".to_string(),
                };
                self.on_failed(id, &failure, Vec::new())
            }
        }
    }

    fn on_rejected(
        &mut self,
        id: &str,
        reasons: Vec<String>,
        regressions: Vec<String>,
        changed_files: Vec<String>,
    ) -> Result<()> {
        if !regressions.is_empty() {
            self.notifications.send(&Event::RegressionDetected {
                task: id.to_string(),
                tests: regressions,
            });
        }
        let task = self.task_mut(id)?;
        merge_changed_files(task, changed_files);
        task.fix_attempts += 1;
        let attempt = task.attempts;
        for reason in &reasons {
            task.diagnostics
                .push(format!("attempt {attempt} rejected: {reason}"));
        }
        task.verification_reasons = Some(reasons);
        let (attempts, fix_attempts) = (task.attempts, task.fix_attempts);
        self.transition(id, TaskState::Failed)?;

        match decide(FailureCause::Rejected, attempts, fix_attempts, &self.cfg.retry_policy()) {
            RetryDecision::Retry { delay } => {
                // The fix attempt builds on the rejected change, so nothing is rolled back.
                info!(task = %id, fix_attempts, "scheduling fix attempt");
                self.schedule_retry(id, delay)
            }
            RetryDecision::Block(reason) => {
                info!(task = %id, ?reason, "fix attempts exhausted");
                self.block(id)
            }
        }
    }

    fn on_failed(&mut self, id: &str, failure: &Failure, changed_files: Vec<String>) -> Result<()> {
        let kind = classify(failure);
        let task = self.task_mut(id)?;
        merge_changed_files(task, changed_files);
        let attempt = task.attempts;
        task.diagnostics
            .push(format!("attempt {attempt} failed: {failure}"));
        let (attempts, fix_attempts) = (task.attempts, task.fix_attempts);
        self.transition(id, TaskState::Failed)?;

        match decide(
            FailureCause::Raised(kind),
            attempts,
            fix_attempts,
            &self.cfg.retry_policy(),
        ) {
            RetryDecision::Retry { delay } => {
                self.rollback(id)?;
                warn!(
                    task = %id,
                    ?kind,
                    attempt = attempts,
                    failure = %failure,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure"
                );
                self.schedule_retry(id, delay)
            }
            RetryDecision::Block(reason) => {
                info!(task = %id, ?kind, ?reason, "task cannot be retried");
                self.block(id)
            }
        }
    }

    fn schedule_retry(&mut self, id: &str, delay: Duration) -> Result<()> {
        self.transition(id, TaskState::Retrying)?;
        self.retries.push(PendingRetry {
            task: id.to_string(),
            not_before: Instant::now() + delay,
        });
        Ok(())
    }

    fn block(&mut self, id: &str) -> Result<()> {
        self.rollback(id)?;
        self.transition(id, TaskState::Blocked)?;
        let reasons = self.task(id)?.diagnostics.clone();
        self.notifications.send(&Event::TaskBlocked {
            task: id.to_string(),
            reasons,
        });
        for (dependent, roots) in self.graph.blocked_by_dependency() {
            if roots.iter().any(|root| root == id) {
                debug!(task = %dependent.id, blocked_on = %id, "dependent can no longer run");
            }
        }
        Ok(())
    }

    /// Discard the task's uncommitted changes with its worktree.
    fn rollback(&mut self, id: &str) -> Result<()> {
        let Some(checkpoint) = self.task(id)?.checkpoint.clone() else {
            return Ok(());
        };
        self.safety.rollback(&checkpoint)?;
        let task = self.task_mut(id)?;
        task.checkpoint = None;
        task.changed_files.clear();
        Ok(())
    }

    /// Reset every task a previous process left mid-flight to `Ready`.
    fn recover(&mut self) -> Result<()> {
        let stale: Vec<String> = self
            .graph
            .tasks()
            .iter()
            .filter(|t| t.state.is_in_flight())
            .map(|t| t.id.clone())
            .collect();
        for id in stale {
            let from = self.task(&id)?.state;
            warn!(task = %id, from = from.as_str(), "recovering stale task");
            self.rollback(&id)?;
            self.transition(&id, TaskState::Ready)?;
            self.recovered.push(id);
        }
        Ok(())
    }

    /// Move every `Pending` task whose prerequisites are `Done` to `Ready`.
    fn promote_ready(&mut self) -> Result<()> {
        let ready: Vec<String> = self
            .graph
            .ready_tasks()
            .into_iter()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.id.clone())
            .collect();
        for id in ready {
            self.transition(&id, TaskState::Ready)?;
        }
        Ok(())
    }

    fn transition(&mut self, id: &str, to: TaskState) -> Result<()> {
        let task = self.task_mut(id)?;
        check_transition(id, task.state, to)?;
        debug!(task = %id, from = task.state.as_str(), to = to.as_str(), "transition");
        task.state = to;
        task.updated_at = Some(Utc::now());
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        self.store.save(&self.snapshot()).context("persist run state")
    }

    fn task(&self, id: &str) -> Result<&Task> {
        self.graph
            .get(id)
            .ok_or_else(|| anyhow!("unknown task '{id}'"))
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.graph
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown task '{id}'"))
    }
}

fn merge_changed_files(task: &mut Task, changed_files: Vec<String>) {
    for path in changed_files {
        if !task.changed_files.contains(&path) {
            task.changed_files.push(path);
        }
    }
}
