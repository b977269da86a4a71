//! Test-only fakes and builders.
//!
//! Every fake is cheaply cloneable and shares its recorded state between
//! clones, so a test can hand one clone to the orchestrator and inspect the
//! other afterwards.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::capacity::ResourceSample;
use crate::core::classifier::Failure;
use crate::core::regression::{TestRun, TestStatus};
use crate::core::types::{EffortTier, Story, Task, TaskKind, WorkRequest};
use crate::io::agent::{AgentLauncher, AgentReply, AgentRole, CodeAgent, InvokeRequest};
use crate::io::config::OrchestratorConfig;
use crate::io::init::{InitOptions, OrchestratorPaths, init_orchestrator};
use crate::io::notify::{Event, Notifications, Notifier};
use crate::io::quality::{TestRequest, TestRunner};
use crate::io::resources::ResourceProbe;
use crate::io::safety::{GitWorktrees, Vcs};
use crate::io::store::{PersistedRun, StateStore};
use crate::report::RunReport;
use crate::scheduler::{Orchestrator, Services};

const CANCEL_POLL: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Execution agent reply reporting success with `files` changed.
pub fn done_reply(files: &[&str]) -> String {
    json!({"status": "done", "summary": "implemented", "changed_files": files}).to_string()
}

pub fn approve_reply() -> String {
    json!({"approved": true, "findings": []}).to_string()
}

/// Review reply rejecting with one finding of `category` (e.g. `"logic_defect"`).
pub fn reject_reply(category: &str, message: &str) -> String {
    json!({
        "approved": false,
        "findings": [{"category": category, "message": message}]
    })
    .to_string()
}

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub role: AgentRole,
    pub task: String,
    pub effort: EffortTier,
    pub prompt: String,
    pub workdir: PathBuf,
}

#[derive(Default)]
struct LauncherState {
    scripts: Mutex<HashMap<(AgentRole, String), VecDeque<Result<String, Failure>>>>,
    writes: Mutex<HashMap<String, VecDeque<Vec<(String, String)>>>>,
    invocations: Mutex<Vec<Invocation>>,
    active: Mutex<HashMap<AgentRole, usize>>,
    max_active: Mutex<HashMap<AgentRole, usize>>,
}

/// Agent launcher replaying scripted replies per task and role.
///
/// Unscripted executors reply `done_reply(&[])`; unscripted reviewers approve.
/// A scripted `Err(Failure::Cancelled)` blocks until the run is cancelled.
/// Each executor invocation first writes the next scripted batch of files for
/// its task into the request workdir, whatever the reply is.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    state: Arc<LauncherState>,
    delay: Duration,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation takes at least `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script_executor(&self, task: &str, replies: Vec<Result<String, Failure>>) {
        self.script(AgentRole::Executor, task, replies);
    }

    pub fn script_reviewer(&self, task: &str, replies: Vec<Result<String, Failure>>) {
        self.script(AgentRole::Reviewer, task, replies);
    }

    /// Queue one batch of files (relative path, contents) for the next
    /// executor invocation of `task`.
    pub fn script_writes(&self, task: &str, files: &[(&str, &str)]) {
        lock(&self.state.writes)
            .entry(task.to_string())
            .or_default()
            .push_back(
                files
                    .iter()
                    .map(|(path, contents)| ((*path).to_string(), (*contents).to_string()))
                    .collect(),
            );
    }

    fn script(&self, role: AgentRole, task: &str, replies: Vec<Result<String, Failure>>) {
        lock(&self.state.scripts)
            .entry((role, task.to_string()))
            .or_default()
            .extend(replies);
    }

    pub fn invocations(&self, task: &str) -> Vec<Invocation> {
        lock(&self.state.invocations)
            .iter()
            .filter(|i| i.task == task)
            .cloned()
            .collect()
    }

    pub fn all_invocations(&self) -> Vec<Invocation> {
        lock(&self.state.invocations).clone()
    }

    /// Highest number of simultaneous invocations seen for `role`.
    pub fn max_active(&self, role: AgentRole) -> usize {
        lock(&self.state.max_active)
            .get(&role)
            .copied()
            .unwrap_or(0)
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn launch(&self, role: AgentRole) -> Box<dyn CodeAgent> {
        Box::new(ScriptedAgent {
            role,
            launcher: self.clone(),
        })
    }
}

struct ScriptedAgent {
    role: AgentRole,
    launcher: ScriptedLauncher,
}

impl ScriptedAgent {
    fn enter(&self) {
        let mut active = lock(&self.launcher.state.active);
        let count = active.entry(self.role).or_insert(0);
        *count += 1;
        let now = *count;
        let mut max = lock(&self.launcher.state.max_active);
        let peak = max.entry(self.role).or_insert(0);
        *peak = (*peak).max(now);
    }

    fn leave(&self) {
        let mut active = lock(&self.launcher.state.active);
        if let Some(count) = active.get_mut(&self.role) {
            *count = count.saturating_sub(1);
        }
    }

    fn write_files(&self, request: &InvokeRequest) -> Result<(), Failure> {
        let files = lock(&self.launcher.state.writes)
            .get_mut(&request.label)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        for (rel, contents) in files {
            let path = request.workdir.join(&rel);
            let written = path
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(&path, contents));
            if written.is_err() {
                return Err(Failure::Unrecognized {
                    phase: format!("scripted write of {rel}"),
                });
            }
        }
        Ok(())
    }

    fn next_reply(&self, task: &str) -> Result<String, Failure> {
        let scripted = lock(&self.launcher.state.scripts)
            .get_mut(&(self.role, task.to_string()))
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(match self.role {
                AgentRole::Executor => done_reply(&[]),
                AgentRole::Reviewer => approve_reply(),
            })
        })
    }
}

impl CodeAgent for ScriptedAgent {
    fn invoke(&self, request: &InvokeRequest, cancel: &CancelToken) -> Result<AgentReply, Failure> {
        lock(&self.launcher.state.invocations).push(Invocation {
            role: self.role,
            task: request.label.clone(),
            effort: request.effort,
            prompt: request.prompt.clone(),
            workdir: request.workdir.clone(),
        });
        self.enter();
        if !self.launcher.delay.is_zero() {
            thread::sleep(self.launcher.delay);
        }
        let written = match self.role {
            AgentRole::Executor => self.write_files(request),
            AgentRole::Reviewer => Ok(()),
        };
        let reply = match written.and_then(|()| self.next_reply(&request.label)) {
            Err(Failure::Cancelled) => {
                while !cancel.is_cancelled() {
                    thread::sleep(CANCEL_POLL);
                }
                Err(Failure::Cancelled)
            }
            other => other,
        };
        self.leave();
        reply.map(|text| AgentReply { text })
    }
}

// ---------------------------------------------------------------------------
// Version control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    Head,
    AddWorktree { task: String, head: String },
    RemoveWorktree { task: String },
    ChangedFiles { task: String },
    Diff { task: String },
    Commit { task: String, message: String },
}

#[derive(Default)]
struct VcsState {
    calls: Mutex<Vec<VcsCall>>,
    changed: Mutex<HashMap<String, Vec<String>>>,
    commits: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// In-memory [`Vcs`] with fake heads `sha0`, `sha1`, ... and worktrees
/// under `/worktrees`, recording every call.
#[derive(Clone, Default)]
pub struct RecordingVcs {
    state: Arc<VcsState>,
    delay: Duration,
}

impl RecordingVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call holds for `delay`, to expose overlapping calls.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Files reported as changed in `task`'s worktree.
    pub fn set_changed_files(&self, task: &str, files: &[&str]) {
        lock(&self.state.changed).insert(
            task.to_string(),
            files.iter().map(|f| (*f).to_string()).collect(),
        );
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        lock(&self.state.calls).clone()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    /// Commit messages in commit order.
    pub fn commits(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                VcsCall::Commit { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: VcsCall) {
        let now = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        lock(&self.state.calls).push(call);
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn current_head(&self) -> String {
        format!("sha{}", self.state.commits.load(Ordering::SeqCst))
    }
}

impl Vcs for RecordingVcs {
    fn head(&self) -> Result<String> {
        self.record(VcsCall::Head);
        Ok(self.current_head())
    }

    fn worktree_path(&self, task: &str) -> PathBuf {
        Path::new("/worktrees").join(task)
    }

    fn add_worktree(&self, task: &str, head: &str) -> Result<()> {
        self.record(VcsCall::AddWorktree {
            task: task.to_string(),
            head: head.to_string(),
        });
        Ok(())
    }

    fn remove_worktree(&self, task: &str) -> Result<()> {
        self.record(VcsCall::RemoveWorktree {
            task: task.to_string(),
        });
        Ok(())
    }

    fn changed_files(&self, task: &str) -> Result<Vec<String>> {
        self.record(VcsCall::ChangedFiles {
            task: task.to_string(),
        });
        Ok(lock(&self.state.changed)
            .get(task)
            .cloned()
            .unwrap_or_default())
    }

    fn diff(&self, task: &str) -> Result<String> {
        self.record(VcsCall::Diff {
            task: task.to_string(),
        });
        Ok(String::new())
    }

    fn commit(&self, task: &str, message: &str) -> Result<String> {
        self.record(VcsCall::Commit {
            task: task.to_string(),
            message: message.to_string(),
        });
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(self.current_head())
    }
}

/// Temporary git repository with one initial commit of `README.md` ("hi\n").
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git(&["init"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.write_file("README.md", "hi\n")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-m", "chore: init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn last_commit_subject(&self) -> Result<String> {
        Ok(self.git(&["log", "-1", "--format=%s"])?.trim().to_string())
    }

    pub fn last_commit_files(&self) -> Result<Vec<String>> {
        Ok(self
            .git(&["show", "--name-only", "--format=", "HEAD"])?
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `(subject, files)` of every commit, oldest first.
    pub fn history(&self) -> Result<Vec<(String, Vec<String>)>> {
        let log = self.git(&["log", "--reverse", "--name-only", "--format=%x00%s"])?;
        Ok(log
            .split('\0')
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                let mut lines = entry.lines().filter(|line| !line.is_empty());
                let subject = lines.next().unwrap_or_default().to_string();
                (subject, lines.map(str::to_string).collect())
            })
            .collect())
    }

    /// Paths with uncommitted changes in the main tree, ignored files excluded.
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        Ok(self
            .git(&["status", "--porcelain=v1", "-uall"])?
            .lines()
            .filter_map(|line| line.get(3..))
            .map(str::to_string)
            .collect())
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests, state, resources, notifications
// ---------------------------------------------------------------------------

/// Test runner replaying scripted suite results; the last run repeats.
#[derive(Clone)]
pub struct ScriptedTestRunner {
    runs: Arc<Mutex<VecDeque<TestRun>>>,
    last: Arc<Mutex<TestRun>>,
}

impl ScriptedTestRunner {
    /// Each inner vec is one run of `(test id, passed)` pairs.
    pub fn new(runs: Vec<Vec<(&str, bool)>>) -> Self {
        let runs: VecDeque<TestRun> = runs
            .into_iter()
            .map(|results| {
                let mut run = TestRun::default();
                for (id, passed) in results {
                    let status = if passed {
                        TestStatus::Passed
                    } else {
                        TestStatus::Failed
                    };
                    run.record(id, status);
                }
                run
            })
            .collect();
        Self {
            runs: Arc::new(Mutex::new(runs)),
            last: Arc::new(Mutex::new(TestRun::default())),
        }
    }

    /// A suite that always passes one test.
    pub fn green() -> Self {
        Self::new(vec![vec![("suite::smoke", true)]])
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, _request: &TestRequest, cancel: &CancelToken) -> Result<TestRun, Failure> {
        if cancel.is_cancelled() {
            return Err(Failure::Cancelled);
        }
        let mut last = lock(&self.last);
        if let Some(next) = lock(&self.runs).pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

/// In-memory [`StateStore`] keeping every saved snapshot.
#[derive(Clone, Default)]
pub struct MemoryStore {
    history: Arc<Mutex<Vec<PersistedRun>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(run: PersistedRun) -> Self {
        let store = Self::new();
        lock(&store.history).push(run);
        store
    }

    pub fn history(&self) -> Vec<PersistedRun> {
        lock(&self.history).clone()
    }

    pub fn last(&self) -> Option<PersistedRun> {
        lock(&self.history).last().cloned()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedRun>> {
        Ok(self.last())
    }

    fn save(&self, run: &PersistedRun) -> Result<()> {
        lock(&self.history).push(run.clone());
        Ok(())
    }
}

/// Probe returning a fixed sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub ResourceSample);

impl FixedProbe {
    pub fn plenty() -> Self {
        Self(ResourceSample {
            available_memory_mb: 1 << 20,
            cpu_percent: 0.0,
        })
    }

    /// Less free memory than one worker needs under the default config.
    pub fn low_memory() -> Self {
        Self(ResourceSample {
            available_memory_mb: 512,
            cpu_percent: 0.0,
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceSample {
        self.0
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &Event) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn task(id: &str, kind: TaskKind, prerequisites: &[&str]) -> Task {
    Task::new(id, kind, format!("{id} description")).with_prerequisites(prerequisites.iter().copied())
}

/// Single-story work request with id `wr-test`.
pub fn work_request(tasks: Vec<Task>) -> WorkRequest {
    WorkRequest {
        id: "wr-test".to_string(),
        title: "Test work".to_string(),
        stories: vec![Story {
            id: "s1".to_string(),
            title: "Story one".to_string(),
            tasks,
        }],
    }
}

/// Config with millisecond backoff and polling.
pub fn fast_config(max_workers: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_workers,
        backoff_base_ms: 1,
        backoff_cap_ms: 4,
        poll_interval_ms: 5,
        ..OrchestratorConfig::default()
    }
}

enum HarnessRoot {
    /// Plain directory; version control goes to `Harness::vcs`.
    Fake(TempDir),
    /// Initialized git repository; version control uses real worktrees.
    Git(TestRepo),
}

/// Orchestrator wired to fakes, with handles to inspect them.
pub struct Harness {
    pub cfg: OrchestratorConfig,
    pub launcher: ScriptedLauncher,
    pub vcs: RecordingVcs,
    pub tests: ScriptedTestRunner,
    pub store: MemoryStore,
    pub probe: FixedProbe,
    pub notifier: RecordingNotifier,
    pub cancel: CancelToken,
    root: HarnessRoot,
}

impl Harness {
    pub fn new(max_workers: usize) -> Result<Self> {
        Ok(Self::with_root(
            max_workers,
            HarnessRoot::Fake(tempfile::tempdir().context("create tempdir")?),
        ))
    }

    /// Harness over a real git repository with `.orchestrator/` initialized.
    pub fn with_repo(max_workers: usize) -> Result<Self> {
        let repo = TestRepo::new()?;
        init_orchestrator(repo.path(), &InitOptions { force: false })?;
        Ok(Self::with_root(max_workers, HarnessRoot::Git(repo)))
    }

    fn with_root(max_workers: usize, root: HarnessRoot) -> Self {
        Self {
            cfg: fast_config(max_workers),
            launcher: ScriptedLauncher::new(),
            vcs: RecordingVcs::new(),
            tests: ScriptedTestRunner::green(),
            store: MemoryStore::new(),
            probe: FixedProbe::plenty(),
            notifier: RecordingNotifier::default(),
            cancel: CancelToken::new(),
            root,
        }
    }

    /// The repository of a [`Harness::with_repo`] harness.
    pub fn repo(&self) -> Option<&TestRepo> {
        match &self.root {
            HarnessRoot::Git(repo) => Some(repo),
            HarnessRoot::Fake(_) => None,
        }
    }

    pub fn paths(&self) -> OrchestratorPaths {
        match &self.root {
            HarnessRoot::Fake(dir) => OrchestratorPaths::new(dir.path()),
            HarnessRoot::Git(repo) => OrchestratorPaths::new(repo.path()),
        }
    }

    pub fn services(&self) -> Services {
        let paths = self.paths();
        let vcs: Box<dyn Vcs> = match &self.root {
            HarnessRoot::Fake(_) => Box::new(self.vcs.clone()),
            HarnessRoot::Git(repo) => Box::new(GitWorktrees::new(repo.path(), &paths.worktrees_dir)),
        };
        Services {
            launcher: Arc::new(self.launcher.clone()),
            vcs,
            tests: Arc::new(self.tests.clone()),
            store: Box::new(self.store.clone()),
            probe: Box::new(self.probe),
            notifications: Notifications::new(vec![Box::new(self.notifier.clone())]),
        }
    }

    pub fn start(&self, request: WorkRequest) -> Result<Orchestrator> {
        Orchestrator::start(
            request,
            self.cfg.clone(),
            self.paths(),
            self.services(),
            self.cancel.clone(),
        )
    }

    pub fn resume(&self) -> Result<Orchestrator> {
        Orchestrator::resume(self.cfg.clone(), self.paths(), self.services(), self.cancel.clone())?
            .ok_or_else(|| anyhow!("no persisted run"))
    }

    pub fn run(&self, request: WorkRequest) -> Result<RunReport> {
        self.start(request)?.run()
    }
}
