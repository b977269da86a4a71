//! CLI tests.
//!
//! Spawns the orchestrator binary and verifies exit codes and the files it
//! manages under `.orchestrator/`.

use std::fs;
use std::process::Command;

use orchestrator::exit_codes;
use orchestrator::io::init::{InitOptions, OrchestratorPaths, init_orchestrator};
use orchestrator::test_support::TestRepo;

const CYCLIC: &str = r#"{"id": "wr", "title": "t", "stories": [{"id": "s", "title": "s", "tasks": [
    {"id": "A", "description": "a", "kind": "feature", "prerequisites": ["B"]},
    {"id": "B", "description": "b", "kind": "feature", "prerequisites": ["A"]}
]}]}"#;

const VALID: &str = r#"{"id": "wr", "title": "t", "stories": [{"id": "s", "title": "s", "tasks": [
    {"id": "A", "description": "a", "kind": "feature"},
    {"id": "B", "description": "b", "kind": "docs", "prerequisites": ["A"]}
]}]}"#;

fn orchestrator(root: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("spawn orchestrator")
}

#[test]
fn init_creates_layout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = orchestrator(temp.path(), &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));

    let paths = OrchestratorPaths::new(temp.path());
    assert!(paths.config_path.is_file());
    assert!(paths.schema_path.is_file());
    assert_eq!(
        fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
        "*\n"
    );
}

#[test]
fn validate_exit_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_orchestrator(temp.path(), &InitOptions { force: false }).expect("init");
    fs::write(temp.path().join("valid.json"), VALID).expect("write");
    fs::write(temp.path().join("cyclic.json"), CYCLIC).expect("write");

    let path = temp.path().join("valid.json");
    let ok = orchestrator(temp.path(), &["validate", path.to_str().expect("utf8 path")]);
    assert_eq!(ok.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&ok.stdout).contains("ready: A"));

    let path = temp.path().join("cyclic.json");
    let bad = orchestrator(temp.path(), &["validate", path.to_str().expect("utf8 path")]);
    assert_eq!(bad.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&bad.stderr).contains("dependency cycle"));
}

#[test]
fn status_and_stop_without_a_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_orchestrator(temp.path(), &InitOptions { force: false }).expect("init");

    let status = orchestrator(temp.path(), &["status"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&status.stdout).contains("no run recorded"));

    let stop = orchestrator(temp.path(), &["stop"]);
    assert_eq!(stop.status.code(), Some(exit_codes::OK));
    assert!(OrchestratorPaths::new(temp.path()).stop_path.exists());
}

#[test]
fn recover_refuses_a_dirty_tree() {
    let repo = TestRepo::new().expect("repo");
    init_orchestrator(repo.path(), &InitOptions { force: false }).expect("init");
    repo.write_file("user_notes.txt", "precious\n").expect("write");
    repo.write_file("README.md", "hi\nedited\n").expect("edit");

    let out = orchestrator(repo.path(), &["recover"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("working tree not clean"));
    assert_eq!(repo.read_file("user_notes.txt").expect("read"), "precious\n");
    assert_eq!(repo.read_file("README.md").expect("read"), "hi\nedited\n");
}

#[cfg(unix)]
mod signals {
    use std::path::Path;
    use std::process::{Child, Stdio};
    use std::thread;
    use std::time::{Duration, Instant};

    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use orchestrator::io::config::{OrchestratorConfig, write_config};
    use wait_timeout::ChildExt;

    use super::*;

    fn start_run(repo: &TestRepo, scratch: &Path) -> Child {
        let paths = OrchestratorPaths::new(repo.path());
        let pid_file = scratch.join("agent.pid");
        let mut cfg = OrchestratorConfig::default();
        cfg.agent.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > '{}'; exec sleep 300", pid_file.display()),
        ];
        cfg.tests.command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'test smoke ... ok'".to_string(),
        ];
        cfg.resources.min_free_memory_mb_per_worker = 0;
        cfg.resources.max_cpu_percent = 100.0;
        write_config(&paths.config_path, &cfg).expect("config");

        let request = scratch.join("wr.json");
        fs::write(&request, VALID).expect("write request");
        Command::new(env!("CARGO_BIN_EXE_orchestrator"))
            .arg("--root")
            .arg(repo.path())
            .arg("run")
            .arg(&request)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn orchestrator")
    }

    fn wait_for_pid(path: &Path) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if let Some(pid) = fs::read_to_string(path)
                .ok()
                .and_then(|text| text.trim().parse().ok())
            {
                return pid;
            }
            assert!(Instant::now() < deadline, "agent never started");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn sigterm_cancels_the_run_and_kills_the_agent() {
        let repo = TestRepo::new().expect("repo");
        init_orchestrator(repo.path(), &InitOptions { force: false }).expect("init");
        let scratch = tempfile::tempdir().expect("tempdir");
        let mut run = start_run(&repo, scratch.path());

        let agent = wait_for_pid(&scratch.path().join("agent.pid"));
        let orchestrator_pid = i32::try_from(run.id()).expect("pid");
        kill(Pid::from_raw(orchestrator_pid), Signal::SIGTERM).expect("send SIGTERM");

        let status = match run.wait_timeout(Duration::from_secs(30)).expect("wait") {
            Some(status) => status,
            None => {
                run.kill().expect("kill");
                panic!("orchestrator ignored SIGTERM");
            }
        };
        assert_eq!(status.code(), Some(exit_codes::CANCELLED));
        assert_eq!(kill(Pid::from_raw(agent), None), Err(Errno::ESRCH));
    }
}
