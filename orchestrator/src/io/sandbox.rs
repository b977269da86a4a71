//! Optional docker wrapping for agent commands.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::io::process::run_command_with_timeout;

const DOCKER_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONTAINER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub image: String,
    /// Allow network access inside the container.
    pub network: bool,
    pub memory_limit: String,
    pub cpu_limit: f32,
    pub tmpfs_size: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "nightwire-sandbox:latest".to_string(),
            network: false,
            memory_limit: "2g".to_string(),
            cpu_limit: 2.0,
            tmpfs_size: "256m".to_string(),
        }
    }
}

/// Container name for one agent invocation, unique within the host.
pub fn container_name(label: &str, role: &str) -> String {
    let seq = NEXT_CONTAINER.fetch_add(1, Ordering::Relaxed);
    format!("orchestrator-{label}-{role}-{}-{seq}", std::process::id())
}

/// Wrap `cmd` in `docker run --name <container>` when the sandbox is enabled.
///
/// Only `project` is mounted read-write; `/tmp` is a tmpfs. Returns `cmd`
/// unchanged when disabled.
pub fn wrap_command(
    cmd: &[String],
    project: &Path,
    config: &SandboxConfig,
    container: &str,
) -> Vec<String> {
    if !config.enabled {
        return cmd.to_vec();
    }

    let mut inner = cmd.to_vec();
    // A host path to the agent binary does not exist in the container.
    if let Some(program) = inner.first_mut()
        && Path::new(program.as_str())
            .file_name()
            .is_some_and(|name| name.to_string_lossy().contains("claude"))
    {
        *program = "claude".to_string();
    }

    let project = project.display().to_string();
    let mut wrapped = vec![
        "docker".to_string(),
        "run".to_string(),
        "--rm".to_string(),
        "--interactive".to_string(),
        "--name".to_string(),
        container.to_string(),
        "--userns=keep-id".to_string(),
        format!("--memory={}", config.memory_limit),
        format!("--cpus={}", config.cpu_limit),
        "--tmpfs".to_string(),
        format!("/tmp:size={}", config.tmpfs_size),
        "-v".to_string(),
        format!("{project}:{project}:rw,z"),
        "-w".to_string(),
        project.clone(),
    ];
    if !config.network {
        wrapped.push("--network=none".to_string());
    }
    // PATH is deliberately absent so the container keeps its own.
    wrapped.push("-e".to_string());
    wrapped.push("ANTHROPIC_API_KEY".to_string());
    wrapped.push(config.image.clone());
    wrapped.extend(inner);

    info!(project = %project, network = config.network, "sandbox command built");
    wrapped
}

/// Kill a container whose `docker run` client was killed; the container
/// itself does not die with the client.
pub fn kill_container(container: &str) -> Result<()> {
    let mut cmd = Command::new("docker");
    cmd.arg("kill").arg(container);
    let out = run_command_with_timeout(cmd, None, DOCKER_CHECK_TIMEOUT, 4096, &CancelToken::new())?;
    if out.success() {
        info!(container, "container killed");
        return Ok(());
    }
    let stderr = out.stderr_lossy();
    // Exited on its own and was removed by `--rm`.
    if stderr.contains("No such container") || stderr.contains("is not running") {
        debug!(container, "container already gone");
        return Ok(());
    }
    warn!(container, exit_code = ?out.status.code(), "docker kill failed");
    bail!("docker kill {container} failed: {}", stderr.trim())
}

/// True when `docker info` answers within a few seconds.
pub fn validate_docker_available() -> bool {
    let mut cmd = Command::new("docker");
    cmd.arg("info");
    match run_command_with_timeout(cmd, None, DOCKER_CHECK_TIMEOUT, 4096, &CancelToken::new()) {
        Ok(out) => out.success(),
        Err(e) => {
            debug!(err = %e, "docker not available");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> SandboxConfig {
        SandboxConfig {
            enabled: true,
            ..SandboxConfig::default()
        }
    }

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn disabled_returns_command_unchanged() {
        let original = cmd(&["claude", "--print"]);
        let out = wrap_command(&original, Path::new("/proj"), &SandboxConfig::default(), "c1");
        assert_eq!(out, original);
    }

    #[test]
    fn enabled_wraps_with_docker_run() {
        let out = wrap_command(&cmd(&["claude", "--print"]), Path::new("/proj"), &enabled(), "c1");
        assert_eq!(&out[..3], &cmd(&["docker", "run", "--rm"])[..]);
        assert!(out.contains(&"--network=none".to_string()));
        assert!(out.contains(&"/proj:/proj:rw,z".to_string()));
        assert!(out.contains(&"nightwire-sandbox:latest".to_string()));
        let name = out.iter().position(|a| a == "--name").expect("--name");
        assert_eq!(out[name + 1], "c1");
        assert_eq!(&out[out.len() - 2..], &cmd(&["claude", "--print"])[..]);
    }

    #[test]
    fn network_enabled_omits_network_flag() {
        let config = SandboxConfig {
            network: true,
            ..enabled()
        };
        let out = wrap_command(&cmd(&["claude"]), Path::new("/proj"), &config, "c1");
        assert!(!out.contains(&"--network=none".to_string()));
    }

    #[test]
    fn passes_api_key_but_never_path() {
        let out = wrap_command(&cmd(&["claude"]), Path::new("/proj"), &enabled(), "c1");
        let key = out.iter().position(|a| a == "ANTHROPIC_API_KEY").expect("key");
        assert_eq!(out[key - 1], "-e");
        assert!(!out.iter().any(|a| a == "PATH" || a.starts_with("PATH=")));
    }

    #[test]
    fn custom_limits_are_applied() {
        let config = SandboxConfig {
            memory_limit: "4g".to_string(),
            cpu_limit: 4.0,
            tmpfs_size: "512m".to_string(),
            ..enabled()
        };
        let out = wrap_command(&cmd(&["claude"]), Path::new("/proj"), &config, "c1");
        assert!(out.contains(&"--memory=4g".to_string()));
        assert!(out.contains(&"--cpus=4".to_string()));
        assert!(out.contains(&"/tmp:size=512m".to_string()));
    }

    #[test]
    fn host_agent_path_is_rewritten() {
        let out = wrap_command(
            &cmd(&["/home/me/.local/bin/claude", "--print"]),
            Path::new("/proj"),
            &enabled(),
            "c1",
        );
        assert_eq!(&out[out.len() - 2..], &cmd(&["claude", "--print"])[..]);
    }

    #[test]
    fn container_names_are_docker_safe_and_distinct() {
        let first = container_name("task-1.b", "execution");
        let second = container_name("task-1.b", "execution");
        assert!(first.starts_with("orchestrator-task-1.b-execution-"));
        assert!(
            first
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        );
        assert_ne!(first, second);
    }
}
