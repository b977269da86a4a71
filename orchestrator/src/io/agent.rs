//! Code-generation agent invocation.
//!
//! The [`CodeAgent`] trait keeps the execution and verification adapters
//! independent of the actual agent backend. [`CommandAgent`] spawns a
//! configured command, feeds the prompt on stdin and takes stdout as the
//! reply. Tests substitute scripted agents that never spawn processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::{Failure, failure_from_diagnostics};
use crate::core::types::EffortTier;
use crate::io::config::{EffortArgs, OrchestratorConfig};
use crate::io::process::{Termination, run_command_with_timeout};
use crate::io::sandbox::{SandboxConfig, container_name, kill_container, wrap_command};

/// Which side of the execute/review split an agent serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Executor,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Executor => "execution",
            AgentRole::Reviewer => "verification",
        }
    }
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Task id the invocation works on.
    pub label: String,
    pub workdir: PathBuf,
    pub prompt: String,
    pub effort: EffortTier,
    pub timeout: Duration,
    /// Where to write the captured stdout/stderr.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub text: String,
}

/// Abstraction over code-generation backends.
pub trait CodeAgent: Send + Sync {
    fn invoke(&self, request: &InvokeRequest, cancel: &CancelToken) -> Result<AgentReply, Failure>;
}

/// Creates a fresh agent per invocation, so a review never shares state with
/// the execution it judges.
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, role: AgentRole) -> Box<dyn CodeAgent>;
}

/// Agent backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    role: AgentRole,
    command: Vec<String>,
    effort_args: EffortArgs,
    sandbox: SandboxConfig,
    output_limit_bytes: usize,
}

impl CommandAgent {
    pub fn from_config(role: AgentRole, cfg: &OrchestratorConfig) -> Self {
        let command = match (role, &cfg.agent.reviewer_command) {
            (AgentRole::Reviewer, Some(reviewer)) => reviewer.clone(),
            _ => cfg.agent.command.clone(),
        };
        Self {
            role,
            command,
            effort_args: cfg.agent.effort.clone(),
            sandbox: cfg.sandbox.clone(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    fn argv(&self, request: &InvokeRequest, container: &str) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend(self.effort_args.for_tier(request.effort).iter().cloned());
        wrap_command(&argv, &request.workdir, &self.sandbox, container)
    }
}

impl CodeAgent for CommandAgent {
    #[instrument(skip_all, fields(role = self.role.as_str(), task = %request.label, effort = request.effort.as_str()))]
    fn invoke(&self, request: &InvokeRequest, cancel: &CancelToken) -> Result<AgentReply, Failure> {
        let phase = self.role.as_str();
        let container = container_name(&request.label, phase);
        let argv = self.argv(request, &container);
        let Some((program, args)) = argv.split_first() else {
            return Err(Failure::Validation("agent command is empty".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        info!("invoking agent");
        let output = match run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
            cancel,
        ) {
            Ok(output) => output,
            Err(e) => {
                error!(err = %format!("{e:#}"), "agent could not be started");
                return Err(failure_from_diagnostics(phase, &format!("{e:#}")));
            }
        };

        if self.sandbox.enabled
            && output.termination != Termination::Exited
            && let Err(e) = kill_container(&container)
        {
            error!(err = %format!("{e:#}"), container = %container, "sandboxed agent may still be running");
        }

        if let Some(path) = &request.log_path
            && let Err(e) = write_log(path, &output.render_log(phase))
        {
            warn!(err = %format!("{e:#}"), "failed to write agent log");
        }

        match output.termination {
            Termination::Cancelled => return Err(Failure::Cancelled),
            Termination::TimedOut => {
                warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
                return Err(Failure::Timeout {
                    phase: phase.to_string(),
                    after: request.timeout,
                });
            }
            Termination::Exited => {}
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            let diagnostics = format!("{}\n{}", output.stderr_lossy(), output.stdout_lossy());
            return Err(failure_from_diagnostics(phase, &diagnostics));
        }

        debug!(bytes = output.stdout.len(), "agent replied");
        Ok(AgentReply {
            text: output.stdout_lossy(),
        })
    }
}

/// Launcher producing [`CommandAgent`]s from configuration.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    cfg: OrchestratorConfig,
}

impl CommandLauncher {
    pub fn new(cfg: OrchestratorConfig) -> Self {
        Self { cfg }
    }
}

impl AgentLauncher for CommandLauncher {
    fn launch(&self, role: AgentRole) -> Box<dyn CodeAgent> {
        Box::new(CommandAgent::from_config(role, &self.cfg))
    }
}

/// Parse the JSON object embedded in an agent reply.
///
/// Agents frequently wrap their answer in prose or code fences; everything
/// between the first `{` and the last `}` is taken as the payload.
pub fn parse_reply_json<T: DeserializeOwned>(phase: &str, reply: &str) -> Result<T, Failure> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(Failure::MalformedReply(format!("{phase} reply has no JSON object")));
    };
    if end < start {
        return Err(Failure::MalformedReply(format!("{phase} reply has no JSON object")));
    }
    serde_json::from_str(&reply[start..=end]).map_err(|e| {
        debug!(err = %e, "reply json did not match");
        Failure::MalformedReply(format!("{phase} reply did not match the expected shape"))
    })
}

fn write_log(path: &Path, contents: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write log {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        status: String,
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let reply = "Sure.\n```json\n{\"status\": \"done\"}\n```\nBye";
        let parsed: Payload = parse_reply_json("execution", reply).expect("parse");
        assert_eq!(parsed.status, "done");
    }

    #[test]
    fn missing_json_is_malformed_reply() {
        let err = parse_reply_json::<Payload>("verification", "no braces here").unwrap_err();
        assert!(matches!(err, Failure::MalformedReply(_)));
    }

    #[test]
    fn reviewer_uses_its_own_command_when_configured() {
        let mut cfg = OrchestratorConfig::default();
        cfg.agent.reviewer_command = Some(vec!["reviewer".to_string()]);
        let agent = CommandAgent::from_config(AgentRole::Reviewer, &cfg);
        let request = InvokeRequest {
            label: "t".to_string(),
            workdir: PathBuf::from("/proj"),
            prompt: String::new(),
            effort: EffortTier::Deep,
            timeout: Duration::from_secs(1),
            log_path: None,
        };
        assert_eq!(agent.argv(&request, "c1"), vec!["reviewer", "--model", "opus"]);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn sh_config(script: &str) -> OrchestratorConfig {
            let mut cfg = OrchestratorConfig::default();
            cfg.agent.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
            cfg.agent.effort = EffortArgs {
                minimal: Vec::new(),
                standard: Vec::new(),
                deep: Vec::new(),
            };
            cfg
        }

        fn request(dir: &Path, timeout: Duration) -> InvokeRequest {
            InvokeRequest {
                label: "t1".to_string(),
                workdir: dir.to_path_buf(),
                prompt: "do it".to_string(),
                effort: EffortTier::Standard,
                timeout,
                log_path: Some(dir.join("logs/t1/1-execution.log")),
            }
        }

        #[test]
        fn reply_is_stdout_and_log_is_written() {
            let temp = tempfile::tempdir().expect("tempdir");
            let agent = CommandAgent::from_config(AgentRole::Executor, &sh_config("cat"));
            let reply = agent
                .invoke(&request(temp.path(), Duration::from_secs(10)), &CancelToken::new())
                .expect("invoke");
            assert_eq!(reply.text, "do it");
            let log = fs::read_to_string(temp.path().join("logs/t1/1-execution.log"))
                .expect("log");
            assert!(log.contains("=== stdout ===\ndo it"));
        }

        #[test]
        fn timeout_is_reported_without_raw_output() {
            let temp = tempfile::tempdir().expect("tempdir");
            let agent = CommandAgent::from_config(AgentRole::Executor, &sh_config("sleep 30"));
            let err = agent
                .invoke(&request(temp.path(), Duration::from_millis(200)), &CancelToken::new())
                .unwrap_err();
            assert!(matches!(err, Failure::Timeout { .. }));
        }

        #[test]
        fn nonzero_exit_is_classified_from_diagnostics() {
            let temp = tempfile::tempdir().expect("tempdir");
            let agent = CommandAgent::from_config(
                AgentRole::Executor,
                &sh_config("echo 'Error: 429 Too Many Requests' >&2; exit 1"),
            );
            let err = agent
                .invoke(&request(temp.path(), Duration::from_secs(10)), &CancelToken::new())
                .unwrap_err();
            assert!(matches!(err, Failure::RateLimited(_)));
            assert!(!err.to_string().contains("429"));
        }
    }
}
