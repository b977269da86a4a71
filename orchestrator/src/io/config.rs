//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::capacity::CapacityLimits;
use crate::core::retry::RetryPolicy;
use crate::core::types::EffortTier;
use crate::io::sandbox::SandboxConfig;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running workers.
    pub max_workers: usize,

    /// Maximum executions per task before transient failures block it.
    pub max_attempts: u32,

    /// First transient-retry delay; doubles per attempt.
    pub backoff_base_ms: u64,

    /// Upper bound on the transient-retry delay.
    pub backoff_cap_ms: u64,

    pub execution_timeout_secs: u64,
    pub verification_timeout_secs: u64,
    pub test_timeout_secs: u64,

    /// Truncate captured agent/test output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Scheduler wake-up interval while waiting on workers.
    pub poll_interval_ms: u64,

    pub agent: AgentConfig,
    pub tests: TestConfig,
    pub resources: ResourceConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command for the execution agent; the prompt is written to stdin.
    pub command: Vec<String>,
    /// Command for the review agent; defaults to `command`.
    pub reviewer_command: Option<Vec<String>>,
    pub effort: EffortArgs,
}

/// Extra arguments appended to the agent command per effort tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EffortArgs {
    pub minimal: Vec<String>,
    pub standard: Vec<String>,
    pub deep: Vec<String>,
}

impl EffortArgs {
    pub fn for_tier(&self, tier: EffortTier) -> &[String] {
        match tier {
            EffortTier::Minimal => &self.minimal,
            EffortTier::Standard => &self.standard,
            EffortTier::Deep => &self.deep,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Test-suite command (e.g. `["cargo","test"]`).
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    pub min_free_memory_mb_per_worker: u64,
    pub max_cpu_percent: f32,
}

impl Default for EffortArgs {
    fn default() -> Self {
        Self {
            minimal: vec!["--model".to_string(), "haiku".to_string()],
            standard: vec!["--model".to_string(), "sonnet".to_string()],
            deep: vec!["--model".to_string(), "opus".to_string()],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            reviewer_command: None,
            effort: EffortArgs::default(),
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: vec!["cargo".to_string(), "test".to_string()],
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            min_free_memory_mb_per_worker: 1024,
            max_cpu_percent: 90.0,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
            execution_timeout_secs: 30 * 60,
            verification_timeout_secs: 10 * 60,
            test_timeout_secs: 15 * 60,
            output_limit_bytes: 100_000,
            poll_interval_ms: 200,
            agent: AgentConfig::default(),
            tests: TestConfig::default(),
            resources: ResourceConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(anyhow!("backoff_base_ms must be <= backoff_cap_ms"));
        }
        for (name, secs) in [
            ("execution_timeout_secs", self.execution_timeout_secs),
            ("verification_timeout_secs", self.verification_timeout_secs),
            ("test_timeout_secs", self.test_timeout_secs),
        ] {
            if secs == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if !non_empty_command(&self.agent.command) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if let Some(reviewer) = &self.agent.reviewer_command
            && !non_empty_command(reviewer)
        {
            return Err(anyhow!("agent.reviewer_command must be a non-empty array"));
        }
        if !non_empty_command(&self.tests.command) {
            return Err(anyhow!("tests.command must be a non-empty array"));
        }
        if !(0.0..=100.0).contains(&self.resources.max_cpu_percent) {
            return Err(anyhow!("resources.max_cpu_percent must be within 0..=100"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    pub fn capacity_limits(&self) -> CapacityLimits {
        CapacityLimits {
            max_workers: self.max_workers,
            min_free_memory_mb_per_worker: self.resources.min_free_memory_mb_per_worker,
            max_cpu_percent: self.resources.max_cpu_percent,
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn non_empty_command(command: &[String]) -> bool {
    command.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.max_workers, 3);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = OrchestratorConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_workers = 5\n[tests]\ncommand = [\"just\", \"test\"]\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_workers, 5);
        assert_eq!(cfg.tests.command, vec!["just", "test"]);
        assert_eq!(cfg.max_attempts, 3);
    }

    #[test]
    fn rejects_inverted_backoff() {
        let cfg = OrchestratorConfig {
            backoff_base_ms: 10_000,
            backoff_cap_ms: 1_000,
            ..OrchestratorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_policy_reflects_config() {
        let cfg = OrchestratorConfig {
            max_attempts: 4,
            backoff_base_ms: 10,
            backoff_cap_ms: 50,
            ..OrchestratorConfig::default()
        };
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff(5), Duration::from_millis(50));
    }
}
