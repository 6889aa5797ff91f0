//! Engine configuration stored in `storyloop.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::actionability::Lexicon;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "storyloop.toml";

/// Engine configuration (TOML).
///
/// Read once per run and immutable for that run. Missing fields default to the
/// values in [`EngineConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Model identifier handed to the agent command.
    pub model: String,

    /// Upper bound on story iterations per run.
    pub max_iterations: u32,

    /// Attempts a story gets before it is considered exhausted.
    pub retry_limit: u32,

    /// Plan document, relative to `workdir`.
    pub plan_file: String,

    /// Progress log the agent reads for cumulative progress, relative to `workdir`.
    pub progress_file: String,

    /// Directory the agent runs in and the plan lives in.
    pub workdir: PathBuf,

    /// How long the store waits for the plan lock before giving up.
    pub lock_timeout_ms: u64,

    /// Capacity of the event queue.
    pub event_capacity: usize,

    pub agent: AgentConfig,

    pub actionability: Lexicon,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command (and leading args) that runs the agent; the prompt goes to stdin.
    pub command: Vec<String>,
    /// Flag used to pass `model` (omitted when `None`).
    pub model_flag: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model_flag: Some("--model".to_string()),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            max_iterations: 20,
            retry_limit: 3,
            plan_file: "plan.json".to_string(),
            progress_file: "progress.md".to_string(),
            workdir: PathBuf::from("."),
            lock_timeout_ms: 5_000,
            event_capacity: 256,
            agent: AgentConfig::default(),
            actionability: Lexicon::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_limit == 0 {
            return Err(anyhow!("retry_limit must be > 0"));
        }
        if self.plan_file.trim().is_empty() {
            return Err(anyhow!("plan_file must not be empty"));
        }
        if self.progress_file.trim().is_empty() {
            return Err(anyhow!("progress_file must not be empty"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(anyhow!("lock_timeout_ms must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn plan_path(&self) -> PathBuf {
        self.workdir.join(&self.plan_file)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.workdir.join(&self.progress_file)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
