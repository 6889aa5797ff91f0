//! Agent abstraction for planning and story runs.
//!
//! The [`Agent`] trait decouples the engine from the external code-generation
//! process. Tests use scripted agents that edit the plan file directly instead
//! of spawning anything.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::EventSender;
use crate::io::config::EngineConfig;
use crate::io::multiplex::OutputPumps;

/// How long output may keep flowing after a cancelled agent was killed.
pub const CANCEL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// What the agent is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Write a new plan document (or refine the one just written).
    Planning,
    /// Implement one story and update the plan document.
    Implementing,
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub mode: AgentMode,
    /// Full prompt text, written to the agent's stdin.
    pub prompt: String,
    /// Story being implemented (`Implementing` only).
    pub story_id: Option<String>,
}

impl AgentRequest {
    pub fn planning(prompt: impl Into<String>) -> Self {
        Self {
            mode: AgentMode::Planning,
            prompt: prompt.into(),
            story_id: None,
        }
    }

    pub fn implementing(story_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            mode: AgentMode::Implementing,
            prompt: prompt.into(),
            story_id: Some(story_id.into()),
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    Success,
    /// Non-zero exit; `code` is `None` when the process was killed by a signal.
    Failed { code: Option<i32> },
    Cancelled,
}

impl AgentExit {
    pub fn describe(&self) -> String {
        match self {
            AgentExit::Success => "exited successfully".to_string(),
            AgentExit::Failed { code: Some(code) } => format!("exited with status {code}"),
            AgentExit::Failed { code: None } => "terminated by signal".to_string(),
            AgentExit::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Abstraction over agent backends.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the agent once, publishing its output lines to `events`.
    ///
    /// `Err` means the agent could not be run at all; an agent that ran and
    /// failed returns `Ok(AgentExit::Failed { .. })`. All output lines are
    /// published before this returns.
    async fn invoke(
        &self,
        request: &AgentRequest,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<AgentExit>;
}

/// Agent that spawns a configured command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandAgent {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: workdir.into(),
        }
    }

    /// Build from `[agent]` config, appending `<model_flag> <model>` when set.
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        let (program, rest) = cfg
            .agent
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;
        let mut args = rest.to_vec();
        if let Some(flag) = cfg.agent.model_flag.as_deref().filter(|f| !f.is_empty()) {
            args.push(flag.to_string());
            args.push(cfg.model.clone());
        }
        Ok(Self::new(program.clone(), args, cfg.workdir.clone()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Agent for CommandAgent {
    #[instrument(skip_all, fields(mode = ?request.mode, story = request.story_id.as_deref()))]
    async fn invoke(
        &self,
        request: &AgentRequest,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<AgentExit> {
        info!(program = %self.program, workdir = %self.workdir.display(), "starting agent");
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation reaches the tools the agent spawns.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .with_context(|| format!("spawn agent {}", self.program))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let pumps = OutputPumps::spawn(stdout, stderr, events);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let prompt = request.prompt.clone();
        let feeder = tokio::spawn(async move {
            let written = stdin.write_all(prompt.as_bytes()).await;
            drop(stdin);
            written
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };
        let exit = match waited {
            Some(status) => {
                let status = status.context("wait for agent")?;
                debug!(exit_code = ?status.code(), "agent finished");
                if status.success() {
                    AgentExit::Success
                } else {
                    AgentExit::Failed {
                        code: status.code(),
                    }
                }
            }
            None => {
                warn!("cancellation requested, killing agent");
                #[cfg(unix)]
                if let Some(Err(err)) = child.id().map(kill_process_group) {
                    warn!(%err, "could not signal agent process group");
                }
                child.kill().await.context("kill agent")?;
                feeder.abort();
                pumps.finish_within(CANCEL_DRAIN_GRACE).await;
                return Ok(AgentExit::Cancelled);
            }
        };

        match feeder.await {
            Ok(Ok(())) => {}
            // An agent that exits without reading all of stdin closes the pipe early.
            Ok(Err(err)) if err.kind() == ErrorKind::BrokenPipe => {
                debug!("agent closed stdin before reading the whole prompt");
            }
            Ok(Err(err)) => warn!(%err, "failed to write prompt to agent"),
            Err(err) => warn!(%err, "prompt writer task failed"),
        }
        pumps.finish().await;
        Ok(exit)
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::other(format!("pid {pid} out of range")))?;
    // SAFETY: killpg takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::{Event, LineOrigin, channel};

    fn sh(script: &str, workdir: &std::path::Path) -> CommandAgent {
        CommandAgent::new("sh", vec!["-c".to_string(), script.to_string()], workdir)
    }

    #[test]
    fn from_config_appends_model_flag() {
        let cfg = EngineConfig::default();
        let agent = CommandAgent::from_config(&cfg).expect("agent");
        assert_eq!(agent.program(), "claude");
        assert_eq!(
            agent.args(),
            &["--print", "--dangerously-skip-permissions", "--model", "sonnet"]
        );
    }

    #[tokio::test]
    async fn streams_output_and_reads_prompt_from_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh("cat; echo oops >&2", temp.path());
        let (tx, rx) = channel(16);
        let collector = tokio::spawn(rx.collect());

        let exit = agent
            .invoke(
                &AgentRequest::planning("line one\nline two\n"),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .expect("invoke");
        drop(tx);
        assert_eq!(exit, AgentExit::Success);

        let events = collector.await.expect("collect");
        let lines: Vec<(LineOrigin, String)> = events
            .into_iter()
            .filter_map(|event| match event {
                Event::OutputLine(line) => Some((line.origin, line.text)),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&(LineOrigin::Stdout, "line one".to_string())));
        assert!(lines.contains(&(LineOrigin::Stdout, "line two".to_string())));
        assert!(lines.contains(&(LineOrigin::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_as_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = channel(16);
        let exit = sh("exit 7", temp.path())
            .invoke(
                &AgentRequest::implementing("s1", "prompt"),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .expect("invoke");
        assert_eq!(exit, AgentExit::Failed { code: Some(7) });
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let exit = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            sh("exec sleep 30", temp.path()).invoke(
                &AgentRequest::planning(""),
                &tx,
                &cancel,
            ),
        )
        .await
        .expect("should not hang")
        .expect("invoke");
        assert_eq!(exit, AgentExit::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_reaches_background_children_holding_the_pipes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let exit = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            sh("sleep 20 & wait", temp.path()).invoke(
                &AgentRequest::planning(""),
                &tx,
                &cancel,
            ),
        )
        .await
        .expect("invoke returns soon after cancellation")
        .expect("invoke");
        assert_eq!(exit, AgentExit::Cancelled);
        assert!(started.elapsed() < CANCEL_DRAIN_GRACE + std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = channel(16);
        let agent = CommandAgent::new("storyloop-no-such-agent", Vec::new(), temp.path());
        let result = agent
            .invoke(&AgentRequest::planning("x"), &tx, &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }
}
