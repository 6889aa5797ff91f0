//! Test-only helpers: plan fixtures and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::engine::{Collaborators, Engine};
use crate::events::{self, EventReceiver, EventSender, LineOrigin};
use crate::io::agent::{Agent, AgentExit, AgentRequest};
use crate::io::config::EngineConfig;
use crate::io::git::BranchManager;
use crate::io::plan_store::FilePlanStore;
use crate::plan::{Plan, Story};

/// Create a deterministic story with default fields.
pub fn story(id: &str, priority: u32, passes: bool) -> Story {
    let mut story = Story::new(id, format!("{id} title"), priority);
    story.description = format!("Add the {id} handler to the router.");
    story.acceptance_criteria = vec![format!("{id} test passes with exit code 0")];
    story.passes = passes;
    story
}

/// Create a pending story that has already failed `retry_count` times.
pub fn story_with_retries(id: &str, priority: u32, retry_count: u32) -> Story {
    let mut story = story(id, priority, false);
    story.retry_count = retry_count;
    story
}

/// Wrap stories in a plan with deterministic metadata.
pub fn plan_with(stories: Vec<Story>) -> Plan {
    Plan {
        project: "demo".to_string(),
        branch_name: "feature/demo".to_string(),
        stories,
        ..Plan::default()
    }
}

type PlanEdit = Box<dyn FnOnce(&Path) -> Result<()> + Send>;

/// How a scripted invocation ends.
enum Ending {
    Exit(AgentExit),
    Error(String),
    /// Block until the run is cancelled.
    AwaitCancel,
}

/// One scripted agent invocation: plan edits, output lines, then an exit.
pub struct Step {
    edits: Vec<PlanEdit>,
    lines: Vec<(LineOrigin, String)>,
    ending: Ending,
}

impl Step {
    fn ending(ending: Ending) -> Self {
        Self {
            edits: Vec::new(),
            lines: Vec::new(),
            ending,
        }
    }

    pub fn success() -> Self {
        Self::ending(Ending::Exit(AgentExit::Success))
    }

    pub fn exit_code(code: i32) -> Self {
        Self::ending(Ending::Exit(AgentExit::Failed { code: Some(code) }))
    }

    /// The agent process could not be run at all.
    pub fn spawn_error(message: &str) -> Self {
        Self::ending(Ending::Error(message.to_string()))
    }

    /// Wait for cancellation, then report `Cancelled`.
    pub fn until_cancelled() -> Self {
        Self::ending(Ending::AwaitCancel)
    }

    pub fn line(mut self, origin: LineOrigin, text: &str) -> Self {
        self.lines.push((origin, text.to_string()));
        self
    }

    /// Apply an arbitrary edit to the plan file path.
    pub fn edit(mut self, edit: impl FnOnce(&Path) -> Result<()> + Send + 'static) -> Self {
        self.edits.push(Box::new(edit));
        self
    }

    /// Set `passes=true` on `story_id` the way an agent would (no version bump).
    pub fn mark_passing(self, story_id: &str) -> Self {
        let id = story_id.to_string();
        self.edit(move |path| {
            edit_plan_json(path, |doc| {
                let story = find_story(doc, &id)?;
                story["passes"] = Value::Bool(true);
                Ok(())
            })
        })
    }

    /// Add `by` to the document's `version` field.
    pub fn bump_version(self, by: u64) -> Self {
        self.edit(move |path| {
            edit_plan_json(path, |doc| {
                let current = doc["version"].as_u64().unwrap_or(0);
                doc["version"] = Value::from(current + by);
                Ok(())
            })
        })
    }

    /// Overwrite the plan document with `plan` as-is.
    pub fn write_plan(self, plan: Plan) -> Self {
        self.edit(move |path| write_plan_file(path, &plan))
    }

    /// Overwrite the plan document with raw text.
    pub fn write_raw(self, text: &str) -> Self {
        let text = text.to_string();
        self.edit(move |path| {
            fs::write(path, text).with_context(|| format!("write {}", path.display()))
        })
    }
}

/// Agent that plays back [`Step`]s in order and records every request.
pub struct ScriptedAgent {
    plan_path: PathBuf,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(plan_path: impl Into<PathBuf>, steps: Vec<Step>) -> Self {
        Self {
            plan_path: plan_path.into(),
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn invocations(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(
        &self,
        request: &AgentRequest,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<AgentExit> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no steps left"))?;

        for edit in step.edits {
            edit(&self.plan_path)?;
        }
        for (origin, text) in step.lines {
            events.line(origin, text).await;
        }
        match step.ending {
            Ending::Exit(exit) => Ok(exit),
            Ending::Error(message) => Err(anyhow!(message)),
            Ending::AwaitCancel => {
                cancel.cancelled().await;
                Ok(AgentExit::Cancelled)
            }
        }
    }
}

/// Branch manager that records calls instead of running git.
#[derive(Debug, Default)]
pub struct RecordingBranches {
    branches: Mutex<Vec<String>>,
    commits: Mutex<Vec<String>>,
    fail_branch: bool,
    fail_commit: bool,
}

impl RecordingBranches {
    pub fn failing_branch() -> Self {
        Self {
            fail_branch: true,
            ..Self::default()
        }
    }

    pub fn failing_commit() -> Self {
        Self {
            fail_commit: true,
            ..Self::default()
        }
    }

    pub fn branches(&self) -> Vec<String> {
        self.branches.lock().expect("branches lock").clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().expect("commits lock").clone()
    }
}

impl BranchManager for RecordingBranches {
    fn ensure_branch(&self, name: &str) -> Result<()> {
        if self.fail_branch {
            return Err(anyhow!("cannot check out {name}"));
        }
        self.branches
            .lock()
            .expect("branches lock")
            .push(name.to_string());
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<bool> {
        if self.fail_commit {
            return Err(anyhow!("commit rejected by hook"));
        }
        self.commits
            .lock()
            .expect("commits lock")
            .push(message.to_string());
        Ok(true)
    }
}

/// Scratch working directory with a config pointing into it.
pub struct TestWorkspace {
    dir: TempDir,
    pub config: EngineConfig,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            workdir: dir.path().to_path_buf(),
            lock_timeout_ms: 500,
            event_capacity: 64,
            ..EngineConfig::default()
        };
        Self { dir, config }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn plan_path(&self) -> PathBuf {
        self.config.plan_path()
    }

    pub fn store(&self) -> FilePlanStore {
        FilePlanStore::new(self.plan_path(), self.config.lock_timeout())
            .with_retry_interval(Duration::from_millis(10))
    }

    /// Persist `plan` through the store (bumps its version) and return it.
    pub fn save_plan(&self, mut plan: Plan) -> Plan {
        self.store().save_blocking(&mut plan).expect("save plan");
        plan
    }

    pub fn read_plan(&self) -> Plan {
        self.store().load_blocking().expect("load plan")
    }

    pub fn agent(&self, steps: Vec<Step>) -> Arc<ScriptedAgent> {
        Arc::new(ScriptedAgent::new(self.plan_path(), steps))
    }

    /// Build an engine around scripted collaborators.
    pub fn engine(
        &self,
        agent: Arc<ScriptedAgent>,
        branches: Arc<RecordingBranches>,
        cancel: CancellationToken,
    ) -> (Engine, EventReceiver) {
        let (tx, rx) = events::channel(self.config.event_capacity);
        let collaborators = Collaborators {
            agent,
            store: Arc::new(self.store()),
            branches,
        };
        let engine =
            Engine::new(self.config.clone(), collaborators, tx, cancel).expect("engine");
        (engine, rx)
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a plan file directly, bypassing the store (no version bump).
pub fn write_plan_file(path: &Path, plan: &Plan) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn edit_plan_json(path: &Path, edit: impl FnOnce(&mut Value) -> Result<()>) -> Result<()> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut doc: Value = serde_json::from_str(&raw).context("parse plan json")?;
    edit(&mut doc)?;
    let mut buf = serde_json::to_string_pretty(&doc).context("serialize plan json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn find_story<'a>(doc: &'a mut Value, id: &str) -> Result<&'a mut Value> {
    doc["stories"]
        .as_array_mut()
        .and_then(|stories| stories.iter_mut().find(|story| story["id"] == id))
        .ok_or_else(|| anyhow!("story {id} not in plan"))
}
