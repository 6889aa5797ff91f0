//! Execution engine: generate or load a plan, then drive it story by story.
//!
//! # Loop
//!
//! Each iteration picks the most urgent eligible story, hands it to the agent,
//! and then treats the plan file as the source of truth: the agent reports
//! success by flipping `passes` in the document, not through its exit status.
//! After every invocation the engine reloads the plan, checks the version for
//! outside writes, restores fields only the engine may lower, counts failed
//! attempts, and persists.
//!
//! The loop stops when every story passes (the plan is deleted), when no story
//! is eligible any more, at the iteration ceiling, on cancellation, or when the
//! store can no longer be trusted. Every stop other than completion publishes
//! exactly one `RunFailed` event.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::actionability::{ActionabilityChecker, ActionabilityIssue};
use crate::core::invariants::validate_invariants;
use crate::core::selector::{all_completed, exhausted_stories, next_pending_story};
use crate::core::state_update::{continue_version, floor_engine_owned, record_failed_attempt};
use crate::core::version::VersionChange;
use crate::error::{EngineError, StoreError, StoryFailure};
use crate::events::{Event, EventSender, StoryOutcome};
use crate::io::agent::{Agent, AgentExit, AgentRequest, CommandAgent};
use crate::io::config::EngineConfig;
use crate::io::git::{BranchManager, Git};
use crate::io::plan_store::{FilePlanStore, PlanStore, scratch_globs};
use crate::io::progress_log::{self, ProgressEntry};
use crate::io::prompt::{PromptEngine, StoryPrompt};
use crate::plan::Plan;

/// The engine's injected collaborators.
pub struct Collaborators {
    pub agent: Arc<dyn Agent>,
    pub store: Arc<dyn PlanStore>,
    pub branches: Arc<dyn BranchManager>,
}

impl Collaborators {
    /// Command agent, file store and git, all rooted at `cfg.workdir`.
    pub fn production(cfg: &EngineConfig) -> Result<Self> {
        Ok(Self {
            agent: Arc::new(CommandAgent::from_config(cfg)?),
            store: Arc::new(FilePlanStore::new(cfg.plan_path(), cfg.lock_timeout())),
            branches: Arc::new(
                Git::new(cfg.workdir.clone()).with_excluded(scratch_globs(&cfg.plan_file)),
            ),
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    agent: Arc<dyn Agent>,
    store: Arc<dyn PlanStore>,
    branches: Arc<dyn BranchManager>,
    events: EventSender,
    cancel: CancellationToken,
    checker: ActionabilityChecker,
    prompts: PromptEngine,
}

/// What the reload after a story invocation found.
struct StoryResult {
    outcome: StoryOutcome,
    retry_count: u32,
    /// The story passes on disk, whatever the agent's exit status said.
    passes: bool,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let checker =
            ActionabilityChecker::new(&config.actionability).context("compile actionability lexicon")?;
        let prompts = PromptEngine::new()?;
        Ok(Self {
            config,
            agent: collaborators.agent,
            store: collaborators.store,
            branches: collaborators.branches,
            events,
            cancel,
            checker,
            prompts,
        })
    }

    /// Ask the agent for a new plan and persist it once it is well-formed and actionable.
    ///
    /// Any plan left over from an earlier run is deleted first. A plan that fails
    /// the actionability check gets exactly one refinement round.
    #[instrument(skip_all)]
    pub async fn generate(&self, prompt: &str) -> Result<Plan, EngineError> {
        match self.generate_plan(prompt).await {
            Ok(plan) => Ok(plan),
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Resume from the persisted plan.
    #[instrument(skip_all)]
    pub async fn load(&self) -> Result<Plan, EngineError> {
        match self.load_existing().await {
            Ok(plan) => Ok(plan),
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Drive `plan` until every story passes. `Ok` only on full completion.
    #[instrument(skip_all, fields(project = %plan.project))]
    pub async fn run(&self, plan: Plan) -> Result<(), EngineError> {
        match self.run_loop(plan).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn fail(&self, err: EngineError) -> EngineError {
        warn!(%err, "stopping");
        self.events
            .publish(Event::RunFailed {
                reason: err.failure_reason(),
            })
            .await;
        err
    }

    async fn generate_plan(&self, prompt: &str) -> Result<Plan, EngineError> {
        self.store.delete().await?;
        self.events
            .publish(Event::PlanningStarted {
                prompt: prompt.to_string(),
            })
            .await;

        let plan_prompt = self
            .prompts
            .render_plan(prompt, &self.config.plan_file)
            .map_err(|err| EngineError::Generation(format!("{err:#}")))?;
        self.invoke_planner(plan_prompt).await?;
        let mut plan = self.load_generated().await?;

        let issues = self.checker.check_plan(&plan);
        if !issues.is_empty() {
            info!(issues = issues.len(), "plan is not actionable, refining");
            self.events
                .warn(format!(
                    "plan has {} vague sentence(s); asking the agent to refine it",
                    issues.len()
                ))
                .await;
            let refine_prompt = self
                .prompts
                .render_refine(&issues, &self.config.plan_file)
                .map_err(|err| EngineError::Generation(format!("{err:#}")))?;
            self.invoke_planner(refine_prompt).await?;
            plan = self.load_generated().await?;

            let remaining = self.checker.check_plan(&plan);
            if !remaining.is_empty() {
                return Err(EngineError::Generation(format!(
                    "plan is still not actionable after refinement: {}",
                    join_issues(&remaining)
                )));
            }
        }

        self.store.save(&mut plan).await?;
        info!(stories = plan.stories.len(), version = plan.version, "plan ready");
        self.publish_ready(&plan).await;
        Ok(plan)
    }

    async fn invoke_planner(&self, prompt: String) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let exit = self
            .agent
            .invoke(&AgentRequest::planning(prompt), &self.events, &self.cancel)
            .await
            .map_err(|err| {
                EngineError::Generation(format!("could not run the planning agent: {err:#}"))
            })?;
        match exit {
            AgentExit::Success => Ok(()),
            AgentExit::Cancelled => Err(EngineError::Cancelled),
            failed => Err(EngineError::Generation(format!(
                "planning agent {}",
                failed.describe()
            ))),
        }
    }

    async fn load_generated(&self) -> Result<Plan, EngineError> {
        let plan = self.store.load().await.map_err(|err| match err {
            StoreError::NotFound { path } => EngineError::Generation(format!(
                "agent did not write a plan to {}",
                path.display()
            )),
            StoreError::Corrupt { path, reason } => EngineError::Generation(format!(
                "plan at {} is unreadable: {reason}",
                path.display()
            )),
            other => other.into(),
        })?;
        let problems = validate_invariants(&plan);
        if !problems.is_empty() {
            return Err(EngineError::Generation(format!(
                "plan is malformed: {}",
                problems.join("; ")
            )));
        }
        Ok(plan)
    }

    async fn load_existing(&self) -> Result<Plan, EngineError> {
        let plan = self.store.load().await.map_err(|err| match err {
            StoreError::NotFound { path } => EngineError::Load {
                path,
                reason: "no plan file (generate one first)".to_string(),
            },
            StoreError::Corrupt { path, reason } => EngineError::Load { path, reason },
            other => other.into(),
        })?;
        let problems = validate_invariants(&plan);
        if !problems.is_empty() {
            self.events
                .warn(format!("loaded plan has problems: {}", problems.join("; ")))
                .await;
        }
        debug!(version = plan.version, "plan loaded");
        self.publish_ready(&plan).await;
        Ok(plan)
    }

    async fn publish_ready(&self, plan: &Plan) {
        self.events
            .publish(Event::PlanReady {
                project: plan.project.clone(),
                branch_name: plan.branch_name.clone(),
                version: plan.version,
                stories: plan.stories.len(),
                passed: plan.passed_count(),
            })
            .await;
    }

    async fn run_loop(&self, mut plan: Plan) -> Result<(), EngineError> {
        self.prepare_branch(&plan).await?;

        let retry_limit = self.config.retry_limit;
        let mut last_version = plan.version;
        let mut iteration: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                info!(iteration, "cancellation requested");
                return Err(EngineError::Cancelled);
            }
            if all_completed(&plan) {
                self.store.delete().await?;
                info!(iterations = iteration, "all stories pass");
                self.events
                    .publish(Event::RunCompleted {
                        iterations: iteration,
                    })
                    .await;
                return Ok(());
            }
            let Some(story) = next_pending_story(&plan, retry_limit) else {
                return Err(EngineError::RetryExhausted {
                    stories: exhausted_stories(&plan, retry_limit)
                        .into_iter()
                        .map(StoryFailure::from)
                        .collect(),
                });
            };
            if iteration >= self.config.max_iterations {
                return Err(EngineError::IterationCeiling {
                    max_iterations: self.config.max_iterations,
                    pending: plan
                        .stories
                        .iter()
                        .filter(|story| !story.passes)
                        .map(StoryFailure::from)
                        .collect(),
                });
            }

            iteration += 1;
            let story_id = story.id.clone();
            let title = story.title.clone();
            let attempt = story.retry_count.saturating_add(1);
            info!(iteration, story = %story_id, attempt, "starting story");
            self.events
                .publish(Event::StoryStarted {
                    iteration,
                    story_id: story_id.clone(),
                    title: title.clone(),
                    attempt,
                })
                .await;

            let result = self
                .run_story(&mut plan, &mut last_version, &story_id, attempt)
                .await?;
            info!(iteration, story = %story_id, outcome = ?result.outcome, "story finished");
            self.events
                .publish(Event::StoryFinished {
                    iteration,
                    story_id: story_id.clone(),
                    outcome: result.outcome.clone(),
                    retry_count: result.retry_count,
                })
                .await;

            self.record_progress(ProgressEntry {
                iteration,
                story_id: &story_id,
                title: &title,
                outcome: &result.outcome,
                retry_count: result.retry_count,
                retry_limit,
            })
            .await;
            if result.passes {
                self.commit_story(&story_id, &title).await;
            }
        }
    }

    /// Invoke the agent for one story and fold its side effects into `plan`.
    async fn run_story(
        &self,
        plan: &mut Plan,
        last_version: &mut u64,
        story_id: &str,
        attempt: u32,
    ) -> Result<StoryResult, EngineError> {
        let before = plan.clone();
        let exit = match self.story_prompt(plan, story_id, attempt).await {
            Ok(prompt) => {
                let request = AgentRequest::implementing(story_id, prompt);
                self.agent
                    .invoke(&request, &self.events, &self.cancel)
                    .await
            }
            Err(err) => Err(err),
        };
        let invocation_failure = match &exit {
            Ok(AgentExit::Success | AgentExit::Cancelled) => None,
            Ok(failed) => Some(failed.describe()),
            Err(err) => Some(format!("{err:#}")),
        };
        let cancelled = matches!(exit, Ok(AgentExit::Cancelled));

        let mut reloaded = self.store.load().await.map_err(|err| match err {
            StoreError::NotFound { path } => EngineError::CorruptState {
                path,
                reason: "plan file disappeared during the story run".to_string(),
            },
            other => other.into(),
        })?;

        let change = VersionChange::between(*last_version, reloaded.version);
        if let Some(message) = change.describe() {
            warn!(?change, "plan version conflict");
            self.events.warn(message).await;
        }
        continue_version(&mut reloaded, *last_version);
        *last_version = reloaded.version;

        let floor = floor_engine_owned(&before, &mut reloaded);
        if !floor.is_empty() {
            self.events
                .warn(format!(
                    "agent lowered engine-owned fields; restored passes for [{}], retry_count for [{}]",
                    floor.passes_restored.join(", "),
                    floor.retries_restored.join(", ")
                ))
                .await;
        }

        let passes = match reloaded.story(story_id) {
            Some(story) => story.passes,
            None => {
                self.events
                    .warn(format!("story {story_id} is no longer in the plan"))
                    .await;
                false
            }
        };
        let outcome = if cancelled {
            StoryOutcome::Cancelled
        } else if let Some(reason) = invocation_failure {
            let err = EngineError::StoryInvocation {
                story_id: story_id.to_string(),
                reason: reason.clone(),
            };
            warn!(%err, "counting as failed attempt");
            StoryOutcome::InvocationFailed { reason }
        } else if passes {
            StoryOutcome::Passed
        } else {
            StoryOutcome::NotPassing
        };

        let mut dirty = !floor.is_empty();
        if matches!(
            outcome,
            StoryOutcome::NotPassing | StoryOutcome::InvocationFailed { .. }
        ) && record_failed_attempt(&mut reloaded, story_id).is_some()
        {
            dirty = true;
        }
        if dirty {
            self.store.save(&mut reloaded).await?;
            *last_version = reloaded.version;
        }

        let retry_count = reloaded
            .story(story_id)
            .map_or(0, |story| story.retry_count);
        *plan = reloaded;
        Ok(StoryResult {
            outcome,
            retry_count,
            passes,
        })
    }

    async fn story_prompt(&self, plan: &Plan, story_id: &str, attempt: u32) -> Result<String> {
        let story = plan
            .story(story_id)
            .with_context(|| format!("story {story_id} not in plan"))?;
        let progress_path = self.config.progress_path();
        let progress = match off_thread(move || progress_log::read_tail(&progress_path)).await {
            Ok(progress) => progress,
            Err(err) => {
                warn!(%err, "could not read progress log");
                None
            }
        };
        self.prompts.render_story(&StoryPrompt {
            plan,
            story,
            attempt,
            plan_file: &self.config.plan_file,
            progress_file: &self.config.progress_file,
            progress: progress.as_deref(),
        })
    }

    async fn prepare_branch(&self, plan: &Plan) -> Result<(), EngineError> {
        let name = plan.branch_name.trim().to_string();
        if name.is_empty() {
            debug!("plan names no branch, staying on the current one");
            return Ok(());
        }
        let branches = Arc::clone(&self.branches);
        off_thread(move || branches.ensure_branch(&name))
            .await
            .map_err(EngineError::Branch)
    }

    async fn record_progress(&self, entry: ProgressEntry<'_>) {
        let path = self.config.progress_path();
        let text = entry.render();
        if let Err(err) = off_thread(move || progress_log::append_text(&path, &text)).await {
            self.events
                .publish(Event::Error {
                    message: format!("could not append to progress log: {err:#}"),
                })
                .await;
        }
    }

    async fn commit_story(&self, story_id: &str, title: &str) {
        let message = format!("feat: {story_id} - {title}");
        let branches = Arc::clone(&self.branches);
        match off_thread(move || branches.commit(&message)).await {
            Ok(true) => debug!(story = story_id, "committed"),
            Ok(false) => debug!(story = story_id, "nothing to commit"),
            Err(err) => {
                self.events
                    .publish(Event::Error {
                        message: format!("commit after story {story_id} failed: {err:#}"),
                    })
                    .await;
            }
        }
    }
}

/// Run blocking file or process work on tokio's blocking pool.
async fn off_thread<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("blocking task failed")?
}

fn join_issues(issues: &[ActionabilityIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FailureReason, LineOrigin};
    use crate::test_support::{
        RecordingBranches, Step, TestWorkspace, plan_with, story, story_with_retries,
    };

    #[tokio::test]
    async fn empty_plan_completes_without_invoking() {
        let ws = TestWorkspace::new();
        let plan = ws.save_plan(plan_with(Vec::new()));
        let agent = ws.agent(Vec::new());
        let (engine, rx) = ws.engine(
            agent.clone(),
            Arc::new(RecordingBranches::default()),
            CancellationToken::new(),
        );

        engine.run(plan).await.expect("run");
        drop(engine);
        let events = rx.collect().await;
        assert_eq!(events, vec![Event::RunCompleted { iterations: 0 }]);
        assert_eq!(agent.invocations(), 0);
        assert!(!ws.plan_path().exists());
    }

    #[tokio::test]
    async fn agent_failure_with_story_passing_still_counts_an_attempt() {
        let ws = TestWorkspace::new();
        let plan = ws.save_plan(plan_with(vec![story("a", 1, false)]));
        let agent = ws.agent(vec![Step::exit_code(1).mark_passing("a")]);
        let (engine, rx) = ws.engine(
            agent,
            Arc::new(RecordingBranches::default()),
            CancellationToken::new(),
        );
        let collector = tokio::spawn(rx.collect());

        // The story passes on disk, so the next check completes the run.
        engine.run(plan).await.expect("run");
        drop(engine);
        let events = collector.await.expect("collect");
        let finished = events
            .iter()
            .find_map(|event| match event {
                Event::StoryFinished {
                    outcome,
                    retry_count,
                    ..
                } => Some((outcome.clone(), *retry_count)),
                _ => None,
            })
            .expect("finished");
        assert!(matches!(finished.0, StoryOutcome::InvocationFailed { .. }));
        assert_eq!(finished.1, 1);
    }

    #[tokio::test]
    async fn spawn_errors_are_absorbed_as_retries() {
        let ws = TestWorkspace::new();
        let plan = ws.save_plan(plan_with(vec![story("a", 1, false)]));
        let agent = ws.agent(vec![
            Step::spawn_error("no such binary"),
            Step::success().mark_passing("a"),
        ]);
        let (engine, rx) = ws.engine(
            agent.clone(),
            Arc::new(RecordingBranches::default()),
            CancellationToken::new(),
        );
        let collector = tokio::spawn(rx.collect());

        engine.run(plan).await.expect("run");
        drop(engine);
        collector.await.expect("collect");
        assert_eq!(agent.invocations(), 2);
    }

    #[tokio::test]
    async fn passing_story_is_committed_and_logged() {
        let ws = TestWorkspace::new();
        let plan = ws.save_plan(plan_with(vec![story("a", 1, false)]));
        let agent = ws.agent(vec![
            Step::success()
                .line(LineOrigin::Stdout, "working on a")
                .mark_passing("a"),
        ]);
        let branches = Arc::new(RecordingBranches::default());
        let (engine, rx) = ws.engine(agent.clone(), branches.clone(), CancellationToken::new());
        let collector = tokio::spawn(rx.collect());

        engine.run(plan).await.expect("run");
        drop(engine);
        collector.await.expect("collect");

        assert_eq!(branches.branches(), vec!["feature/demo".to_string()]);
        assert_eq!(branches.commits(), vec!["feat: a - a title".to_string()]);
        let progress =
            std::fs::read_to_string(ws.config.progress_path()).expect("progress log");
        assert!(progress.contains("## Iteration 1: a (a title)"));

        let request = &agent.requests()[0];
        assert_eq!(request.story_id.as_deref(), Some("a"));
        assert!(request.prompt.contains("## Story `a`: a title"));
    }

    #[tokio::test]
    async fn commit_failure_is_reported_but_not_fatal() {
        let ws = TestWorkspace::new();
        let plan = ws.save_plan(plan_with(vec![story("a", 1, false)]));
        let agent = ws.agent(vec![Step::success().mark_passing("a")]);
        let (engine, rx) = ws.engine(
            agent,
            Arc::new(RecordingBranches::failing_commit()),
            CancellationToken::new(),
        );
        let collector = tokio::spawn(rx.collect());

        engine.run(plan).await.expect("run completes");
        drop(engine);
        let events = collector.await.expect("collect");
        assert!(events.iter().any(|event| matches!(
            event,
            Event::Error { message } if message.contains("commit after story a failed")
        )));
        assert!(matches!(events.last(), Some(Event::RunCompleted { .. })));
    }

    #[tokio::test]
    async fn branch_failure_aborts_before_any_story() {
        let ws = TestWorkspace::new();
        let plan = ws.save_plan(plan_with(vec![story("a", 1, false)]));
        let agent = ws.agent(Vec::new());
        let (engine, rx) = ws.engine(
            agent.clone(),
            Arc::new(RecordingBranches::failing_branch()),
            CancellationToken::new(),
        );
        let collector = tokio::spawn(rx.collect());

        let err = engine.run(plan).await.expect_err("branch failure");
        drop(engine);
        assert!(matches!(err, EngineError::Branch(_)));
        assert_eq!(agent.invocations(), 0);
        let events = collector.await.expect("collect");
        assert!(matches!(
            events.as_slice(),
            [Event::RunFailed {
                reason: FailureReason::Invalid { .. }
            }]
        ));
    }

    #[tokio::test]
    async fn agent_cannot_lower_engine_owned_fields() {
        let ws = TestWorkspace::new();
        let plan = ws.save_plan(plan_with(vec![
            story("done", 1, true),
            story_with_retries("b", 2, 1),
        ]));
        let mut rolled_back = plan.clone();
        rolled_back.stories[0].passes = false;
        rolled_back.stories[1].retry_count = 0;
        rolled_back.stories[1].passes = true;
        let agent = ws.agent(vec![Step::success().write_plan(rolled_back)]);
        let (engine, rx) = ws.engine(
            agent,
            Arc::new(RecordingBranches::default()),
            CancellationToken::new(),
        );
        let collector = tokio::spawn(rx.collect());

        engine.run(plan).await.expect("run");
        drop(engine);
        let events = collector.await.expect("collect");
        assert!(events.iter().any(|event| matches!(
            event,
            Event::Warning { message } if message.contains("restored passes for [done]")
        )));
        assert!(matches!(events.last(), Some(Event::RunCompleted { iterations: 1 })));
    }
}
