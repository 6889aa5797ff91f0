//! Prompt rendering for planning, refinement and story runs.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::actionability::ActionabilityIssue;
use crate::plan::{Plan, Story};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");
const STORY_TEMPLATE: &str = include_str!("prompts/story.md");

/// Id/title pair for the completed and remaining story lists.
#[derive(Debug, Clone, Serialize)]
struct StorySummary<'a> {
    id: &'a str,
    title: &'a str,
}

impl<'a> From<&'a Story> for StorySummary<'a> {
    fn from(story: &'a Story) -> Self {
        Self {
            id: &story.id,
            title: &story.title,
        }
    }
}

/// Inputs for a story run prompt.
#[derive(Debug, Clone)]
pub struct StoryPrompt<'a> {
    pub plan: &'a Plan,
    pub story: &'a Story,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Plan file name as the agent should see it.
    pub plan_file: &'a str,
    pub progress_file: &'a str,
    /// Cumulative progress notes, if any exist yet.
    pub progress: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template("refine", REFINE_TEMPLATE)
            .context("load refine template")?;
        env.add_template("story", STORY_TEMPLATE)
            .context("load story template")?;
        Ok(Self { env })
    }

    /// Prompt asking the agent to write a fresh plan for `request`.
    pub fn render_plan(&self, request: &str, plan_file: &str) -> Result<String> {
        let template = self.env.get_template("plan")?;
        let rendered = template
            .render(context! {
                request => request.trim(),
                plan_file => plan_file,
            })
            .context("render plan prompt")?;
        Ok(rendered)
    }

    /// Prompt asking the agent to rewrite the vague sentences in the plan.
    pub fn render_refine(&self, issues: &[ActionabilityIssue], plan_file: &str) -> Result<String> {
        let template = self.env.get_template("refine")?;
        let rendered = template
            .render(context! {
                issues => issues,
                plan_file => plan_file,
            })
            .context("render refine prompt")?;
        Ok(rendered)
    }

    /// Prompt for implementing one story.
    pub fn render_story(&self, input: &StoryPrompt<'_>) -> Result<String> {
        let (completed, remaining): (Vec<&Story>, Vec<&Story>) = input
            .plan
            .stories
            .iter()
            .filter(|story| story.id != input.story.id)
            .partition(|story| story.passes);
        let completed: Vec<StorySummary<'_>> = completed.into_iter().map(Into::into).collect();
        let remaining: Vec<StorySummary<'_>> = remaining.into_iter().map(Into::into).collect();

        let template = self.env.get_template("story")?;
        let rendered = template
            .render(context! {
                plan_file => input.plan_file,
                progress_file => input.progress_file,
                project => input.plan.project.trim(),
                branch_name => input.plan.branch_name.trim(),
                context => input.plan.context.trim(),
                test_description => input.plan.test_description.trim(),
                story => input.story,
                attempt => input.attempt,
                completed => completed,
                remaining => remaining,
                progress => input.progress.map(str::trim).filter(|s| !s.is_empty()),
            })
            .context("render story prompt")?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with, story};

    #[test]
    fn plan_prompt_names_file_and_request() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_plan("  Add a health endpoint  ", "plan.json")
            .expect("render");
        assert!(prompt.contains("`plan.json`"));
        assert!(prompt.contains("\nAdd a health endpoint"));
    }

    #[test]
    fn refine_prompt_lists_every_issue() {
        let engine = PromptEngine::new().expect("engine");
        let issues = vec![
            ActionabilityIssue {
                story_id: "s1".to_string(),
                field: "description".to_string(),
                term: "improve".to_string(),
                sentence: "Improve the cache".to_string(),
            },
            ActionabilityIssue {
                story_id: "s2".to_string(),
                field: "acceptance_criteria[0]".to_string(),
                term: "robust".to_string(),
                sentence: "Parser is robust".to_string(),
            },
        ];
        let prompt = engine.render_refine(&issues, "plan.json").expect("render");
        assert!(prompt.contains("story `s1`, description: \"Improve the cache\""));
        assert!(prompt.contains("story `s2`, acceptance_criteria[0]"));
    }

    #[test]
    fn story_prompt_orders_sections_and_lists_neighbours() {
        let engine = PromptEngine::new().expect("engine");
        let mut plan = plan_with(vec![story("a", 1, true), story("b", 2, false), story("c", 3, false)]);
        plan.project = "demo".to_string();
        plan.context = "Uses axum 0.8.".to_string();
        plan.stories[1].acceptance_criteria = vec!["GET /b returns 200".to_string()];

        let prompt = engine
            .render_story(&StoryPrompt {
                plan: &plan,
                story: &plan.stories[1],
                attempt: 2,
                plan_file: "plan.json",
                progress_file: "progress.md",
                progress: Some("## Iteration 1\nstory a passed\n"),
            })
            .expect("render");

        let contract = prompt.find("## Story Contract").expect("contract");
        let context = prompt.find("## Established Context").expect("context");
        let story_pos = prompt.find("## Story `b`").expect("story");
        let completed = prompt.find("## Completed Stories").expect("completed");
        let remaining = prompt.find("## Remaining Stories").expect("remaining");
        let progress = prompt.find("## Progress So Far").expect("progress");
        assert!(contract < context);
        assert!(context < story_pos);
        assert!(story_pos < completed);
        assert!(completed < remaining);
        assert!(remaining < progress);

        assert!(prompt.contains("Attempt 2."));
        assert!(prompt.contains("- GET /b returns 200"));
        assert!(prompt.contains("- `a`: a title"));
        assert!(prompt.contains("- `c`: c title"));
        assert!(!prompt.contains("- `b`: b title"));
    }

    #[test]
    fn story_prompt_omits_empty_sections() {
        let engine = PromptEngine::new().expect("engine");
        let plan = plan_with(vec![story("only", 1, false)]);
        let prompt = engine
            .render_story(&StoryPrompt {
                plan: &plan,
                story: &plan.stories[0],
                attempt: 1,
                plan_file: "plan.json",
                progress_file: "progress.md",
                progress: None,
            })
            .expect("render");
        assert!(!prompt.contains("## Established Context"));
        assert!(!prompt.contains("## Completed Stories"));
        assert!(!prompt.contains("## Remaining Stories"));
        assert!(!prompt.contains("## Progress So Far"));
    }
}
