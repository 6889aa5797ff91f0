//! Plan document model.
//!
//! The plan is a JSON document shared with the agent: the agent reads it, flips
//! `passes`, and may append notes of its own. Fields the runner does not know
//! about are captured in `extra` and written back untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// Bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub branch_name: String,
    /// Established context the agent accumulates across stories.
    #[serde(default)]
    pub context: String,
    /// Holistic description of how the finished feature is tested.
    #[serde(default)]
    pub test_description: String,
    #[serde(default)]
    pub stories: Vec<Story>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub test_guidance: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_priority() -> u32 {
    1
}

impl Plan {
    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|story| story.id == id)
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|story| story.id == id)
    }

    /// Number of stories with `passes=true`.
    pub fn passed_count(&self) -> usize {
        self.stories.iter().filter(|story| story.passes).count()
    }
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            test_guidance: String::new(),
            priority,
            passes: false,
            retry_count: 0,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = r#"{
            "version": 3,
            "project": "demo",
            "notes": {"agent": "left this"},
            "stories": [
                {"id": "s1", "title": "One", "priority": 2, "estimate": "small"}
            ]
        }"#;
        let plan: Plan = serde_json::from_str(raw).expect("parse");
        assert_eq!(plan.extra["notes"]["agent"], "left this");
        assert_eq!(plan.stories[0].extra["estimate"], "small");

        let encoded = serde_json::to_string(&plan).expect("encode");
        let again: Plan = serde_json::from_str(&encoded).expect("reparse");
        assert_eq!(again, plan);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let plan: Plan =
            serde_json::from_str(r#"{"stories": [{"id": "s1"}]}"#).expect("parse");
        assert_eq!(plan.version, 0);
        let story = &plan.stories[0];
        assert_eq!(story.priority, 1);
        assert!(!story.passes);
        assert_eq!(story.retry_count, 0);
        assert!(story.acceptance_criteria.is_empty());
    }

    #[test]
    fn story_lookup_by_id() {
        let mut plan = Plan {
            stories: vec![Story::new("a", "A", 1), Story::new("b", "B", 2)],
            ..Plan::default()
        };
        assert_eq!(plan.story("b").map(|s| s.priority), Some(2));
        plan.story_mut("a").expect("a").passes = true;
        assert_eq!(plan.passed_count(), 1);
        assert!(plan.story("missing").is_none());
    }
}
