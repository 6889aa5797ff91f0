//! Engine-owned state transitions applied after the agent rewrites the plan.
//!
//! The agent is free to rewrite the plan document, but two fields only ever move
//! one way: `passes` never goes back to `false` and `retry_count` never shrinks.

use std::collections::HashMap;

use crate::plan::Plan;

/// Stories whose engine-owned fields had to be restored after a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloorSummary {
    /// Ids whose `passes` was flipped back to `true`.
    pub passes_restored: Vec<String>,
    /// Ids whose `retry_count` was raised back to its previous value.
    pub retries_restored: Vec<String>,
}

impl FloorSummary {
    pub fn is_empty(&self) -> bool {
        self.passes_restored.is_empty() && self.retries_restored.is_empty()
    }
}

/// Raise `passes`/`retry_count` in `next` to at least their values in `prev`.
///
/// Stories that only exist in `next` are left as the agent wrote them; stories
/// the agent removed are not resurrected.
pub fn floor_engine_owned(prev: &Plan, next: &mut Plan) -> FloorSummary {
    let prev_state: HashMap<&str, (bool, u32)> = prev
        .stories
        .iter()
        .map(|story| (story.id.as_str(), (story.passes, story.retry_count)))
        .collect();

    let mut summary = FloorSummary::default();
    for story in &mut next.stories {
        let Some(&(passes, retry_count)) = prev_state.get(story.id.as_str()) else {
            continue;
        };
        if passes && !story.passes {
            story.passes = true;
            summary.passes_restored.push(story.id.clone());
        }
        if story.retry_count < retry_count {
            story.retry_count = retry_count;
            summary.retries_restored.push(story.id.clone());
        }
    }
    summary
}

/// Count one failed attempt against `story_id`. Returns the new count.
pub fn record_failed_attempt(plan: &mut Plan, story_id: &str) -> Option<u32> {
    let story = plan.story_mut(story_id)?;
    story.retry_count = story.retry_count.saturating_add(1);
    Some(story.retry_count)
}

/// Make sure the next store write lands above every version seen so far.
pub fn continue_version(plan: &mut Plan, last_known: u64) {
    plan.version = plan.version.max(last_known);
}
