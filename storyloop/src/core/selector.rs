//! Deterministic story selection.

use crate::plan::{Plan, Story};

/// True when every story has `passes=true`.
///
/// An empty plan is complete: there is nothing left to run.
pub fn all_completed(plan: &Plan) -> bool {
    plan.stories.iter().all(|story| story.passes)
}

/// Returns true if a story can still be attempted under `retry_limit`.
pub fn is_eligible(story: &Story, retry_limit: u32) -> bool {
    !story.passes && story.retry_count < retry_limit
}

/// Returns true if a story is unfinished and out of attempts.
pub fn is_exhausted(story: &Story, retry_limit: u32) -> bool {
    !story.passes && story.retry_count >= retry_limit
}

/// Pick the most urgent eligible story.
///
/// Lowest `priority` wins; ties go to the story that appears first in the plan.
/// Returns `None` when no story is eligible, which is not the same as the plan
/// being complete (see [`all_completed`]).
pub fn next_pending_story(plan: &Plan, retry_limit: u32) -> Option<&Story> {
    plan.stories
        .iter()
        .filter(|story| is_eligible(story, retry_limit))
        .min_by_key(|story| story.priority)
}

/// Stories that are unfinished and have used up their attempts, in plan order.
pub fn exhausted_stories(plan: &Plan, retry_limit: u32) -> Vec<&Story> {
    plan.stories
        .iter()
        .filter(|story| is_exhausted(story, retry_limit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with, story, story_with_retries};

    #[test]
    fn empty_plan_is_complete_and_has_nothing_pending() {
        let plan = plan_with(Vec::new());
        assert!(all_completed(&plan));
        assert!(next_pending_story(&plan, 3).is_none());
    }

    #[test]
    fn all_completed_requires_every_story_to_pass() {
        let mut plan = plan_with(vec![story("a", 1, true), story("b", 2, false)]);
        assert!(!all_completed(&plan));
        plan.stories[1].passes = true;
        assert!(all_completed(&plan));
    }

    #[test]
    fn picks_lowest_priority_first() {
        let plan = plan_with(vec![
            story("a", 3, false),
            story("b", 1, false),
            story("c", 2, false),
        ]);
        assert_eq!(next_pending_story(&plan, 3).map(|s| s.id.as_str()), Some("b"));
    }

    #[test]
    fn ties_go_to_first_in_list() {
        let plan = plan_with(vec![
            story("x", 2, false),
            story("y", 1, false),
            story("z", 1, false),
        ]);
        assert_eq!(next_pending_story(&plan, 3).map(|s| s.id.as_str()), Some("y"));
    }

    #[test]
    fn skips_passed_and_exhausted_stories() {
        let plan = plan_with(vec![
            story("done", 1, true),
            story_with_retries("stuck", 1, 3),
            story("open", 5, false),
        ]);
        assert_eq!(
            next_pending_story(&plan, 3).map(|s| s.id.as_str()),
            Some("open")
        );
    }

    #[test]
    fn none_pending_is_distinct_from_complete() {
        let plan = plan_with(vec![
            story("done", 1, true),
            story_with_retries("stuck", 2, 2),
        ]);
        assert!(next_pending_story(&plan, 2).is_none());
        assert!(!all_completed(&plan));
        let exhausted: Vec<&str> = exhausted_stories(&plan, 2)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(exhausted, vec!["stuck"]);
    }

    #[test]
    fn never_selects_story_at_retry_limit() {
        for limit in 1..5u32 {
            let plan = plan_with(vec![
                story_with_retries("at-limit", 1, limit),
                story_with_retries("below", 9, limit - 1),
            ]);
            let selected = next_pending_story(&plan, limit).expect("selected");
            assert_eq!(selected.id, "below");
            assert!(selected.retry_count < limit);
        }
    }
}
