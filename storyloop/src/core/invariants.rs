//! Semantic checks on a plan that serde alone does not enforce.

use std::collections::HashSet;

use crate::plan::Plan;

/// Check that a freshly generated plan is usable:
/// - at least one story
/// - ids are non-empty and unique
/// - priorities are positive
pub fn validate_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.stories.is_empty() {
        errors.push("plan has no stories".to_string());
    }

    let mut seen = HashSet::new();
    for (idx, story) in plan.stories.iter().enumerate() {
        if story.id.trim().is_empty() {
            errors.push(format!("stories[{idx}]: id must not be empty"));
        } else if !seen.insert(story.id.as_str()) {
            errors.push(format!("stories[{idx}]: duplicate id '{}'", story.id));
        }
        if story.priority == 0 {
            errors.push(format!("{}: priority must be > 0", story.id));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with, story};

    #[test]
    fn well_formed_plan_has_no_errors() {
        let plan = plan_with(vec![story("a", 1, false), story("b", 1, false)]);
        assert!(validate_invariants(&plan).is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let plan = plan_with(vec![
            story("dup", 1, false),
            story("dup", 0, false),
            story(" ", 2, false),
        ]);
        let errors = validate_invariants(&plan);
        assert!(errors.iter().any(|err| err.contains("duplicate id 'dup'")));
        assert!(errors.iter().any(|err| err.contains("priority must be > 0")));
        assert!(errors.iter().any(|err| err.contains("id must not be empty")));
    }

    #[test]
    fn empty_plan_is_rejected() {
        let errors = validate_invariants(&plan_with(Vec::new()));
        assert_eq!(errors, vec!["plan has no stories".to_string()]);
    }
}
