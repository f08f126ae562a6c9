//! Parent/level/cycle rules for the vision → milestone → focus → intention
//! forest.

use std::collections::{HashMap, HashSet};

use crate::error::HierarchyError;

use super::goal::{Goal, GoalLevel};

/// Read access to the goals a hierarchy check runs against.
pub trait GoalIndex {
    fn goal(&self, id: &str) -> Option<&Goal>;

    fn goals(&self) -> Vec<&Goal>;

    fn goal_count(&self) -> usize {
        self.goals().len()
    }
}

impl GoalIndex for HashMap<String, Goal> {
    fn goal(&self, id: &str) -> Option<&Goal> {
        self.get(id)
    }

    fn goals(&self) -> Vec<&Goal> {
        self.values().collect()
    }

    fn goal_count(&self) -> usize {
        self.len()
    }
}

/// Check that `child_id` at `child_level` may hang under `parent_id` and
/// return the resolved parent, whose level the caller stamps as
/// `parent_level`.
///
/// A missing parent where one is expected is allowed (intentions in
/// particular often live unlinked) and only logged.
pub fn ensure_valid_parent_link<'a>(
    index: &'a impl GoalIndex,
    child_id: &str,
    child_level: GoalLevel,
    parent_id: Option<&str>,
) -> Result<Option<&'a Goal>, HierarchyError> {
    let expected = child_level.expected_parent_level();

    let (expected, parent_id) = match (expected, parent_id) {
        (None, None) => return Ok(None),
        (None, Some(parent_id)) => {
            return Err(HierarchyError::VisionWithParent {
                child_id: child_id.to_string(),
                parent_id: parent_id.to_string(),
            });
        }
        (Some(expected), None) => {
            log::warn!(
                "{} {} has no parent; expected a {}",
                child_level,
                child_id,
                expected
            );
            return Ok(None);
        }
        (Some(expected), Some(parent_id)) => (expected, parent_id),
    };

    let parent = index
        .goal(parent_id)
        .ok_or_else(|| HierarchyError::ParentNotFound(parent_id.to_string()))?;

    if parent.level != expected {
        return Err(HierarchyError::LevelMismatch {
            child: child_level,
            expected,
            actual: parent.level,
            parent_id: parent_id.to_string(),
        });
    }

    if creates_cycle(index, child_id, parent) {
        return Err(HierarchyError::CircularHierarchy {
            child_id: child_id.to_string(),
            parent_id: parent_id.to_string(),
        });
    }

    Ok(Some(parent))
}

/// Walk upward from `parent`; true if `child_id` shows up. The walk also
/// stops on an already-visited node, so a pre-existing loop elsewhere in
/// the data cannot hang it.
fn creates_cycle(index: &impl GoalIndex, child_id: &str, parent: &Goal) -> bool {
    let limit = index.goal_count() + 1;
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = Some(parent);

    while let Some(goal) = current {
        if goal.id == child_id {
            return true;
        }
        if !visited.insert(goal.id.as_str()) || visited.len() > limit {
            return false;
        }
        current = goal.parent_id().and_then(|id| index.goal(id));
    }
    false
}

/// Check a level change against the goal's existing children.
pub fn ensure_children_accept_level(
    index: &impl GoalIndex,
    goal_id: &str,
    new_level: GoalLevel,
) -> Result<(), HierarchyError> {
    for child in children_of(index, goal_id) {
        if let Some(expected) = child.level.expected_parent_level() {
            if expected != new_level {
                return Err(HierarchyError::LevelMismatch {
                    child: child.level,
                    expected,
                    actual: new_level,
                    parent_id: goal_id.to_string(),
                });
            }
        }
    }
    Ok(())
}

pub fn children_of<'a>(index: &'a impl GoalIndex, id: &str) -> Vec<&'a Goal> {
    let mut children: Vec<&Goal> = index
        .goals()
        .into_iter()
        .filter(|g| g.parent_id() == Some(id))
        .collect();
    children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    children
}

/// Parent, grandparent, … of `id`, nearest first. Bounded like the cycle
/// check so corrupt data cannot loop forever.
pub fn ancestors_of<'a>(index: &'a impl GoalIndex, id: &str) -> Vec<&'a Goal> {
    let mut ancestors = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    visited.insert(id);

    let mut current = index.goal(id).and_then(|g| g.parent_id());
    while let Some(parent_id) = current {
        let Some(parent) = index.goal(parent_id) else {
            break;
        };
        if !visited.insert(parent.id.as_str()) {
            break;
        }
        ancestors.push(parent);
        current = parent.parent_id();
    }
    ancestors
}

/// Re-check every stored link. Used after pulling remote data, which
/// bypassed mutation-time validation.
pub fn validate_all(index: &impl GoalIndex) -> Vec<(String, HierarchyError)> {
    let mut problems: Vec<(String, HierarchyError)> = index
        .goals()
        .into_iter()
        .filter_map(|goal| {
            match ensure_valid_parent_link(index, &goal.id, goal.level, goal.parent_id()) {
                Ok(_) => None,
                Err(e) => Some((goal.id.clone(), e)),
            }
        })
        .collect();
    problems.sort_by(|a, b| a.0.cmp(&b.0));
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::goal::ParentLink;
    use chrono::NaiveDate;

    fn index(goals: &[Goal]) -> HashMap<String, Goal> {
        goals.iter().map(|g| (g.id.clone(), g.clone())).collect()
    }

    fn tree() -> (Goal, Goal, Goal, Goal) {
        let v = Goal::vision("Healthy year", 2025).with_id("v");
        let m = Goal::milestone("Run a 10k", 2025, 4, 2).with_id("m").with_parent("v");
        let f = Goal::focus("Base miles", NaiveDate::from_ymd_opt(2025, 4, 7).unwrap(), 2)
            .with_id("f")
            .with_parent("m");
        let i = Goal::intention("Tempo run", NaiveDate::from_ymd_opt(2025, 4, 9).unwrap())
            .with_id("i")
            .with_parent("f");
        (v, m, f, i)
    }

    #[test]
    fn valid_chain_resolves_parents() {
        let (v, m, f, i) = tree();
        let idx = index(&[v, m, f, i]);
        assert_eq!(
            ensure_valid_parent_link(&idx, "m", GoalLevel::Milestone, Some("v"))
                .unwrap()
                .map(|p| p.level),
            Some(GoalLevel::Vision)
        );
        assert!(ensure_valid_parent_link(&idx, "i", GoalLevel::Intention, Some("f")).is_ok());
        assert_eq!(
            ensure_valid_parent_link(&idx, "v", GoalLevel::Vision, None).unwrap(),
            None
        );
    }

    #[test]
    fn vision_cannot_have_parent() {
        let (v, m, ..) = tree();
        let idx = index(&[v, m]);
        let err = ensure_valid_parent_link(&idx, "v2", GoalLevel::Vision, Some("m")).unwrap_err();
        assert!(matches!(err, HierarchyError::VisionWithParent { .. }));
        assert!(err.to_string().contains("vision cannot have a parent"));
    }

    #[test]
    fn missing_parent_is_allowed_for_linked_levels() {
        let idx = index(&[]);
        assert_eq!(
            ensure_valid_parent_link(&idx, "i", GoalLevel::Intention, None).unwrap(),
            None
        );
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let idx = index(&[]);
        let err = ensure_valid_parent_link(&idx, "m", GoalLevel::Milestone, Some("ghost")).unwrap_err();
        assert_eq!(err, HierarchyError::ParentNotFound("ghost".into()));
    }

    #[test]
    fn milestone_under_focus_is_level_mismatch() {
        let (v, m, f, i) = tree();
        let idx = index(&[v, m, f, i]);
        let err = ensure_valid_parent_link(&idx, "m2", GoalLevel::Milestone, Some("f")).unwrap_err();
        match &err {
            HierarchyError::LevelMismatch { expected, actual, .. } => {
                assert_eq!(*expected, GoalLevel::Vision);
                assert_eq!(*actual, GoalLevel::Focus);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("vision") && msg.contains("focus"));
    }

    #[test]
    fn milestone_under_intention_is_level_mismatch() {
        let (v, m, f, i) = tree();
        let idx = index(&[v, m, f, i]);
        let err = ensure_valid_parent_link(&idx, "m", GoalLevel::Milestone, Some("i")).unwrap_err();
        assert!(matches!(
            err,
            HierarchyError::LevelMismatch { actual: GoalLevel::Intention, .. }
        ));
    }

    #[test]
    fn transitive_self_ancestry_is_rejected() {
        // Corrupt data where the vision points back down at the milestone;
        // re-linking the milestone under it must be caught by the walk.
        let (mut v, m, ..) = tree();
        v.parent = ParentLink::Linked("m".into());
        let idx = index(&[v, m]);
        let err = ensure_valid_parent_link(&idx, "m", GoalLevel::Milestone, Some("v")).unwrap_err();
        assert!(matches!(err, HierarchyError::CircularHierarchy { .. }));
    }

    #[test]
    fn preexisting_loop_elsewhere_terminates() {
        let a = Goal::vision("a", 2025).with_id("a").with_parent("b");
        let b = Goal::vision("b", 2025).with_id("b").with_parent("a");
        let c = Goal::milestone("c", 2025, 1, 1).with_id("c");
        let idx = index(&[a, b, c]);
        assert!(ensure_valid_parent_link(&idx, "c", GoalLevel::Milestone, Some("a")).is_ok());
    }

    #[test]
    fn level_change_checked_against_children() {
        let (v, m, f, i) = tree();
        let idx = index(&[v, m, f, i]);
        assert!(ensure_children_accept_level(&idx, "f", GoalLevel::Focus).is_ok());
        assert!(ensure_children_accept_level(&idx, "f", GoalLevel::Milestone).is_err());
    }

    #[test]
    fn ancestors_and_children() {
        let (v, m, f, i) = tree();
        let idx = index(&[v, m, f, i]);
        let ids: Vec<&str> = ancestors_of(&idx, "i").iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["f", "m", "v"]);
        let kids: Vec<&str> = children_of(&idx, "m").iter().map(|g| g.id.as_str()).collect();
        assert_eq!(kids, vec!["f"]);
    }

    #[test]
    fn validate_all_reports_bad_links() {
        let (v, m, f, mut i) = tree();
        i.parent = ParentLink::Linked("v".into());
        let idx = index(&[v, m, f, i]);
        let problems = validate_all(&idx);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].0, "i");
    }
}
