//! Activity-instance projection.
//!
//! [`project`] maps an [`ExecutionTree`](super::ExecutionTree) to the
//! logical activity-instance tree: one node per "visit to an activity",
//! with concurrent sibling executions grouped under their owning scope.
//! The projection is pure and idempotent; instance IDs are derived from the
//! representative execution, so two projections of an unmutated tree are
//! structurally identical. This is the only supported external addressing
//! scheme; raw execution IDs are not stable across tree surgery.

use super::{ExecutionId, ExecutionTree};
use crate::error::EngineResult;

/// Immutable snapshot of one logical activity visit.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityInstance {
    /// Stable-for-an-unmutated-tree instance ID.
    pub id: String,

    /// Activity this instance visits; `None` only on the process-instance
    /// root.
    pub activity_id: Option<String>,

    /// Executions backing this instance.
    pub execution_ids: Vec<ExecutionId>,

    /// Nested instances (scope contents, concurrent branches).
    pub children: Vec<ActivityInstance>,
}

impl ActivityInstance {
    /// Depth-first search for an instance by ID.
    pub fn find(&self, id: &str) -> Option<&ActivityInstance> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Depth-first search for the first instance visiting `activity_id`.
    pub fn find_by_activity(&self, activity_id: &str) -> Option<&ActivityInstance> {
        if self.activity_id.as_deref() == Some(activity_id) {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|child| child.find_by_activity(activity_id))
    }
}

/// Project the execution tree to its activity-instance tree.
pub fn project(tree: &ExecutionTree) -> EngineResult<ActivityInstance> {
    let root = tree.root();
    let mut children = collect(tree, root)?;

    // A compacted root carries an activity itself.
    let root_execution = tree.get(root)?;
    if let Some(activity) = &root_execution.activity {
        children.insert(0, leaf(activity, root));
    }

    Ok(ActivityInstance {
        id: tree.process_instance_id.clone(),
        activity_id: None,
        execution_ids: vec![root],
        children,
    })
}

/// Instances contributed by the descendants of `id` (not by `id` itself).
fn collect(tree: &ExecutionTree, id: ExecutionId) -> EngineResult<Vec<ActivityInstance>> {
    let mut out = Vec::new();
    for child in &tree.get(id)?.children {
        out.extend(contributions(tree, *child)?);
    }
    Ok(out)
}

fn contributions(tree: &ExecutionTree, id: ExecutionId) -> EngineResult<Vec<ActivityInstance>> {
    let execution = tree.get(id)?;

    if let Some(scope) = &execution.scope_activity {
        let mut children = collect(tree, id)?;
        // A compacted scope execution also carries an inner activity.
        if let Some(activity) = &execution.activity {
            if activity != scope {
                children.insert(0, leaf(activity, id));
            }
        }
        return Ok(vec![ActivityInstance {
            id: instance_id(scope, id),
            activity_id: Some(scope.clone()),
            execution_ids: vec![id],
            children,
        }]);
    }

    if let Some(activity) = &execution.activity {
        let mut instance = leaf(activity, id);
        instance.children = collect(tree, id)?;
        return Ok(vec![instance]);
    }

    // Inactive concurrency anchors contribute their children transparently.
    collect(tree, id)
}

fn leaf(activity: &str, execution: ExecutionId) -> ActivityInstance {
    ActivityInstance {
        id: instance_id(activity, execution),
        activity_id: Some(activity.to_string()),
        execution_ids: vec![execution],
        children: Vec::new(),
    }
}

fn instance_id(activity: &str, execution: ExecutionId) -> String {
    format!("{activity}:{execution}")
}

#[cfg(test)]
mod tests {
    use super::super::ExecutionTree;
    use super::*;

    #[test]
    fn test_projection_of_compacted_root() {
        let mut tree = ExecutionTree::new("pi-1");
        tree.get_mut(tree.root()).unwrap().activity = Some("task".into());

        let instance = project(&tree).unwrap();
        assert_eq!(instance.id, "pi-1");
        assert_eq!(instance.children.len(), 1);
        assert_eq!(instance.children[0].activity_id.as_deref(), Some("task"));
        assert_eq!(instance.children[0].execution_ids, vec![tree.root()]);
    }

    #[test]
    fn test_projection_groups_concurrent_branches() {
        let mut tree = ExecutionTree::new("pi-1");
        let b1 = tree.create_concurrent_child(tree.root()).unwrap();
        let b2 = tree.create_concurrent_child(tree.root()).unwrap();
        tree.get_mut(b1).unwrap().activity = Some("a".into());
        tree.get_mut(b2).unwrap().activity = Some("b".into());

        let instance = project(&tree).unwrap();
        let activities: Vec<_> = instance
            .children
            .iter()
            .map(|c| c.activity_id.clone().unwrap())
            .collect();
        assert_eq!(activities, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_projection_nests_scope_contents() {
        let mut tree = ExecutionTree::new("pi-1");
        let scope = tree.create_scope_child(tree.root(), "sub").unwrap();
        tree.get_mut(scope).unwrap().activity = Some("inner".into());

        let instance = project(&tree).unwrap();
        let sub = &instance.children[0];
        assert_eq!(sub.activity_id.as_deref(), Some("sub"));
        assert_eq!(sub.children.len(), 1);
        assert_eq!(sub.children[0].activity_id.as_deref(), Some("inner"));
    }

    #[test]
    fn test_projection_is_idempotent() {
        let mut tree = ExecutionTree::new("pi-1");
        let scope = tree.create_scope_child(tree.root(), "sub").unwrap();
        let b1 = tree.create_concurrent_child(scope).unwrap();
        let b2 = tree.create_concurrent_child(scope).unwrap();
        tree.get_mut(b1).unwrap().activity = Some("a".into());
        tree.get_mut(b2).unwrap().activity = Some("b".into());

        let first = project(&tree).unwrap();
        let second = project(&tree).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_find_by_id_and_activity() {
        let mut tree = ExecutionTree::new("pi-1");
        let leaf = tree.create_concurrent_child(tree.root()).unwrap();
        tree.get_mut(leaf).unwrap().activity = Some("task".into());

        let instance = project(&tree).unwrap();
        let by_activity = instance.find_by_activity("task").unwrap();
        assert_eq!(instance.find(&by_activity.id).unwrap(), by_activity);
        assert!(instance.find("nope").is_none());
    }
}
