//! Scope-activity to execution index used by instantiation commands.

use std::collections::HashMap;

use crate::error::EngineResult;
use crate::tree::{ExecutionId, ExecutionTree};

/// Maps each instantiated flow scope to the scope executions currently
/// representing it. The `None` key is the process instance scope itself.
///
/// The mapping is a snapshot; rebuild it after every tree mutation.
pub struct ActivityExecutionMapping {
    scopes: HashMap<Option<String>, Vec<ExecutionId>>,
}

impl ActivityExecutionMapping {
    pub fn build(tree: &ExecutionTree) -> EngineResult<Self> {
        let mut scopes: HashMap<Option<String>, Vec<ExecutionId>> = HashMap::new();
        for id in tree.ids() {
            let execution = tree.get(id)?;
            if execution.is_scope && !execution.is_event_scope {
                scopes.entry(execution.scope_activity.clone()).or_default().push(id);
            }
        }
        for executions in scopes.values_mut() {
            executions.sort();
        }
        Ok(Self { scopes })
    }

    /// Scope executions for `scope_activity`; empty when the scope is not
    /// currently instantiated.
    pub fn executions(&self, scope_activity: Option<&str>) -> &[ExecutionId] {
        self.scopes
            .get(&scope_activity.map(str::to_string))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_scope_is_always_mapped() {
        let tree = ExecutionTree::new("pi-1");
        let mapping = ActivityExecutionMapping::build(&tree).unwrap();
        assert_eq!(mapping.executions(None), &[tree.root()]);
        assert!(mapping.executions(Some("sub")).is_empty());
    }

    #[test]
    fn test_scope_children_are_indexed_by_their_activity() {
        let mut tree = ExecutionTree::new("pi-1");
        let sub = tree.create_scope_child(tree.root(), "sub".to_string()).unwrap();
        let leaf = tree.create_child(sub).unwrap();
        tree.get_mut(leaf).unwrap().activity = Some("task".to_string());

        let mapping = ActivityExecutionMapping::build(&tree).unwrap();
        assert_eq!(mapping.executions(Some("sub")), &[sub]);
        assert_eq!(mapping.executions(None), &[tree.root()]);
    }
}
