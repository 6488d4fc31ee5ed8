use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use runq_model::TaskIdentity;
use tracing::{trace, warn};

use crate::{error::CoreError, lock};

/// Registry of task slots and their parent -> children fan-out.
///
/// Submitting work to a parent slot cancels the current work of every slot
/// reachable through its children.
#[derive(Default)]
pub struct TaskGraph {
    nodes: RwLock<HashMap<TaskIdentity, Vec<TaskIdentity>>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task kind. The first registration stands; a duplicate is
    /// reported and ignored.
    pub fn register(&self, identity: TaskIdentity) -> bool {
        let mut nodes = lock::write(&self.nodes);
        if nodes.contains_key(&identity) {
            warn!(target: "runq.core.graph", task = %identity, "task already registered; keeping first registration");
            return false;
        }
        trace!(target: "runq.core.graph", task = %identity, "task registered");
        nodes.insert(identity, Vec::new());
        true
    }

    /// Define the cascade fan-out of `identity`.
    pub fn set_children(
        &self,
        identity: &TaskIdentity,
        children: impl IntoIterator<Item = TaskIdentity>,
    ) -> Result<(), CoreError> {
        let mut nodes = lock::write(&self.nodes);
        let slot = nodes
            .get_mut(identity)
            .ok_or_else(|| CoreError::UnknownTask(identity.to_string()))?;
        *slot = children.into_iter().collect();
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<TaskIdentity> {
        lock::read(&self.nodes)
            .get_key_value(name)
            .map(|(k, _)| k.clone())
    }

    pub fn is_registered(&self, identity: &TaskIdentity) -> bool {
        lock::read(&self.nodes).contains_key(identity)
    }

    /// Direct children, in declaration order.
    pub fn children(&self, identity: &TaskIdentity) -> Vec<TaskIdentity> {
        lock::read(&self.nodes)
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    /// Every slot reachable through children, depth first, without `identity`
    /// itself. Cycles are cut.
    pub fn descendants(&self, identity: &TaskIdentity) -> Vec<TaskIdentity> {
        let nodes = lock::read(&self.nodes);
        let mut seen = HashSet::from([identity.clone()]);
        let mut out = Vec::new();
        let mut stack: Vec<&TaskIdentity> = nodes
            .get(identity)
            .map(|c| c.iter().rev().collect())
            .unwrap_or_default();

        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            out.push(next.clone());
            if let Some(children) = nodes.get(next) {
                stack.extend(children.iter().rev());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        lock::read(&self.nodes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> TaskIdentity {
        TaskIdentity::new(name)
    }

    #[test]
    fn first_registration_stands() {
        let graph = TaskGraph::new();
        assert!(graph.register(id("render")));
        graph.set_children(&id("render"), [id("thumbs")]).unwrap();

        assert!(!graph.register(id("render")));
        assert_eq!(graph.children(&id("render")), vec![id("thumbs")]);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn lookup_by_name() {
        let graph = TaskGraph::new();
        graph.register(id("search"));
        assert_eq!(graph.lookup("search"), Some(id("search")));
        assert!(graph.lookup("missing").is_none());
    }

    #[test]
    fn set_children_requires_registration() {
        let graph = TaskGraph::new();
        let err = graph.set_children(&id("ghost"), [id("a")]).unwrap_err();
        assert!(matches!(err, CoreError::UnknownTask(name) if name == "ghost"));
    }

    #[test]
    fn descendants_walk_the_tree_once() {
        let graph = TaskGraph::new();
        for n in ["root", "a", "b", "a1"] {
            graph.register(id(n));
        }
        graph.set_children(&id("root"), [id("a"), id("b")]).unwrap();
        graph.set_children(&id("a"), [id("a1"), id("root")]).unwrap();
        graph.set_children(&id("b"), [id("a1")]).unwrap();

        assert_eq!(
            graph.descendants(&id("root")),
            vec![id("a"), id("a1"), id("b")]
        );
        assert!(graph.descendants(&id("a1")).is_empty());
    }
}
