use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::tuple::ObjectRef;

/// A named evaluation target: `object#name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct NodeKey {
    pub(crate) object: ObjectRef,
    pub(crate) name: String,
}

impl NodeKey {
    pub(crate) fn new(object: ObjectRef, name: impl Into<String>) -> Self {
        Self {
            object,
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.object, self.name)
    }
}

/// Per-path traversal state. `visited` holds the nodes on the active path.
#[derive(Debug, Clone, Default)]
pub(crate) struct TraversalContext {
    pub(crate) depth: usize,
    pub(crate) visited: Arc<HashSet<NodeKey>>,
}

impl TraversalContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_on_path(&self, key: &NodeKey) -> bool {
        self.visited.contains(key)
    }

    /// Context for evaluating inside `key`; the set is copied, sibling paths
    /// keep their own.
    pub(crate) fn enter(&self, key: &NodeKey) -> Self {
        let mut visited = (*self.visited).clone();
        visited.insert(key.clone());
        Self {
            depth: self.depth + 1,
            visited: Arc::new(visited),
        }
    }
}
