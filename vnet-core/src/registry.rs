use crate::{supervisor::EmulatedNode, FxDashMap, Id};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A node shared between the registry and whoever is operating on it.
pub type SharedNode = Arc<Mutex<Box<dyn EmulatedNode>>>;

/// The nodes living on one compute host, keyed by node id.
///
/// Each node sits behind its own lock so that operations on a node run one at
/// a time while different nodes are operated on concurrently.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: FxDashMap<Id, SharedNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, returning false if its id is already taken.
    pub fn insert(&self, node: Box<dyn EmulatedNode>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.nodes.entry(node.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(node)));
                true
            }
        }
    }

    pub fn get(&self, id: Id) -> Option<SharedNode> {
        self.nodes.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: Id) -> Option<SharedNode> {
        self.nodes.remove(&id).map(|(_, node)| node)
    }

    /// Takes every node out of the registry.
    pub fn drain(&self) -> Vec<SharedNode> {
        let ids: Vec<Id> = self.nodes.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
