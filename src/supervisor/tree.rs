//! Unit tree - arena of supervisors keyed by [`UnitId`]
//!
//! Parents own their children's ids; `selected` is a plain id with no
//! ownership. Removing a node tears down its whole subtree and hands the
//! supervisors back so the caller can stop them. Calls already in flight
//! hold their own `Arc<Supervisor>` and finish undisturbed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::manager::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

struct Node {
    supervisor: Arc<Supervisor>,
    parent: Option<UnitId>,
    children: Vec<UnitId>,
    selected: Option<UnitId>,
}

#[derive(Default)]
pub struct UnitTree {
    nodes: RwLock<BTreeMap<UnitId, Node>>,
    next_id: AtomicU64,
}

impl UnitTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn allocate(&self) -> UnitId {
        UnitId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert_root(&self, supervisor: Arc<Supervisor>) -> UnitId {
        let id = self.allocate();
        self.nodes.write().insert(
            id,
            Node {
                supervisor,
                parent: None,
                children: Vec::new(),
                selected: None,
            },
        );
        id
    }

    /// `None` when `parent` is not in the tree
    pub fn insert_child(&self, parent: UnitId, supervisor: Arc<Supervisor>) -> Option<UnitId> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(&parent) {
            return None;
        }
        let id = self.allocate();
        nodes.insert(
            id,
            Node {
                supervisor,
                parent: Some(parent),
                children: Vec::new(),
                selected: None,
            },
        );
        if let Some(p) = nodes.get_mut(&parent) {
            p.children.push(id);
        }
        Some(id)
    }

    pub fn get(&self, id: UnitId) -> Option<Arc<Supervisor>> {
        self.nodes.read().get(&id).map(|n| n.supervisor.clone())
    }

    /// First unit with this name, in insertion order
    pub fn find(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.id_of(name).and_then(|id| self.get(id))
    }

    pub fn id_of(&self, name: &str) -> Option<UnitId> {
        self.nodes
            .read()
            .iter()
            .find(|(_, n)| n.supervisor.name() == name)
            .map(|(id, _)| *id)
    }

    pub fn parent(&self, id: UnitId) -> Option<UnitId> {
        self.nodes.read().get(&id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: UnitId) -> Vec<UnitId> {
        self.nodes
            .read()
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Select one of `parent`'s children; false if it is not a child
    pub fn select(&self, parent: UnitId, child: UnitId) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&parent) {
            Some(p) if p.children.contains(&child) => {
                p.selected = Some(child);
                true
            }
            _ => false,
        }
    }

    pub fn selected(&self, parent: UnitId) -> Option<UnitId> {
        self.nodes.read().get(&parent).and_then(|n| n.selected)
    }

    /// Detach `id` and everything below it
    ///
    /// Returns the removed supervisors, deepest first.
    pub fn remove(&self, id: UnitId) -> Vec<Arc<Supervisor>> {
        let mut nodes = self.nodes.write();
        let Some(parent) = nodes.get(&id).map(|n| n.parent) else {
            return Vec::new();
        };
        if let Some(p) = parent.and_then(|p| nodes.get_mut(&p)) {
            p.children.retain(|c| *c != id);
            if p.selected == Some(id) {
                p.selected = None;
            }
        }

        let mut order = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(node) = nodes.get(&next) {
                pending.extend(node.children.iter().copied());
            }
            order.push(next);
        }

        order
            .into_iter()
            .rev()
            .filter_map(|n| nodes.remove(&n))
            .map(|n| n.supervisor)
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Supervisor>> {
        self.nodes
            .read()
            .values()
            .map(|n| n.supervisor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MessageRegistry;
    use crate::supervisor::{CargoToolchain, HostContext};
    use std::time::Duration;

    async fn supervisor(root: &std::path::Path, name: &str) -> Arc<Supervisor> {
        let ctx = HostContext::new(
            MessageRegistry::new(Duration::from_secs(5)),
            Arc::new(CargoToolchain::new("/unused")),
        );
        Supervisor::start(name, root.join(name), ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_remove_subtree_returns_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let tree = UnitTree::new();
        let root = tree.insert_root(supervisor(dir.path(), "Root").await);
        let a = tree.insert_child(root, supervisor(dir.path(), "A").await).unwrap();
        let b = tree.insert_child(a, supervisor(dir.path(), "B").await).unwrap();
        let c = tree.insert_child(root, supervisor(dir.path(), "C").await).unwrap();
        assert!(tree.select(root, a));

        let removed = tree.remove(a);
        let names: Vec<_> = removed.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["B", "A"]);
        assert_eq!(tree.children(root), vec![c]);
        assert_eq!(tree.selected(root), None);
        assert!(tree.get(b).is_none());
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test]
    async fn test_select_requires_child() {
        let dir = tempfile::tempdir().unwrap();
        let tree = UnitTree::new();
        let root = tree.insert_root(supervisor(dir.path(), "Root").await);
        let other = tree.insert_root(supervisor(dir.path(), "Other").await);
        assert!(!tree.select(root, other));
        assert!(tree.insert_child(UnitId(999), supervisor(dir.path(), "X").await).is_none());
        assert_eq!(tree.find("Other").map(|s| s.name().to_string()), Some("Other".into()));
        assert_eq!(tree.parent(other), None);
    }
}
