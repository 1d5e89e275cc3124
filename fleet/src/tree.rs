//! Bounded fan-out node tree
//!
//! New members join under the first node with a free child slot found by
//! walking from the root towards the lightest subtree. Weights count
//! insertions below a node and only steer placement, so they live as plain
//! integers under the tree's single mutex.

use std::{collections::HashMap, fmt};

use parking_lot::Mutex;
use tracing::debug;

use crate::address::{NodeAddress, NodePath};

/// Default maximum number of direct children per node.
pub const DEFAULT_FAN_OUT: usize = 5;

#[derive(Debug, Clone)]
struct TreeNode {
    address: NodeAddress,
    parent: Option<usize>,
    children: Vec<usize>,
    weight: usize,
}

#[derive(Debug, Default)]
struct TreeInner {
    nodes: Vec<Option<TreeNode>>,
    free: Vec<usize>,
    root: Option<usize>,
    index: HashMap<NodeAddress, usize>,
    last_added: Option<NodePath>,
    last_removed: Option<NodePath>,
}

impl TreeInner {
    fn node(&self, idx: usize) -> &TreeNode {
        self.nodes[idx]
            .as_ref()
            .unwrap_or_else(|| unreachable!("tree slot {} is vacant", idx))
    }

    fn node_mut(&mut self, idx: usize) -> &mut TreeNode {
        self.nodes[idx]
            .as_mut()
            .unwrap_or_else(|| unreachable!("tree slot {} is vacant", idx))
    }

    fn alloc(&mut self, node: TreeNode) -> usize {
        let address = node.address.clone();
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(address, idx);
        idx
    }

    fn path_of(&self, idx: usize) -> NodePath {
        let mut chain = Vec::new();
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            let node = self.node(i);
            chain.push(&node.address);
            cursor = node.parent;
        }
        chain.reverse();
        NodePath::from_addresses(chain)
    }

    fn insert(&mut self, address: NodeAddress, fan_out: usize) -> NodePath {
        let Some(mut cursor) = self.root else {
            let idx = self.alloc(TreeNode {
                address,
                parent: None,
                children: Vec::new(),
                weight: 0,
            });
            self.root = Some(idx);
            return self.path_of(idx);
        };

        loop {
            let node = self.node_mut(cursor);
            node.weight += 1;
            if node.children.len() < fan_out {
                break;
            }
            // min_by_key keeps the first of equal weights, so ties resolve
            // in insertion order.
            let next = self
                .node(cursor)
                .children
                .iter()
                .copied()
                .min_by_key(|&child| self.node(child).weight);
            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }

        let idx = self.alloc(TreeNode {
            address,
            parent: Some(cursor),
            children: Vec::new(),
            weight: 0,
        });
        self.node_mut(cursor).children.push(idx);
        self.path_of(idx)
    }

    /// Pre-order walk; `visit` returns true to stop.
    fn walk<F>(&self, mut visit: F) -> Option<usize>
    where
        F: FnMut(usize, usize) -> bool,
    {
        let mut stack = vec![(self.root?, 0usize)];
        while let Some((idx, height)) = stack.pop() {
            if visit(height, idx) {
                return Some(idx);
            }
            let node = self.node(idx);
            for &child in node.children.iter().rev() {
                stack.push((child, height + 1));
            }
        }
        None
    }
}

/// Thread-safe placement tree of cluster members.
#[derive(Debug)]
pub struct NodeTree {
    inner: Mutex<TreeInner>,
    fan_out: usize,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::with_fan_out(DEFAULT_FAN_OUT)
    }

    /// A fan-out of zero is treated as one.
    pub fn with_fan_out(fan_out: usize) -> Self {
        Self {
            inner: Mutex::new(TreeInner::default()),
            fan_out: fan_out.max(1),
        }
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Place `address` and return its path.
    ///
    /// The first address becomes the root. An address already in the tree
    /// keeps its place and its path is returned unchanged.
    pub fn add(&self, address: NodeAddress) -> NodePath {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.index.get(&address) {
            return inner.path_of(idx);
        }
        let path = inner.insert(address, self.fan_out);
        debug!(path = %path, "Node placed in tree");
        inner.last_added = Some(path.clone());
        path
    }

    /// Detach a leaf.
    ///
    /// Interior nodes are left in place because moving their subtrees would
    /// change the paths other members already hold. Returns whether a node
    /// was removed.
    pub fn remove(&self, address: &NodeAddress) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(address) else {
            return false;
        };
        if !inner.node(idx).children.is_empty() {
            debug!(node = %address, "Refusing to remove interior node");
            return false;
        }

        let path = inner.path_of(idx);
        let parent = inner.node(idx).parent;
        if let Some(parent) = parent {
            inner.node_mut(parent).children.retain(|&c| c != idx);
        }
        let mut cursor = parent;
        while let Some(i) = cursor {
            let node = inner.node_mut(i);
            node.weight = node.weight.saturating_sub(1);
            cursor = node.parent;
        }

        inner.index.remove(address);
        inner.nodes[idx] = None;
        inner.free.push(idx);
        if inner.root == Some(idx) {
            inner.root = None;
        }
        debug!(path = %path, "Node removed from tree");
        inner.last_removed = Some(path);
        true
    }

    pub fn clear(&self) {
        *self.inner.lock() = TreeInner::default();
    }

    pub fn search(&self, address: &NodeAddress) -> Option<NodePath> {
        let inner = self.inner.lock();
        inner.index.get(address).map(|&idx| inner.path_of(idx))
    }

    /// First member named `name` in pre-order.
    pub fn search_with_name(&self, name: &str) -> Option<NodePath> {
        let inner = self.inner.lock();
        inner
            .walk(|_, idx| inner.node(idx).address.name == name)
            .map(|idx| inner.path_of(idx))
    }

    /// First member listening on `endpoint` (`host:port`) in pre-order.
    pub fn search_with_address(&self, endpoint: &str) -> Option<NodePath> {
        let inner = self.inner.lock();
        inner
            .walk(|_, idx| inner.node(idx).address.endpoint() == endpoint)
            .map(|idx| inner.path_of(idx))
    }

    /// Depth-first walk from the root (height 0), calling `predicate` for
    /// every node at or below `start_height` until it returns true.
    ///
    /// The tree stays locked for the walk; `predicate` must not call back
    /// into this tree.
    pub fn floop<F>(&self, start_height: usize, mut predicate: F) -> Option<NodePath>
    where
        F: FnMut(usize, &NodePath) -> bool,
    {
        let inner = self.inner.lock();
        inner
            .walk(|height, idx| height >= start_height && predicate(height, &inner.path_of(idx)))
            .map(|idx| inner.path_of(idx))
    }

    /// Depth-first walk over sibling groups: the root alone at height 0,
    /// then each node's children as one group at their height.
    ///
    /// Returns the first group accepted by `predicate`.
    pub fn floop_group<F>(&self, mut predicate: F) -> Option<Vec<NodePath>>
    where
        F: FnMut(usize, &[NodePath]) -> bool,
    {
        let inner = self.inner.lock();
        let root = inner.root?;
        let root_group = vec![inner.path_of(root)];
        if predicate(0, &root_group) {
            return Some(root_group);
        }
        let mut found = None;
        inner.walk(|height, idx| {
            let node = inner.node(idx);
            if node.children.is_empty() {
                return false;
            }
            let group: Vec<NodePath> = node.children.iter().map(|&c| inner.path_of(c)).collect();
            if predicate(height + 1, &group) {
                found = Some(group);
                true
            } else {
                false
            }
        });
        found
    }

    pub fn root(&self) -> Option<NodePath> {
        let inner = self.inner.lock();
        inner.root.map(|idx| inner.path_of(idx))
    }

    /// Direct children of `address`, in insertion order.
    pub fn children_of(&self, address: &NodeAddress) -> Option<Vec<NodePath>> {
        let inner = self.inner.lock();
        let &idx = inner.index.get(address)?;
        Some(
            inner
                .node(idx)
                .children
                .iter()
                .map(|&c| inner.path_of(c))
                .collect(),
        )
    }

    pub fn weight_of(&self, address: &NodeAddress) -> Option<usize> {
        let inner = self.inner.lock();
        inner.index.get(address).map(|&idx| inner.node(idx).weight)
    }

    pub fn last_added(&self) -> Option<NodePath> {
        self.inner.lock().last_added.clone()
    }

    pub fn last_removed(&self) -> Option<NodePath> {
        self.inner.lock().last_removed.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        writeln!(f, "NodeTree[fan_out={} nodes={}]", self.fan_out, inner.index.len())?;
        let mut result = Ok(());
        inner.walk(|height, idx| {
            let node = inner.node(idx);
            result = writeln!(
                f,
                "{:indent$}{} (weight {})",
                "",
                node.address,
                node.weight,
                indent = (height + 1) * 2
            );
            result.is_err()
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn addr(name: &str) -> NodeAddress {
        NodeAddress::with_name(name, "127.0.0.1", 7000)
    }

    fn path(names: &[&str]) -> String {
        names
            .iter()
            .map(|n| format!("{}@127.0.0.1:7000", n))
            .collect::<Vec<_>>()
            .join("/")
    }

    #[test]
    fn test_first_add_becomes_root() {
        let tree = NodeTree::new();
        assert!(tree.is_empty());
        let root = tree.add(addr("root"));
        assert_eq!(root.as_str(), path(&["root"]));
        assert_eq!(tree.search(&addr("root")), Some(root.clone()));
        assert_eq!(tree.root(), Some(root));
        assert_eq!(root_leader(&tree), None);
    }

    fn root_leader(tree: &NodeTree) -> Option<NodePath> {
        tree.root().and_then(|p| p.leader_path())
    }

    #[test]
    fn test_fan_out_bound_descends_into_lightest_child() {
        let tree = NodeTree::new();
        tree.add(addr("root"));
        for i in 1..=5 {
            let p = tree.add(addr(&format!("child{}", i)));
            assert_eq!(p.as_str(), path(&["root", &format!("child{}", i)]));
        }
        for i in 1..=5 {
            assert_eq!(tree.weight_of(&addr(&format!("child{}", i))), Some(0));
        }
        assert_eq!(tree.children_of(&addr("root")).unwrap().len(), 5);

        let sixth = tree.add(addr("garg6"));
        assert_eq!(sixth.as_str(), path(&["root", "child1", "garg6"]));
        let seventh = tree.add(addr("garg7"));
        assert_eq!(seventh.as_str(), path(&["root", "child2", "garg7"]));

        assert_eq!(tree.children_of(&addr("root")).unwrap().len(), 5);
        assert_eq!(tree.weight_of(&addr("root")), Some(7));
        assert_eq!(tree.weight_of(&addr("child1")), Some(1));

        for i in 0..30 {
            tree.add(addr(&format!("more{}", i)));
        }
        assert_eq!(
            tree.search(&addr("garg7")).unwrap().as_str(),
            path(&["root", "child2", "garg7"])
        );
        assert_eq!(tree.len(), 38);
    }

    #[test]
    fn test_no_node_exceeds_fan_out() {
        let tree = NodeTree::with_fan_out(3);
        for i in 0..200 {
            tree.add(addr(&format!("n{}", i)));
        }
        for i in 0..200 {
            let children = tree.children_of(&addr(&format!("n{}", i))).unwrap();
            assert!(children.len() <= 3);
        }
        // A balanced ternary tree of 200 nodes is at most 6 levels deep.
        let mut deepest = 0;
        tree.floop(0, |height, _| {
            deepest = deepest.max(height);
            false
        });
        assert!(deepest <= 5, "depth {}", deepest);
    }

    #[test]
    fn test_add_existing_address_is_idempotent() {
        let tree = NodeTree::new();
        tree.add(addr("root"));
        let first = tree.add(addr("a"));
        let again = tree.add(addr("a"));
        assert_eq!(first, again);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.weight_of(&addr("root")), Some(1));
    }

    #[test]
    fn test_search_variants() {
        let tree = NodeTree::new();
        tree.add(addr("root"));
        tree.add(NodeAddress::with_name("w1", "10.0.0.2", 7100));
        tree.add(NodeAddress::with_name("w2", "10.0.0.3", 7200));

        assert_eq!(
            tree.search_with_name("w2").unwrap().as_str(),
            "root@127.0.0.1:7000/w2@10.0.0.3:7200"
        );
        assert_eq!(
            tree.search_with_address("10.0.0.2:7100").unwrap().as_str(),
            "root@127.0.0.1:7000/w1@10.0.0.2:7100"
        );
        assert!(tree.search_with_name("nobody").is_none());
        assert!(tree.search_with_address("10.0.0.9:1").is_none());
        assert!(tree.search(&addr("nobody")).is_none());
    }

    #[test]
    fn test_floop_visits_in_preorder_from_start_height() {
        let tree = NodeTree::with_fan_out(2);
        for name in ["r", "a", "b", "c", "d"] {
            tree.add(addr(name));
        }
        // r -> [a -> [c], b -> [d]]
        let mut seen = Vec::new();
        let result = tree.floop(1, |height, p| {
            seen.push((height, p.node_info().unwrap().name));
            false
        });
        assert!(result.is_none());
        assert_eq!(
            seen,
            vec![
                (1, "a".to_string()),
                (2, "c".to_string()),
                (1, "b".to_string()),
                (2, "d".to_string()),
            ]
        );

        // Second node at height 2, the way a referee picks a worker by index.
        let mut index = 0;
        let found = tree.floop(0, |height, _| {
            if height == 2 {
                if index == 1 {
                    return true;
                }
                index += 1;
            }
            false
        });
        assert_eq!(found.unwrap().node_info().unwrap().name, "d");
    }

    #[test]
    fn test_floop_group() {
        let tree = NodeTree::with_fan_out(2);
        for name in ["r", "a", "b", "c", "d"] {
            tree.add(addr(name));
        }
        let mut groups = Vec::new();
        tree.floop_group(|height, group| {
            groups.push((height, group.len()));
            false
        });
        assert_eq!(groups, vec![(0, 1), (1, 2), (2, 1), (2, 1)]);

        let found = tree
            .floop_group(|height, group| height == 1 && group.len() == 2)
            .unwrap();
        assert_eq!(found[1].node_info().unwrap().name, "b");
    }

    #[test]
    fn test_remove_leaf_only() {
        let tree = NodeTree::with_fan_out(1);
        tree.add(addr("r"));
        tree.add(addr("a"));
        tree.add(addr("b"));
        assert_eq!(tree.weight_of(&addr("r")), Some(2));

        assert!(!tree.remove(&addr("a")), "interior node stays");
        assert!(!tree.remove(&addr("ghost")));
        assert!(tree.remove(&addr("b")));
        assert_eq!(tree.last_removed().unwrap().as_str(), path(&["r", "a", "b"]));
        assert_eq!(tree.weight_of(&addr("r")), Some(1));
        assert_eq!(tree.weight_of(&addr("a")), Some(0));
        assert!(tree.search(&addr("b")).is_none());

        // Freed slot is reused and placement resumes normally.
        let p = tree.add(addr("c"));
        assert_eq!(p.as_str(), path(&["r", "a", "c"]));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_remove_root_empties_tree() {
        let tree = NodeTree::new();
        tree.add(addr("r"));
        assert!(tree.remove(&addr("r")));
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
        assert_eq!(tree.add(addr("next")).as_str(), path(&["next"]));
    }

    #[test]
    fn test_concurrent_adds() {
        let tree = Arc::new(NodeTree::new());
        tree.add(addr("root"));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tree = tree.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        tree.add(addr(&format!("t{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tree.len(), 401);
        assert_eq!(tree.weight_of(&addr("root")), Some(400));
    }

    #[test]
    fn test_display_lists_every_node() {
        let tree = NodeTree::new();
        tree.add(addr("root"));
        tree.add(addr("kid"));
        let rendered = tree.to_string();
        assert!(rendered.starts_with("NodeTree[fan_out=5 nodes=2]"));
        assert!(rendered.contains("  root@127.0.0.1:7000 (weight 1)"));
        assert!(rendered.contains("    kid@127.0.0.1:7000 (weight 0)"));
    }
}
