//! Ownership tree of the estimation graph.
//!
//! The tree is an arena keyed by [`NodeId`]: each node stores a parent handle
//! and an ordered child list. Parents own children; removing a node removes its
//! whole subtree. The cross links between branches (constraint → state block,
//! feature → landmark) are plain handles kept outside the tree.

use std::collections::HashMap;

use crate::error::{EstimationError, Result};

use super::types::NodeId;

/// Role of a node. Determines which parent/child pairs are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Problem,
    Trajectory,
    Map,
    Hardware,
    Frame,
    Capture,
    Feature,
    Constraint,
    Landmark,
    Sensor,
}

impl NodeKind {
    /// Whether a node of this kind may own a child of kind `child`.
    pub fn accepts(self, child: NodeKind) -> bool {
        matches!(
            (self, child),
            (NodeKind::Problem, NodeKind::Trajectory)
                | (NodeKind::Problem, NodeKind::Map)
                | (NodeKind::Problem, NodeKind::Hardware)
                | (NodeKind::Trajectory, NodeKind::Frame)
                | (NodeKind::Map, NodeKind::Landmark)
                | (NodeKind::Hardware, NodeKind::Sensor)
                | (NodeKind::Frame, NodeKind::Capture)
                | (NodeKind::Capture, NodeKind::Feature)
                | (NodeKind::Feature, NodeKind::Constraint)
        )
    }
}

/// A single tree node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Arena of nodes with parent/child links.
#[derive(Debug, Default)]
pub struct NodeTree {
    nodes: HashMap<NodeId, Node>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parentless node.
    pub fn insert(&mut self, id: NodeId, kind: NodeKind, name: impl Into<String>) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(EstimationError::InvalidTopology(format!(
                "node {} already exists",
                id
            )));
        }
        self.nodes.insert(
            id,
            Node {
                id,
                kind,
                name: name.into(),
                parent: None,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// Ordered children of `id`; empty if the node is unknown.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Link `child` under `parent`.
    ///
    /// Fails with `InvalidTopology` if either node is unknown, the child is
    /// already owned, the kinds do not nest, or the link would close a cycle.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if parent == child {
            return Err(EstimationError::InvalidTopology(format!(
                "node {} cannot own itself",
                parent
            )));
        }
        let parent_kind = self
            .nodes
            .get(&parent)
            .map(|n| n.kind)
            .ok_or_else(|| EstimationError::InvalidTopology(format!("unknown parent {}", parent)))?;
        let child_node = self
            .nodes
            .get(&child)
            .ok_or_else(|| EstimationError::InvalidTopology(format!("unknown child {}", child)))?;
        if let Some(owner) = child_node.parent {
            return Err(EstimationError::InvalidTopology(format!(
                "node {} already owned by {}",
                child, owner
            )));
        }
        if !parent_kind.accepts(child_node.kind) {
            return Err(EstimationError::InvalidTopology(format!(
                "{:?} cannot own {:?}",
                parent_kind, child_node.kind
            )));
        }
        if self.is_ancestor(child, parent) {
            return Err(EstimationError::InvalidTopology(format!(
                "linking {} under {} would create a cycle",
                child, parent
            )));
        }

        if let Some(c) = self.nodes.get_mut(&child) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(child);
        }
        Ok(())
    }

    /// Unlink `child` from its parent without removing it.
    pub fn detach(&mut self, child: NodeId) -> Result<()> {
        let parent = self
            .nodes
            .get(&child)
            .ok_or_else(|| EstimationError::InvalidTopology(format!("unknown node {}", child)))?
            .parent;
        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != child);
            }
            if let Some(c) = self.nodes.get_mut(&child) {
                c.parent = None;
            }
        }
        Ok(())
    }

    /// Remove `child` of `parent` together with its subtree.
    ///
    /// Returns the removed ids, children before parents.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<Vec<NodeId>> {
        if self.parent(child) != Some(parent) {
            return Err(EstimationError::InvalidTopology(format!(
                "{} is not a child of {}",
                child, parent
            )));
        }
        self.remove_subtree(child)
    }

    /// Remove a node (owned or not) together with its subtree.
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        if !self.nodes.contains_key(&id) {
            return Err(EstimationError::InvalidTopology(format!("unknown node {}", id)));
        }
        self.detach(id)?;

        let mut removed = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                self.nodes.remove(&node);
                removed.push(node);
                continue;
            }
            stack.push((node, true));
            for c in self.children(node).iter().rev() {
                stack.push((*c, false));
            }
        }
        Ok(removed)
    }

    /// Whether `ancestor` is `node` or lies on the parent chain of `node`.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(n) = cursor {
            if n == ancestor {
                return true;
            }
            cursor = self.parent(n);
        }
        false
    }

    /// Walk up from `id` to the first ancestor of the given kind.
    pub fn ancestor_of_kind(&self, id: NodeId, kind: NodeKind) -> Option<NodeId> {
        let mut cursor = self.parent(id);
        while let Some(n) = cursor {
            if self.nodes.get(&n).map(|node| node.kind) == Some(kind) {
                return Some(n);
            }
            cursor = self.parent(n);
        }
        None
    }

    /// Verify that every parent/child link is mutual and every kind pairing legal.
    pub fn check_invariants(&self) -> Result<()> {
        for node in self.nodes.values() {
            if let Some(p) = node.parent {
                let parent = self.nodes.get(&p).ok_or_else(|| {
                    EstimationError::InvalidTopology(format!("{} has dangling parent {}", node.id, p))
                })?;
                if parent.children.iter().filter(|c| **c == node.id).count() != 1 {
                    return Err(EstimationError::InvalidTopology(format!(
                        "{} not listed exactly once by parent {}",
                        node.id, p
                    )));
                }
                if !parent.kind.accepts(node.kind) {
                    return Err(EstimationError::InvalidTopology(format!(
                        "{:?} {} owned by {:?} {}",
                        node.kind, node.id, parent.kind, p
                    )));
                }
            }
            for c in &node.children {
                if self.parent(*c) != Some(node.id) {
                    return Err(EstimationError::InvalidTopology(format!(
                        "child {} of {} does not point back",
                        c, node.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (NodeTree, NodeId, NodeId, NodeId) {
        let mut tree = NodeTree::new();
        let frame = NodeId::next();
        let capture = NodeId::next();
        let feature = NodeId::next();
        tree.insert(frame, NodeKind::Frame, "frame").unwrap();
        tree.insert(capture, NodeKind::Capture, "capture").unwrap();
        tree.insert(feature, NodeKind::Feature, "feature").unwrap();
        tree.add_child(frame, capture).unwrap();
        tree.add_child(capture, feature).unwrap();
        (tree, frame, capture, feature)
    }

    #[test]
    fn test_add_child_links_both_ways() {
        let (tree, frame, capture, _) = chain();

        assert_eq!(tree.parent(capture), Some(frame));
        assert_eq!(tree.children(frame), &[capture]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_second_parent_is_rejected() {
        let (mut tree, _, capture, _) = chain();
        let other = NodeId::next();
        tree.insert(other, NodeKind::Frame, "other").unwrap();

        let err = tree.add_child(other, capture).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidTopology(_)));
        assert!(tree.children(other).is_empty());
    }

    #[test]
    fn test_illegal_kind_pairing_is_rejected() {
        let mut tree = NodeTree::new();
        let landmark = NodeId::next();
        let capture = NodeId::next();
        tree.insert(landmark, NodeKind::Landmark, "lmk").unwrap();
        tree.insert(capture, NodeKind::Capture, "cap").unwrap();

        assert!(tree.add_child(landmark, capture).is_err());
    }

    #[test]
    fn test_self_link_is_rejected() {
        let mut tree = NodeTree::new();
        let frame = NodeId::next();
        tree.insert(frame, NodeKind::Frame, "frame").unwrap();

        assert!(tree.add_child(frame, frame).is_err());
    }

    #[test]
    fn test_remove_child_removes_subtree() {
        let (mut tree, frame, capture, feature) = chain();

        let removed = tree.remove_child(frame, capture).unwrap();

        assert_eq!(removed, vec![feature, capture]);
        assert!(!tree.contains(feature));
        assert!(tree.children(frame).is_empty());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_non_child_is_rejected() {
        let (mut tree, frame, _, feature) = chain();

        let err = tree.remove_child(frame, feature).unwrap_err();
        assert!(matches!(err, EstimationError::InvalidTopology(_)));
        assert!(tree.contains(feature));
    }

    #[test]
    fn test_detach_then_reattach() {
        let (mut tree, frame, capture, _) = chain();
        let other = NodeId::next();
        tree.insert(other, NodeKind::Frame, "other").unwrap();

        tree.detach(capture).unwrap();
        tree.add_child(other, capture).unwrap();

        assert!(tree.children(frame).is_empty());
        assert_eq!(tree.parent(capture), Some(other));
        assert_eq!(tree.ancestor_of_kind(capture, NodeKind::Frame), Some(other));
        tree.check_invariants().unwrap();
    }
}
