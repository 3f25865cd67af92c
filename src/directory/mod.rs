//! Multiway search tree mapping keys to segments.
//!
//! Internal nodes and leaves live in two arenas and refer to each other by
//! index. Internal nodes hold separators and child ids; leaves hold segment
//! ids and separators and are chained left to right. The root is always an
//! internal node, wrapping a single leaf when the tree is minimal.
//!
//! Routing at every level picks the last entry whose separator is `<=` the
//! key, or the first entry. Leaf and node splits divide at the midpoint and
//! push the middle separator up; a full root grows a new root above it.

mod node;

use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::error::{violation, Result};
pub(crate) use node::{LeafId, NodeId, Subtree};
use node::{Internal, Leaf};
pub use node::SegmentId;

/// Descent from the root to a leaf entry.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    /// Internal nodes from the root down with the child index taken at each.
    pub(crate) path: SmallVec<[(NodeId, usize); 8]>,
    pub(crate) leaf: LeafId,
    pub(crate) index: usize,
    pub(crate) segment: SegmentId,
}

pub struct Directory {
    nodes: Vec<Internal>,
    leaves: Vec<Leaf>,
    free_nodes: Vec<NodeId>,
    free_leaves: Vec<LeafId>,
    root: NodeId,
    leaf_fanout: usize,
    node_fanout: usize,
}

impl Directory {
    /// A root wrapping one leaf that holds `first`.
    pub fn new(first: SegmentId, leaf_fanout: usize, node_fanout: usize) -> Self {
        let mut dir = Self::empty(leaf_fanout, node_fanout);
        dir.leaves.push(Leaf::single(first));
        dir.nodes[0] = Internal::with_children(smallvec![], &[Subtree::Leaf(LeafId(0))], true);
        dir
    }

    fn empty(leaf_fanout: usize, node_fanout: usize) -> Self {
        Self {
            nodes: vec![Internal::with_children(smallvec![], &[], true)],
            leaves: Vec::new(),
            free_nodes: Vec::new(),
            free_leaves: Vec::new(),
            root: NodeId(0),
            leaf_fanout,
            node_fanout,
        }
    }

    fn reset(&mut self) {
        *self = Self::empty(self.leaf_fanout, self.node_fanout);
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.nodes[self.root.idx()].is_empty()
    }

    /// Internal levels between the root and the leaves, root included.
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = self.root;
        while let Some(Subtree::Node(child)) = self.nodes[node.idx()].child(0) {
            node = child;
            height += 1;
        }
        height
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free_nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len() - self.free_leaves.len()
    }

    fn alloc_node(&mut self, node: Internal) -> NodeId {
        if let Some(id) = self.free_nodes.pop() {
            self.nodes[id.idx()] = node;
            id
        } else {
            self.nodes.push(node);
            NodeId((self.nodes.len() - 1) as u32)
        }
    }

    fn alloc_leaf(&mut self, leaf: Leaf) -> LeafId {
        if let Some(id) = self.free_leaves.pop() {
            self.leaves[id.idx()] = leaf;
            id
        } else {
            self.leaves.push(leaf);
            LeafId((self.leaves.len() - 1) as u32)
        }
    }

    /// Descends to the leaf entry responsible for `key`. `None` only while
    /// the tree is empty.
    pub(crate) fn route(&self, key: i64) -> Option<Route> {
        let mut path = SmallVec::new();
        let mut node = self.root;
        loop {
            let internal = &self.nodes[node.idx()];
            let index = internal.route(key);
            path.push((node, index));
            match internal.child(index)? {
                Subtree::Node(child) => node = child,
                Subtree::Leaf(leaf) => {
                    let entries = &self.leaves[leaf.idx()];
                    let index = entries.route(key);
                    let segment = *entries.segments.get(index)?;
                    return Some(Route {
                        path,
                        leaf,
                        index,
                        segment,
                    });
                }
            }
        }
    }

    /// The segment that should contain `key`.
    pub fn search_segment(&self, key: i64) -> Option<SegmentId> {
        self.route(key).map(|route| route.segment)
    }

    /// Direct parent of `child` and the child's index in it, found by
    /// descending along `key`'s route.
    pub(crate) fn find_parent(&self, child: Subtree, key: i64) -> Option<(NodeId, usize)> {
        let mut node = self.root;
        loop {
            let internal = &self.nodes[node.idx()];
            let index = internal.route(key);
            match internal.child(index)? {
                found if found == child => return Some((node, index)),
                Subtree::Node(next) => node = next,
                Subtree::Leaf(_) => return None,
            }
        }
    }

    /// Adds `segment`, whose smallest key is `boundary`, next to the entry
    /// `boundary` routes to.
    ///
    /// The new entry goes after the routed one. The exception is a routed
    /// entry at the front of its leaf whose smallest key is still above
    /// `boundary`: the new entry goes in front, and that smallest key becomes
    /// the separator between the two.
    pub fn insert_entry<F>(&mut self, segment: SegmentId, boundary: i64, smallest_of: F) -> Result<()>
    where
        F: Fn(SegmentId) -> Option<i64>,
    {
        let Some(route) = self.route(boundary) else {
            let leaf = self.alloc_leaf(Leaf::single(segment));
            self.nodes[self.root.idx()] =
                Internal::with_children(smallvec![], &[Subtree::Leaf(leaf)], true);
            return Ok(());
        };

        let leaf = &mut self.leaves[route.leaf.idx()];
        let front = if route.index == 0 {
            smallest_of(route.segment).filter(|&smallest| smallest > boundary)
        } else {
            None
        };
        match front {
            Some(smallest) => {
                leaf.segments.insert(0, segment);
                leaf.seps.insert(0, smallest);
            }
            None => {
                leaf.segments.insert(route.index + 1, segment);
                leaf.seps.insert(route.index, boundary);
            }
        }

        if leaf.segments.len() > self.leaf_fanout {
            self.split_leaf(route.leaf, boundary)?;
        }
        Ok(())
    }

    fn split_leaf(&mut self, id: LeafId, key: i64) -> Result<()> {
        let leaf = &mut self.leaves[id.idx()];
        let (seps, segments, promoted) = node::split_entries(&mut leaf.seps, &mut leaf.segments)?;
        let next = leaf.next;
        let right = self.alloc_leaf(Leaf {
            seps,
            segments,
            next,
        });
        self.leaves[id.idx()].next = Some(right);
        debug!(left = id.0, right = right.0, separator = promoted, "split directory leaf");
        self.insert_in_parent(Subtree::Leaf(id), promoted, Subtree::Leaf(right), key)
    }

    /// Hooks `right` in after `left`, splitting the parent when it overflows.
    ///
    /// `key` must still route to `left`; the parent is found by descending
    /// along it.
    fn insert_in_parent(&mut self, left: Subtree, sep: i64, right: Subtree, key: i64) -> Result<()> {
        let (parent, index) = self
            .find_parent(left, key)
            .ok_or_else(|| violation("split node is not reachable from the root"))?;

        let node = &mut self.nodes[parent.idx()];
        node.insert_after(index, sep, right);
        if node.len() <= self.node_fanout {
            return Ok(());
        }

        let (upper, promoted) = node.split()?;
        let upper = self.alloc_node(upper);
        debug!(left = parent.0, right = upper.0, separator = promoted, "split directory node");

        if parent == self.root {
            self.root = self.alloc_node(Internal::with_children(
                smallvec![promoted],
                &[Subtree::Node(parent), Subtree::Node(upper)],
                false,
            ));
            debug!(height = self.height(), "grew directory root");
            Ok(())
        } else {
            self.insert_in_parent(Subtree::Node(parent), promoted, Subtree::Node(upper), key)
        }
    }

    /// Sets the lower bound of the segment `key` routes to.
    ///
    /// The bound lives in the deepest separator on the route that sits left
    /// of the taken entry. The leftmost segment has no bound.
    pub fn raise_lower_bound(&mut self, key: i64, bound: i64) {
        let Some(route) = self.route(key) else {
            return;
        };
        if route.index > 0 {
            self.leaves[route.leaf.idx()].seps[route.index - 1] = bound;
            return;
        }
        if let Some(&(node, index)) = route.path.iter().rev().find(|(_, index)| *index > 0) {
            self.nodes[node.idx()].seps[index - 1] = bound;
        }
    }

    pub(crate) fn leftmost_leaf_of(&self, subtree: Subtree) -> Option<LeafId> {
        let mut at = subtree;
        loop {
            match at {
                Subtree::Leaf(leaf) => return Some(leaf),
                Subtree::Node(node) => at = self.nodes[node.idx()].child(0)?,
            }
        }
    }

    pub(crate) fn rightmost_leaf_of(&self, subtree: Subtree) -> Option<LeafId> {
        let mut at = subtree;
        loop {
            match at {
                Subtree::Leaf(leaf) => return Some(leaf),
                Subtree::Node(node) => {
                    let internal = &self.nodes[node.idx()];
                    at = internal.child(internal.len().checked_sub(1)?)?;
                }
            }
        }
    }

    /// Head of the leaf chain.
    pub(crate) fn leftmost_leaf(&self) -> Option<LeafId> {
        self.leftmost_leaf_of(Subtree::Node(self.root))
    }

    /// Leaves in key order, following the chain.
    pub(crate) fn leaves(&self) -> Leaves<'_> {
        Leaves {
            dir: self,
            next: self.leftmost_leaf(),
        }
    }

    #[inline]
    pub(crate) fn leaf_segments(&self, leaf: LeafId) -> &[SegmentId] {
        &self.leaves[leaf.idx()].segments
    }

    #[inline]
    pub(crate) fn next_leaf(&self, leaf: LeafId) -> Option<LeafId> {
        self.leaves[leaf.idx()].next
    }

    /// Segments under `subtree` in key order.
    pub(crate) fn segments_under(&self, subtree: Subtree) -> Vec<SegmentId> {
        let (Some(first), Some(last)) = (self.leftmost_leaf_of(subtree), self.rightmost_leaf_of(subtree)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut leaf = Some(first);
        while let Some(id) = leaf {
            out.extend_from_slice(self.leaf_segments(id));
            if id == last {
                break;
            }
            leaf = self.next_leaf(id);
        }
        out
    }

    /// Subtree rooted `level` levels above the segments on `route`: level 1
    /// is the leaf, level 2 its parent, and so on up to the root.
    pub(crate) fn subtree_at(route: &Route, level: usize) -> Option<Subtree> {
        match level {
            0 => None,
            1 => Some(Subtree::Leaf(route.leaf)),
            _ => {
                let depth = route.path.len().checked_sub(level - 1)?;
                Some(Subtree::Node(route.path[depth].0))
            }
        }
    }

    /// Detaches `subtree`, which `key` routes into, and frees its nodes.
    ///
    /// The subtree's leaves are unlinked from the chain and its entry is
    /// dropped from the parent; ancestors left without children are dropped
    /// in turn. Removing the root leaves an empty tree that the next
    /// `insert_entry` repopulates.
    pub(crate) fn remove_subtree(&mut self, subtree: Subtree, key: i64) -> Result<()> {
        if subtree == Subtree::Node(self.root) {
            self.reset();
            return Ok(());
        }
        let route = self
            .route(key)
            .ok_or_else(|| violation("subtree removal from an empty directory"))?;
        let depth = route
            .path
            .iter()
            .position(|&(node, index)| self.nodes[node.idx()].child(index) == Some(subtree))
            .ok_or_else(|| violation("removed subtree is not on the key's route"))?;

        // Unlink the run of leaves from the chain.
        let last = self
            .rightmost_leaf_of(subtree)
            .ok_or_else(|| violation("removed subtree has no leaves"))?;
        let after = self.next_leaf(last);
        let before = route.path[..=depth]
            .iter()
            .rev()
            .find(|(_, index)| *index > 0)
            .and_then(|&(node, index)| self.nodes[node.idx()].child(index - 1))
            .and_then(|sibling| self.rightmost_leaf_of(sibling));
        if let Some(before) = before {
            self.leaves[before.idx()].next = after;
        }

        self.free_subtree(subtree);

        let mut level = depth;
        loop {
            let (parent, index) = route.path[level];
            let node = &mut self.nodes[parent.idx()];
            node.remove_child(index);
            if !node.is_empty() {
                break;
            }
            if level == 0 {
                self.reset();
                break;
            }
            self.nodes[parent.idx()] = Internal::default();
            self.free_nodes.push(parent);
            level -= 1;
        }
        Ok(())
    }

    fn free_subtree(&mut self, subtree: Subtree) {
        let mut stack = vec![subtree];
        while let Some(at) = stack.pop() {
            match at {
                Subtree::Leaf(leaf) => {
                    self.leaves[leaf.idx()] = Leaf::default();
                    self.free_leaves.push(leaf);
                }
                Subtree::Node(node) => {
                    let internal = std::mem::take(&mut self.nodes[node.idx()]);
                    stack.extend(internal.children());
                    self.free_nodes.push(node);
                }
            }
        }
    }

    /// Every segment in key order with the lower bound routing gives it.
    /// The leftmost segment has none.
    pub(crate) fn bounded_segments(&self) -> Vec<(SegmentId, Option<i64>)> {
        let mut out = Vec::new();
        let mut stack = vec![(Subtree::Node(self.root), None::<i64>)];
        while let Some((at, bound)) = stack.pop() {
            match at {
                Subtree::Leaf(leaf) => {
                    let leaf = &self.leaves[leaf.idx()];
                    for (i, &segment) in leaf.segments.iter().enumerate() {
                        let own = if i == 0 { bound } else { Some(leaf.seps[i - 1]) };
                        out.push((segment, own));
                    }
                }
                Subtree::Node(node) => {
                    let internal = &self.nodes[node.idx()];
                    for i in (0..internal.len()).rev() {
                        let Some(child) = internal.child(i) else { continue };
                        let own = if i == 0 { bound } else { Some(internal.seps[i - 1]) };
                        stack.push((child, own));
                    }
                }
            }
        }
        out
    }

    /// Structural consistency: entry and separator counts, fanout limits,
    /// sorted separators, uniform depth and a chain matching tree order.
    pub(crate) fn check(&self) -> std::result::Result<(), &'static str> {
        let mut tree_leaves = Vec::new();
        let mut leaf_depth = None;
        let mut stack = vec![(Subtree::Node(self.root), 0usize)];
        while let Some((at, depth)) = stack.pop() {
            match at {
                Subtree::Leaf(id) => {
                    let leaf = &self.leaves[id.idx()];
                    if leaf.segments.is_empty() || leaf.segments.len() > self.leaf_fanout {
                        return Err("leaf entry count out of range");
                    }
                    if leaf.seps.len() + 1 != leaf.segments.len() {
                        return Err("leaf separator count mismatch");
                    }
                    if leaf.seps.windows(2).any(|w| w[0] > w[1]) {
                        return Err("leaf separators out of order");
                    }
                    if *leaf_depth.get_or_insert(depth) != depth {
                        return Err("leaves at different depths");
                    }
                    tree_leaves.push(id);
                }
                Subtree::Node(id) => {
                    let node = &self.nodes[id.idx()];
                    if node.is_empty() {
                        if id == self.root {
                            continue;
                        }
                        return Err("empty internal node");
                    }
                    if node.len() > self.node_fanout {
                        return Err("internal node over fanout");
                    }
                    if node.seps.len() + 1 != node.len() {
                        return Err("internal separator count mismatch");
                    }
                    if node.seps.windows(2).any(|w| w[0] > w[1]) {
                        return Err("internal separators out of order");
                    }
                    for child in node.children().rev() {
                        if matches!(child, Subtree::Leaf(_)) != node.leaf_children {
                            return Err("internal node mixes leaf and node children");
                        }
                        stack.push((child, depth + 1));
                    }
                }
            }
        }
        if !self.leaves().eq(tree_leaves.iter().copied()) {
            return Err("leaf chain disagrees with tree order");
        }
        Ok(())
    }
}

pub(crate) struct Leaves<'a> {
    dir: &'a Directory,
    next: Option<LeafId>,
}

impl Iterator for Leaves<'_> {
    type Item = LeafId;

    fn next(&mut self) -> Option<LeafId> {
        let leaf = self.next?;
        self.next = self.dir.next_leaf(leaf);
        Some(leaf)
    }
}
