use smallvec::SmallVec;

use crate::error::{violation, Result};

/// Entries held inline before a node spills to the heap. Covers the default
/// fanouts plus the transient overflow entry before a split.
pub(crate) const INLINE: usize = 8;

pub(crate) type Separators = SmallVec<[i64; INLINE]>;

/// Dense handle to a live segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SegmentId(u32);

impl SegmentId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_usize(index: usize) -> Self {
        debug_assert!(index <= u32::MAX as usize);
        SegmentId(index as u32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub(crate) struct NodeId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub(crate) struct LeafId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

impl LeafId {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A child reference resolved through its parent's `leaf_children` flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Subtree {
    Leaf(LeafId),
    Node(NodeId),
}

impl Subtree {
    #[inline]
    fn raw(self) -> u32 {
        match self {
            Subtree::Leaf(id) => id.0,
            Subtree::Node(id) => id.0,
        }
    }
}

/// Leaf: segment ids in key order, `segments.len() - 1` separators.
///
/// `seps[i]` is the lower bound of `segments[i + 1]`; the first segment
/// inherits the bound the parent routes by.
#[derive(Debug, Clone, Default)]
pub(crate) struct Leaf {
    pub(crate) seps: Separators,
    pub(crate) segments: SmallVec<[SegmentId; INLINE]>,
    pub(crate) next: Option<LeafId>,
}

impl Leaf {
    pub(crate) fn single(segment: SegmentId) -> Self {
        let mut segments = SmallVec::new();
        segments.push(segment);
        Self {
            seps: SmallVec::new(),
            segments,
            next: None,
        }
    }

    /// Index of the last entry whose separator is `<= key`, else 0.
    #[inline]
    pub(crate) fn route(&self, key: i64) -> usize {
        self.seps.partition_point(|&sep| sep <= key)
    }
}

/// Internal node. Children are all leaves or all internal nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Internal {
    pub(crate) seps: Separators,
    children: SmallVec<[u32; INLINE]>,
    pub(crate) leaf_children: bool,
}

impl Internal {
    pub(crate) fn with_children(seps: Separators, children: &[Subtree], leaf_children: bool) -> Self {
        debug_assert!(children
            .iter()
            .all(|c| matches!(c, Subtree::Leaf(_)) == leaf_children));
        Self {
            seps,
            children: children.iter().map(|c| c.raw()).collect(),
            leaf_children,
        }
    }

    #[inline]
    pub(crate) fn route(&self, key: i64) -> usize {
        self.seps.partition_point(|&sep| sep <= key)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.children.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    #[inline]
    pub(crate) fn child(&self, index: usize) -> Option<Subtree> {
        let raw = *self.children.get(index)?;
        Some(if self.leaf_children {
            Subtree::Leaf(LeafId(raw))
        } else {
            Subtree::Node(NodeId(raw))
        })
    }

    pub(crate) fn children(&self) -> impl DoubleEndedIterator<Item = Subtree> + '_ {
        (0..self.children.len()).filter_map(move |i| self.child(i))
    }

    /// Inserts `child` at `index` with `sep` as its lower bound.
    pub(crate) fn insert_after(&mut self, index: usize, sep: i64, child: Subtree) {
        debug_assert_eq!(matches!(child, Subtree::Leaf(_)), self.leaf_children);
        self.seps.insert(index, sep);
        self.children.insert(index + 1, child.raw());
    }

    /// Drops the child at `index` together with one adjacent separator: its
    /// own lower bound, or for the first child the bound of its successor.
    pub(crate) fn remove_child(&mut self, index: usize) {
        self.children.remove(index);
        if !self.seps.is_empty() {
            self.seps.remove(index.saturating_sub(1));
        }
    }

    /// Splits off the upper half, returning it with the promoted separator.
    pub(crate) fn split(&mut self) -> Result<(Internal, i64)> {
        let (seps, children, promoted) = split_entries(&mut self.seps, &mut self.children)?;
        Ok((
            Internal {
                seps,
                children,
                leaf_children: self.leaf_children,
            },
            promoted,
        ))
    }
}

/// Divides an overfull entry list at its midpoint.
///
/// The left half keeps `(n + 1) / 2` entries. Returns the right half's
/// separators and entries plus the separator between the halves, which
/// leaves both lists and moves up to the parent.
pub(crate) fn split_entries<T: Copy>(
    seps: &mut Separators,
    entries: &mut SmallVec<[T; INLINE]>,
) -> Result<(Separators, SmallVec<[T; INLINE]>, i64)> {
    let n = entries.len();
    if n < 3 || seps.len() + 1 != n {
        return Err(violation("split of a node without overflow"));
    }
    let m = n.div_ceil(2);
    let right_entries: SmallVec<[T; INLINE]> = entries.drain(m..).collect();
    let right_seps: Separators = seps.drain(m..).collect();
    let promoted = seps
        .pop()
        .ok_or_else(|| violation("split lost its middle separator"))?;
    Ok((right_seps, right_entries, promoted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_route_picks_last_separator_at_or_below() {
        let leaf = Leaf {
            seps: smallvec![10, 20, 30],
            segments: (0..4).map(SegmentId::from_usize).collect(),
            next: None,
        };
        assert_eq!(leaf.route(i64::MIN), 0);
        assert_eq!(leaf.route(9), 0);
        assert_eq!(leaf.route(10), 1);
        assert_eq!(leaf.route(25), 2);
        assert_eq!(leaf.route(30), 3);
        assert_eq!(leaf.route(i64::MAX), 3);
    }

    #[test]
    fn test_split_entries_midpoint() {
        let mut seps: Separators = smallvec![10, 20, 30, 40, 50];
        let mut entries: SmallVec<[u32; INLINE]> = smallvec![0, 1, 2, 3, 4, 5];
        let (right_seps, right, promoted) = split_entries(&mut seps, &mut entries).unwrap();
        assert_eq!(&entries[..], &[0, 1, 2]);
        assert_eq!(&seps[..], &[10, 20]);
        assert_eq!(promoted, 30);
        assert_eq!(&right[..], &[3, 4, 5]);
        assert_eq!(&right_seps[..], &[40, 50]);

        // Odd counts keep the extra entry on the left.
        let mut seps: Separators = smallvec![10, 20, 30, 40];
        let mut entries: SmallVec<[u32; INLINE]> = smallvec![0, 1, 2, 3, 4];
        let (right_seps, right, promoted) = split_entries(&mut seps, &mut entries).unwrap();
        assert_eq!(&entries[..], &[0, 1, 2]);
        assert_eq!(promoted, 30);
        assert_eq!(&right[..], &[3, 4]);
        assert_eq!(&right_seps[..], &[40]);
    }

    #[test]
    fn test_internal_children_follow_flag() {
        let mut node = Internal::with_children(
            smallvec![5],
            &[Subtree::Leaf(LeafId(3)), Subtree::Leaf(LeafId(7))],
            true,
        );
        assert_eq!(node.child(1), Some(Subtree::Leaf(LeafId(7))));
        node.insert_after(1, 9, Subtree::Leaf(LeafId(8)));
        assert_eq!(&node.seps[..], &[5, 9]);
        assert_eq!(node.child(2), Some(Subtree::Leaf(LeafId(8))));
        node.remove_child(0);
        assert_eq!(&node.seps[..], &[9]);
        assert_eq!(node.child(0), Some(Subtree::Leaf(LeafId(7))));
        node.remove_child(1);
        assert!(node.seps.is_empty());
        assert_eq!(node.len(), 1);
        assert_eq!(node.child(5), None);
    }
}
