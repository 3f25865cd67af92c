//! # pma-tree
//!
//! An ordered `i64 -> i64` store built from a packed-memory array and a
//! multiway search tree.
//!
//! Keys live sorted in fixed-size segments that keep vacant slots between
//! elements, so most inserts move nothing and the rest shift only up to the
//! nearest gap. A B+tree-like directory maps key ranges to segments, and a
//! density-driven rebalancer splits crowded segments or respreads whole
//! subtrees when a region fills up.
//!
//! ## Example
//!
//! ```rust
//! use pma_tree::Pma;
//!
//! let mut pma = Pma::new().unwrap();
//! assert!(pma.insert(20, 200).unwrap());
//! assert!(pma.insert(10, 100).unwrap());
//! assert!(!pma.insert(10, 999).unwrap());
//!
//! assert_eq!(pma.get(10), Some(100));
//! assert_eq!(pma.range_sum(0, 15).keys, 10);
//! assert!(pma.remove(20));
//! assert_eq!(pma.len(), 1);
//! ```

mod allocator;
mod config;
mod directory;
mod error;
mod rank;
mod rebalance;
mod segment;

use std::fmt;

use tracing::trace;

pub use config::{Backing, DensitySchedule, PmaConfig};
pub use directory::SegmentId;
pub use error::{PmaError, Result};

use allocator::SegmentAllocator;
use directory::{Directory, LeafId};
use error::violation;
use segment::{Placement, Segment};

/// Sums over a key range. Both wrap on overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeSum {
    pub keys: i64,
    pub values: i64,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub len: usize,
    /// Live segments.
    pub segments: usize,
    pub splits: u64,
    pub redistributions: u64,
    /// Chunks obtained from the backing so far.
    pub chunks: usize,
    /// Buffer acquisitions served from the free pool.
    pub recycled_buffers: u64,
    pub reserved_bytes: usize,
    pub directory_height: usize,
    pub directory_nodes: usize,
    pub directory_leaves: usize,
}

/// Event counters kept on the engine.
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    splits: u64,
    redistributions: u64,
}

/// Packed-memory array of `i64` keys and values.
///
/// Mutations take `&mut self`; the engine does no internal locking.
pub struct Pma {
    config: PmaConfig,
    schedule: DensitySchedule,
    alloc: SegmentAllocator,
    /// Indexed by `SegmentId`; `None` marks a free id.
    segments: Vec<Option<Segment>>,
    free_ids: Vec<SegmentId>,
    directory: Directory,
    len: usize,
    stats: Counters,
}

impl Pma {
    pub fn new() -> Result<Self> {
        Self::with_config(PmaConfig::default())
    }

    pub fn with_config(config: PmaConfig) -> Result<Self> {
        config.validate()?;
        let mut alloc = SegmentAllocator::new(&config);
        let buffer = alloc.acquire()?;
        let first = SegmentId::from_usize(0);
        Ok(Self {
            schedule: DensitySchedule::from_config(&config),
            directory: Directory::new(first, config.leaf_fanout, config.node_fanout),
            segments: vec![Some(Segment::new(buffer, config.capacity()))],
            free_ids: Vec::new(),
            alloc,
            config,
            len: 0,
            stats: Counters::default(),
        })
    }

    pub fn config(&self) -> &PmaConfig {
        &self.config
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len() - self.free_ids.len()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            len: self.len,
            segments: self.segment_count(),
            splits: self.stats.splits,
            redistributions: self.stats.redistributions,
            chunks: self.alloc.chunks(),
            recycled_buffers: self.alloc.recycled(),
            reserved_bytes: self.alloc.reserved_bytes(),
            directory_height: self.directory.height(),
            directory_nodes: self.directory.node_count(),
            directory_leaves: self.directory.leaf_count(),
        }
    }

    #[inline]
    pub(crate) fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.as_usize())?.as_ref()
    }

    /// Segment ids in key order.
    pub(crate) fn segment_ids(&self) -> Vec<SegmentId> {
        self.directory
            .leaves()
            .flat_map(|leaf| self.directory.leaf_segments(leaf).iter().copied())
            .collect()
    }

    fn resolve(&self, key: i64) -> Result<SegmentId> {
        self.directory
            .search_segment(key)
            .ok_or_else(|| violation("directory has no segment for key"))
    }

    /// Inserts `key` with `value`.
    ///
    /// Returns `Ok(false)` without touching anything if `key` is already
    /// present. Fails only when the allocator cannot supply memory for a
    /// rebalance, in which case the insert is rolled back.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<bool> {
        let mut id = self.resolve(key)?;
        if self.segment(id).is_some_and(Segment::is_full) {
            self.rebalance(id, key)?;
            id = self.resolve(key)?;
        }

        let max_gap = self.config.max_gap;
        let seg = self
            .segments
            .get_mut(id.as_usize())
            .and_then(Option::as_mut)
            .ok_or_else(|| violation("directory routes to a dead segment"))?;
        let (keys, values) = self.alloc.buffers_mut(seg.buffer);
        let old_smallest = seg.smallest_key(keys);
        match seg.insert(keys, values, key, value, max_gap)? {
            Placement::Duplicate => return Ok(false),
            Placement::Placed { slot } => trace!(key, segment = id.as_usize(), slot, "placed key"),
        }
        self.len += 1;
        if old_smallest.is_none_or(|smallest| key < smallest) {
            self.directory.raise_lower_bound(key, key);
        }

        let threshold = self.schedule.at(0) * seg.capacity() as f64;
        if seg.cardinality() as f64 > threshold {
            if let Err(err) = self.rebalance(id, key) {
                self.undo_insert(id, key, old_smallest);
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Takes back a placement whose follow-up rebalance failed.
    fn undo_insert(&mut self, id: SegmentId, key: i64, old_smallest: Option<i64>) {
        let Some(seg) = self.segments.get_mut(id.as_usize()).and_then(Option::as_mut) else {
            return;
        };
        let (keys, values) = self.alloc.buffers(seg.buffer);
        if seg.remove(keys, values, key).is_some() {
            self.len -= 1;
            if let Some(smallest) = old_smallest.filter(|&smallest| key < smallest) {
                self.directory.raise_lower_bound(key, smallest);
            }
        }
    }

    /// Removes `key`. Returns whether it was present.
    ///
    /// Segments are never merged on underflow; an emptied segment stays in
    /// the directory and is reused by later inserts into its range.
    pub fn remove(&mut self, key: i64) -> bool {
        let Some(id) = self.directory.search_segment(key) else {
            return false;
        };
        let Some(seg) = self.segments.get_mut(id.as_usize()).and_then(Option::as_mut) else {
            return false;
        };
        let (keys, values) = self.alloc.buffers(seg.buffer);
        let old_smallest = seg.smallest_key(keys);
        if seg.remove(keys, values, key).is_none() {
            return false;
        }
        self.len -= 1;
        if old_smallest == Some(key) {
            if let Some(next) = seg.smallest_key(keys) {
                self.directory.raise_lower_bound(key, next);
            }
        }
        true
    }

    pub fn lookup(&self, key: i64) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: i64) -> Option<i64> {
        let seg = self.segment(self.directory.search_segment(key)?)?;
        let (keys, values) = self.alloc.buffers(seg.buffer);
        seg.find(keys, key).map(|slot| values[slot])
    }

    /// Wrapping sums of keys and values over `[start, end]`.
    pub fn range_sum(&self, start: i64, end: i64) -> RangeSum {
        self.range(start, end).fold(RangeSum::default(), |acc, (k, v)| RangeSum {
            keys: acc.keys.wrapping_add(k),
            values: acc.values.wrapping_add(v),
        })
    }

    /// All entries in key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            pma: self,
            leaf: self.directory.leftmost_leaf(),
            index: 0,
            current: None,
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    /// Entries with keys in `[start, end]`, in key order.
    pub fn range(&self, start: i64, end: i64) -> Iter<'_> {
        let mut iter = Iter {
            pma: self,
            leaf: None,
            index: 0,
            current: None,
            start,
            end,
        };
        if start <= end {
            if let Some(route) = self.directory.route(start) {
                iter.leaf = Some(route.leaf);
                iter.index = route.index;
            }
        }
        iter
    }

    /// Full consistency check of segments, directory and counters.
    pub fn check_invariants(&self) -> Result<()> {
        self.directory.check().map_err(PmaError::InvariantViolation)?;

        let order = self.segment_ids();
        if order.len() != self.segment_count() {
            return Err(PmaError::InvariantViolation("live segment missing from the leaf chain"));
        }
        let bounded = self.directory.bounded_segments();
        if !bounded.iter().map(|&(id, _)| id).eq(order.iter().copied()) {
            return Err(PmaError::InvariantViolation("tree order disagrees with the leaf chain"));
        }

        let mut total = 0usize;
        let mut prev: Option<i64> = None;
        let mut seen = vec![false; self.segments.len()];
        for &(id, bound) in &bounded {
            let seg = self
                .segment(id)
                .ok_or(PmaError::InvariantViolation("directory references a dead segment"))?;
            if std::mem::replace(&mut seen[id.as_usize()], true) {
                return Err(PmaError::InvariantViolation("segment referenced twice"));
            }
            let (keys, _) = self.alloc.buffers(seg.buffer);
            seg.check(keys).map_err(PmaError::InvariantViolation)?;
            total += seg.cardinality();

            let (Some(first), Some(last)) = (seg.first_occupied(), seg.last_occupied()) else {
                continue;
            };
            let (smallest, largest) = (keys[first], keys[last]);
            if prev.is_some_and(|p| p >= smallest) {
                return Err(PmaError::InvariantViolation("keys out of order across segments"));
            }
            prev = Some(largest);
            if bound.is_some_and(|b| b != smallest) {
                return Err(PmaError::InvariantViolation("segment lower bound differs from its smallest key"));
            }
            if self.directory.search_segment(smallest) != Some(id)
                || self.directory.search_segment(largest) != Some(id)
            {
                return Err(PmaError::InvariantViolation("directory routes a stored key elsewhere"));
            }
        }
        if total != self.len {
            return Err(PmaError::InvariantViolation("segment cardinalities do not sum to len"));
        }
        Ok(())
    }
}

impl fmt::Debug for Pma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a Pma {
    type Item = (i64, i64);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Walks the leaf chain segment by segment.
pub struct Iter<'a> {
    pma: &'a Pma,
    leaf: Option<LeafId>,
    /// Next entry to open in `leaf`.
    index: usize,
    /// Open segment, its key and value slices and the next slot to read.
    current: Option<(&'a Segment, &'a [i64], &'a [i64], usize)>,
    start: i64,
    end: i64,
}

impl<'a> Iter<'a> {
    fn open_next(&mut self) -> bool {
        let pma: &'a Pma = self.pma;
        let dir = &pma.directory;
        while let Some(leaf) = self.leaf {
            if let Some(&id) = dir.leaf_segments(leaf).get(self.index) {
                self.index += 1;
                if let Some(seg) = pma.segment(id) {
                    let (keys, values) = pma.alloc.buffers(seg.buffer);
                    self.current = Some((seg, keys, values, 0));
                    return true;
                }
            } else {
                self.leaf = dir.next_leaf(leaf);
                self.index = 0;
            }
        }
        false
    }
}

impl Iterator for Iter<'_> {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<(i64, i64)> {
        loop {
            if let Some((seg, keys, values, slot)) = self.current.as_mut() {
                if let Some(at) = seg.occupied_from(*slot) {
                    *slot = at + 1;
                    let key = keys[at];
                    if key > self.end {
                        self.current = None;
                        self.leaf = None;
                        return None;
                    }
                    if key >= self.start {
                        return Some((key, values[at]));
                    }
                    continue;
                }
                self.current = None;
            }
            if !self.open_next() {
                return None;
            }
        }
    }
}


#[cfg(test)]
mod proptests;
