//! Segments and the gapped-insertion engine.
//!
//! A segment is a fixed run of slots in which occupied slots, read left to
//! right, hold strictly increasing keys. Vacant slots are left between keys
//! so most inserts land in a free slot without moving anything; when no free
//! slot sits between the new key's neighbours, the nearest vacancy on either
//! side is found through the rank table and the elements in between are
//! shifted by one.
//!
//! The key and value slots themselves live in allocator buffers. `Segment`
//! only holds the bookkeeping and borrows the slices for each operation.

use tracing::trace;

use crate::allocator::BufferId;
use crate::config::BLOCK_SLOTS;
use crate::error::{violation, Result};
use crate::rank::RankTable;

/// Result of inserting into a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// The key was already present; nothing changed.
    Duplicate,
    /// The key now lives in `slot`.
    Placed { slot: usize },
}

enum Shift {
    Backward { gap: usize, boundary: usize },
    Forward { gap: usize },
}

pub struct Segment {
    pub(crate) buffer: BufferId,
    /// One bit per slot, 16 slots per block.
    occupancy: Box<[u16]>,
    cardinality: usize,
    last: Option<usize>,
    ranks: &'static RankTable,
}

impl Segment {
    pub(crate) fn new(buffer: BufferId, capacity: usize) -> Self {
        debug_assert_eq!(capacity % BLOCK_SLOTS, 0);
        Self {
            buffer,
            occupancy: vec![0u16; capacity / BLOCK_SLOTS].into_boxed_slice(),
            cardinality: 0,
            last: None,
            ranks: RankTable::global(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.occupancy.len() * BLOCK_SLOTS
    }

    #[inline]
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.cardinality == self.capacity()
    }

    /// Highest occupied slot.
    #[inline]
    pub fn last_occupied(&self) -> Option<usize> {
        self.last
    }

    #[inline]
    pub fn is_occupied(&self, slot: usize) -> bool {
        self.occupancy[slot / BLOCK_SLOTS] & (1 << (slot % BLOCK_SLOTS)) != 0
    }

    /// Key at the lowest occupied slot.
    ///
    /// Read from the bitmap every time, so it is never stale after the first
    /// element is removed.
    pub fn smallest_key(&self, keys: &[i64]) -> Option<i64> {
        self.first_occupied().map(|slot| keys[slot])
    }

    pub fn first_occupied(&self) -> Option<usize> {
        self.occupancy
            .iter()
            .enumerate()
            .find_map(|(block, &bits)| self.ranks.first(bits).map(|bit| block * BLOCK_SLOTS + bit))
    }

    /// Occupied slots in ascending order.
    pub fn occupied_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.occupancy.iter().enumerate().flat_map(move |(block, &bits)| {
            self.ranks
                .positions(bits)
                .iter()
                .map(move |&bit| block * BLOCK_SLOTS + bit as usize)
        })
    }

    /// Nearest occupied slot in `[floor, slot)`.
    pub(crate) fn prev_occupied(&self, slot: usize, floor: usize) -> Option<usize> {
        let mut block = slot / BLOCK_SLOTS;
        let mut found = self.ranks.last_below(self.occupancy[block], slot % BLOCK_SLOTS);
        loop {
            if let Some(bit) = found {
                let hit = block * BLOCK_SLOTS + bit;
                return (hit >= floor).then_some(hit);
            }
            if block == 0 || block * BLOCK_SLOTS <= floor {
                return None;
            }
            block -= 1;
            found = self.ranks.last(self.occupancy[block]);
        }
    }

    /// Nearest occupied slot in `(slot, ceil]`.
    pub(crate) fn next_occupied(&self, slot: usize, ceil: usize) -> Option<usize> {
        let mut block = slot / BLOCK_SLOTS;
        let mut found = self.ranks.first_above(self.occupancy[block], slot % BLOCK_SLOTS);
        loop {
            if let Some(bit) = found {
                let hit = block * BLOCK_SLOTS + bit;
                return (hit <= ceil).then_some(hit);
            }
            block += 1;
            if block >= self.occupancy.len() || block * BLOCK_SLOTS > ceil {
                return None;
            }
            found = self.ranks.first(self.occupancy[block]);
        }
    }

    /// First occupied slot at or after `slot`.
    pub(crate) fn occupied_from(&self, slot: usize) -> Option<usize> {
        let capacity = self.capacity();
        if slot >= capacity {
            None
        } else if self.is_occupied(slot) {
            Some(slot)
        } else {
            self.next_occupied(slot, capacity - 1)
        }
    }

    /// Nearest vacant slot below `slot`.
    ///
    /// Full blocks are skipped whole, an empty block yields its top slot, and
    /// a partial block is resolved from its position list.
    pub(crate) fn prev_vacant(&self, slot: usize) -> Option<usize> {
        let mut block = slot / BLOCK_SLOTS;
        let mut found = self
            .ranks
            .last_clear_below(self.occupancy[block], slot % BLOCK_SLOTS);
        loop {
            if let Some(bit) = found {
                return Some(block * BLOCK_SLOTS + bit);
            }
            if block == 0 {
                return None;
            }
            block -= 1;
            found = self.ranks.last_clear(self.occupancy[block]);
        }
    }

    /// Nearest vacant slot above `slot`.
    pub(crate) fn next_vacant(&self, slot: usize) -> Option<usize> {
        let mut block = slot / BLOCK_SLOTS;
        let mut found = self
            .ranks
            .first_clear_above(self.occupancy[block], slot % BLOCK_SLOTS);
        loop {
            if let Some(bit) = found {
                return Some(block * BLOCK_SLOTS + bit);
            }
            block += 1;
            if block >= self.occupancy.len() {
                return None;
            }
            found = self.ranks.first_clear(self.occupancy[block]);
        }
    }

    /// Candidate slot for `key`.
    ///
    /// Binary search over `[0, last]`. A vacant midpoint is replaced by the
    /// nearest occupied slot inside the window, looking backward first; when
    /// the window holds no occupied slot at all, the midpoint itself is where
    /// `key` belongs. The returned slot holds `key` if it is present.
    pub(crate) fn locate(&self, keys: &[i64], key: i64) -> usize {
        let Some(last) = self.last else {
            return 0;
        };
        let (mut lo, mut hi) = (0usize, last);
        let mut mid = 0;
        while lo <= hi {
            mid = lo + (hi - lo) / 2;
            if !self.is_occupied(mid) {
                match self
                    .prev_occupied(mid, lo)
                    .or_else(|| self.next_occupied(mid, hi))
                {
                    Some(probe) => mid = probe,
                    None => return mid,
                }
            }
            let found = keys[mid];
            if found == key {
                return mid;
            } else if found < key {
                lo = mid + 1;
            } else if mid == 0 {
                break;
            } else {
                hi = mid - 1;
            }
        }
        mid
    }

    /// Slot holding `key`.
    pub(crate) fn find(&self, keys: &[i64], key: i64) -> Option<usize> {
        let slot = self.locate(keys, key);
        (self.is_occupied(slot) && keys[slot] == key).then_some(slot)
    }

    fn occupy(&mut self, slot: usize) {
        debug_assert!(!self.is_occupied(slot));
        self.occupancy[slot / BLOCK_SLOTS] |= 1 << (slot % BLOCK_SLOTS);
        self.cardinality += 1;
        if self.last.is_none_or(|last| slot > last) {
            self.last = Some(slot);
        }
    }

    fn vacate(&mut self, slot: usize) {
        debug_assert!(self.is_occupied(slot));
        self.occupancy[slot / BLOCK_SLOTS] &= !(1 << (slot % BLOCK_SLOTS));
        self.cardinality -= 1;
        if self.last == Some(slot) {
            self.last = self.prev_occupied(slot, 0);
        }
    }

    fn place(&mut self, keys: &mut [i64], values: &mut [i64], slot: usize, key: i64, value: i64) {
        keys[slot] = key;
        values[slot] = value;
        self.occupy(slot);
    }

    /// Inserts `key`, shifting neighbours when no vacancy sits between them.
    pub(crate) fn insert(
        &mut self,
        keys: &mut [i64],
        values: &mut [i64],
        key: i64,
        value: i64,
        max_gap: usize,
    ) -> Result<Placement> {
        if self.is_full() {
            return Err(violation("insert into a saturated segment"));
        }

        let slot = self.locate(keys, key);
        if !self.is_occupied(slot) {
            self.place(keys, values, slot, key, value);
            return Ok(Placement::Placed { slot });
        }
        let found = keys[slot];
        if found == key {
            return Ok(Placement::Duplicate);
        }

        let capacity = self.capacity();
        let (pred, succ) = if found < key {
            (Some(slot), self.next_occupied(slot, capacity - 1))
        } else {
            (self.prev_occupied(slot, 0), Some(slot))
        };

        let slot = match (pred, succ) {
            (Some(pred), None) => self.insert_after_last(keys, values, pred, key, value, max_gap)?,
            (pred, Some(succ)) => {
                let free_from = pred.map_or(0, |p| p + 1);
                if free_from < succ {
                    // Vacant run between the neighbours: take its middle.
                    let slot = free_from + (succ - 1 - free_from) / 2;
                    self.place(keys, values, slot, key, value);
                    slot
                } else {
                    self.shift_insert(keys, values, pred, succ, key, value)?
                }
            }
            (None, None) => return Err(violation("occupied candidate slot without neighbours")),
        };
        Ok(Placement::Placed { slot })
    }

    /// Places `key` past the last occupied slot `last`.
    ///
    /// Leaves up to `max_gap` slots behind the previous key, never more than
    /// the key distance, so sequential keys pack tightly and sparse keys keep
    /// room for later inserts. At the end of the segment the nearest vacancy
    /// behind is used instead.
    fn insert_after_last(
        &mut self,
        keys: &mut [i64],
        values: &mut [i64],
        last: usize,
        key: i64,
        value: i64,
        max_gap: usize,
    ) -> Result<usize> {
        let end = self.capacity() - 1;
        if last == end {
            return self.shift_insert(keys, values, Some(last), end + 1, key, value);
        }
        let distance = usize::try_from(key.abs_diff(keys[last])).unwrap_or(usize::MAX);
        let slot = last + max_gap.min(end - last).min(distance);
        self.place(keys, values, slot, key, value);
        Ok(slot)
    }

    /// Inserts between two adjacent occupied slots by opening a vacancy.
    ///
    /// `pred` is the slot of the largest smaller key and `succ` that of the
    /// smallest larger key (`capacity` when there is none). The nearest vacant
    /// slot after `succ` and before `pred` are both considered and the one
    /// needing fewer moves wins; ties go backward. The new element is written
    /// into the vacancy and swapped toward the boundary until it is in order.
    fn shift_insert(
        &mut self,
        keys: &mut [i64],
        values: &mut [i64],
        pred: Option<usize>,
        succ: usize,
        key: i64,
        value: i64,
    ) -> Result<usize> {
        let forward = (succ < self.capacity())
            .then(|| self.next_vacant(succ))
            .flatten();
        // (gap, boundary) pairs; the boundary is the predecessor slot.
        let backward = pred.and_then(|p| self.prev_vacant(p).map(|gap| (gap, p)));

        let shift = match (backward, forward) {
            (Some((gap, boundary)), Some(fwd)) if boundary - gap <= fwd - succ => {
                Shift::Backward { gap, boundary }
            }
            (Some((gap, boundary)), None) => Shift::Backward { gap, boundary },
            (_, Some(gap)) => Shift::Forward { gap },
            (None, None) => return Err(violation("no vacant slot in a non-full segment")),
        };

        let slot = match shift {
            Shift::Backward { gap, boundary } => {
                trace!(gap, moves = boundary - gap, "shifting backward");
                self.place(keys, values, gap, key, value);
                let mut slot = gap;
                while slot < boundary && keys[slot + 1] < key {
                    keys.swap(slot, slot + 1);
                    values.swap(slot, slot + 1);
                    slot += 1;
                }
                slot
            }
            Shift::Forward { gap } => {
                trace!(gap, moves = gap - succ, "shifting forward");
                self.place(keys, values, gap, key, value);
                let mut slot = gap;
                while slot > succ && keys[slot - 1] > key {
                    keys.swap(slot - 1, slot);
                    values.swap(slot - 1, slot);
                    slot -= 1;
                }
                slot
            }
        };
        Ok(slot)
    }

    /// Removes `key`, returning its value.
    pub(crate) fn remove(&mut self, keys: &[i64], values: &[i64], key: i64) -> Option<i64> {
        let slot = self.find(keys, key)?;
        let value = values[slot];
        self.vacate(slot);
        Some(value)
    }

    /// Drops every element at or above `slot` from the bitmap.
    pub(crate) fn truncate_from(&mut self, slot: usize) {
        let removed: Vec<usize> = self.occupied_slots().filter(|&s| s >= slot).collect();
        for s in removed {
            self.vacate(s);
        }
    }

    /// Replaces the contents with `entries`, which must be sorted by key.
    ///
    /// The first key goes to slot 0 and each following key sits
    /// `min(max_gap, key distance)` slots after its predecessor, squeezed
    /// down whenever the remaining entries would otherwise not fit.
    pub(crate) fn write_spread(
        &mut self,
        keys: &mut [i64],
        values: &mut [i64],
        entries: &[(i64, i64)],
        max_gap: usize,
    ) -> Result<()> {
        let capacity = self.capacity();
        if entries.len() > capacity {
            return Err(violation("spread run larger than a segment"));
        }
        self.occupancy.fill(0);
        self.cardinality = 0;
        self.last = None;

        let mut prev: Option<(usize, i64)> = None;
        for (i, &(key, value)) in entries.iter().enumerate() {
            let slot = match prev {
                None => 0,
                Some((pos, prev_key)) => {
                    let remaining = entries.len() - i - 1;
                    let room = capacity - 1 - pos - remaining;
                    let distance = usize::try_from(key.abs_diff(prev_key)).unwrap_or(usize::MAX);
                    pos + max_gap.min(distance).min(room).max(1)
                }
            };
            self.place(keys, values, slot, key, value);
            prev = Some((slot, key));
        }
        Ok(())
    }

    /// Checks the bitmap bookkeeping and key order against the slots.
    pub(crate) fn check(&self, keys: &[i64]) -> std::result::Result<(), &'static str> {
        let popcount: usize = self.occupancy.iter().map(|b| b.count_ones() as usize).sum();
        if popcount != self.cardinality {
            return Err("segment cardinality differs from occupancy popcount");
        }
        if self.occupied_slots().last() != self.last {
            return Err("segment last occupied slot is stale");
        }
        let mut prev: Option<i64> = None;
        for slot in self.occupied_slots() {
            if prev.is_some_and(|p| p >= keys[slot]) {
                return Err("segment keys are not strictly increasing");
            }
            prev = Some(keys[slot]);
        }
        Ok(())
    }
}

/// Number of leading `entries` a fresh segment takes when laid out with the
/// full `max_gap` spacing, stopping at `capacity` slots or `limit` entries.
pub(crate) fn spread_run(entries: &[(i64, i64)], capacity: usize, max_gap: usize, limit: usize) -> usize {
    let mut pos = 0usize;
    let mut taken = 0usize;
    for (i, &(key, _)) in entries.iter().enumerate() {
        if taken == limit {
            break;
        }
        if i > 0 {
            let distance = usize::try_from(key.abs_diff(entries[i - 1].0)).unwrap_or(usize::MAX);
            let next = pos + max_gap.min(distance);
            if next >= capacity {
                break;
            }
            pos = next;
        }
        taken += 1;
    }
    taken
}
