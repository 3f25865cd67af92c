//! Density-triggered rebalancing.
//!
//! A segment that crosses the top density either splits in two, when its
//! leaf still has room, or has a whole directory subtree respread over
//! fresh segments. The subtree is chosen by walking up from the leaf until
//! one sits below the density threshold of its level, or the root is hit.

use tracing::debug;

use crate::allocator::BufferId;
use crate::directory::{Directory, SegmentId, Subtree};
use crate::error::{violation, Result};
use crate::segment::{spread_run, Segment};
use crate::Pma;

impl Pma {
    /// Restores density around `segment`, which `key` routes to.
    pub(crate) fn rebalance(&mut self, segment: SegmentId, key: i64) -> Result<()> {
        let route = self
            .directory
            .route(key)
            .ok_or_else(|| violation("rebalance on an empty directory"))?;
        debug_assert_eq!(route.segment, segment);

        let capacity = self.config.capacity();
        let leaf_capacity = self.config.leaf_fanout * capacity;
        let leaf_card = self.cardinality_of(self.directory.leaf_segments(route.leaf));
        if (leaf_card as f64) < self.schedule.at(1) * leaf_capacity as f64 {
            return self.split_segment(segment);
        }

        let top = route.path.len() + 1;
        let mut level = 2;
        let mut level_capacity = leaf_capacity;
        loop {
            level_capacity = level_capacity.saturating_mul(self.config.node_fanout);
            let subtree = Directory::subtree_at(&route, level)
                .ok_or_else(|| violation("rebalance climbed past the root"))?;
            let members = self.directory.segments_under(subtree);
            let card = self.cardinality_of(&members);
            if level == top || (card as f64) < self.schedule.at(level) * level_capacity as f64 {
                return self.redistribute(subtree, members, key, level);
            }
            level += 1;
        }
    }

    fn cardinality_of(&self, ids: &[SegmentId]) -> usize {
        ids.iter()
            .filter_map(|&id| self.segment(id))
            .map(Segment::cardinality)
            .sum()
    }

    /// Moves the upper half of `id` into a new segment.
    fn split_segment(&mut self, id: SegmentId) -> Result<()> {
        let buffer = self.alloc.acquire()?;
        let capacity = self.config.capacity();
        let max_gap = self.config.max_gap;

        let Some(seg) = self.segments.get_mut(id.as_usize()).and_then(Option::as_mut) else {
            self.alloc.release(buffer);
            return Err(violation("split of a dead segment"));
        };
        let (keys, values) = self.alloc.buffers(seg.buffer);
        let slots: Vec<usize> = seg.occupied_slots().collect();
        let half = slots.len() / 2;
        let upper: Vec<(i64, i64)> = slots[half..].iter().map(|&s| (keys[s], values[s])).collect();
        let Some(&(boundary, _)) = upper.first() else {
            self.alloc.release(buffer);
            return Err(violation("split of an empty segment"));
        };
        seg.truncate_from(slots[half]);

        let mut fresh = Segment::new(buffer, capacity);
        let (keys, values) = self.alloc.buffers_mut(buffer);
        fresh.write_spread(keys, values, &upper, max_gap)?;
        let new_id = self.install(fresh);

        let (segments, alloc) = (&self.segments, &self.alloc);
        self.directory
            .insert_entry(new_id, boundary, |s| smallest_key(segments, alloc, s))?;
        self.stats.splits += 1;
        debug!(
            segment = id.as_usize(),
            new_segment = new_id.as_usize(),
            moved = upper.len(),
            boundary,
            "split segment"
        );
        Ok(())
    }

    /// Respreads every element under `subtree` over as many segments as the
    /// fill target needs and hooks them back into the directory.
    ///
    /// Extra buffers are acquired before anything changes, so an allocation
    /// failure leaves the engine as it was.
    fn redistribute(&mut self, subtree: Subtree, members: Vec<SegmentId>, key: i64, level: usize) -> Result<()> {
        let capacity = self.config.capacity();
        let max_gap = self.config.max_gap;
        let limit = ((self.config.fill_target() * capacity as f64) as usize).max(1);

        let mut staged = Vec::with_capacity(self.cardinality_of(&members));
        for &id in &members {
            let seg = self
                .segment(id)
                .ok_or_else(|| violation("directory references a dead segment"))?;
            let (keys, values) = self.alloc.buffers(seg.buffer);
            staged.extend(seg.occupied_slots().map(|s| (keys[s], values[s])));
        }

        let mut runs = Vec::new();
        let mut rest = &staged[..];
        while !rest.is_empty() {
            let take = spread_run(rest, capacity, max_gap, limit).max(1);
            runs.push(take);
            rest = &rest[take..];
        }
        if runs.is_empty() {
            runs.push(0);
        }

        let extra = runs.len().saturating_sub(members.len());
        let mut fresh: Vec<BufferId> = Vec::with_capacity(extra);
        for _ in 0..extra {
            match self.alloc.acquire() {
                Ok(buffer) => fresh.push(buffer),
                Err(err) => {
                    for buffer in fresh {
                        self.alloc.release(buffer);
                    }
                    return Err(err);
                }
            }
        }

        self.directory.remove_subtree(subtree, key)?;

        let mut written = Vec::with_capacity(runs.len());
        let mut offset = 0;
        for (i, &take) in runs.iter().enumerate() {
            let run = &staged[offset..offset + take];
            offset += take;
            let id = match members.get(i) {
                Some(&id) => id,
                None => {
                    let buffer = fresh
                        .pop()
                        .ok_or_else(|| violation("redistribution ran out of buffers"))?;
                    self.install(Segment::new(buffer, capacity))
                }
            };
            let seg = self
                .segments
                .get_mut(id.as_usize())
                .and_then(Option::as_mut)
                .ok_or_else(|| violation("redistribution target is dead"))?;
            let (keys, values) = self.alloc.buffers_mut(seg.buffer);
            seg.write_spread(keys, values, run, max_gap)?;
            written.push((id, run.first().map_or(key, |&(k, _)| k)));
        }

        for &id in members.iter().skip(runs.len()) {
            if let Some(seg) = self.segments[id.as_usize()].take() {
                self.alloc.release(seg.buffer);
                self.free_ids.push(id);
            }
        }

        for &(id, boundary) in &written {
            let (segments, alloc) = (&self.segments, &self.alloc);
            self.directory
                .insert_entry(id, boundary, |s| smallest_key(segments, alloc, s))?;
        }
        // Front entries inherit the detached subtree's bound, which may trail
        // their first key.
        for (&(_, boundary), &take) in written.iter().zip(&runs) {
            if take > 0 {
                self.directory.raise_lower_bound(boundary, boundary);
            }
        }

        self.stats.redistributions += 1;
        debug!(
            level,
            elements = staged.len(),
            before = members.len(),
            after = written.len(),
            "redistributed subtree"
        );
        Ok(())
    }

    /// Stores `segment` under a free id.
    pub(crate) fn install(&mut self, segment: Segment) -> SegmentId {
        match self.free_ids.pop() {
            Some(id) => {
                self.segments[id.as_usize()] = Some(segment);
                id
            }
            None => {
                self.segments.push(Some(segment));
                SegmentId::from_usize(self.segments.len() - 1)
            }
        }
    }
}

/// Smallest key of a live segment, read through the allocator.
pub(crate) fn smallest_key(
    segments: &[Option<Segment>],
    alloc: &crate::allocator::SegmentAllocator,
    id: SegmentId,
) -> Option<i64> {
    let seg = segments.get(id.as_usize())?.as_ref()?;
    seg.smallest_key(alloc.buffers(seg.buffer).0)
}
