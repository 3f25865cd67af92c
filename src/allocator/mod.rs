//! Segment allocator.
//!
//! Memory is obtained in large chunks and handed out as fixed-size segment
//! buffers. A buffer is a pair of equally sized `i64` regions, one for keys
//! and one for values, living in the key chunk and the value chunk at the
//! same offset. Buffers released by the engine go to a pool and are handed
//! out again before any new chunk is requested.
//!
//! Buffers are addressed by [`BufferId`] handles rather than pointers, so a
//! released buffer can never be reached through a stale reference.

mod chunk;

use tracing::debug;

use crate::config::{Backing, PmaConfig};
use crate::error::Result;
use chunk::ChunkMemory;

/// Handle to one segment buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BufferId(u32);

impl BufferId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

struct Chunk {
    keys: ChunkMemory,
    values: ChunkMemory,
}

/// Hands out and recycles segment buffers.
pub struct SegmentAllocator {
    /// Slots per buffer.
    capacity: usize,
    buffers_per_chunk: usize,
    backing: Backing,
    chunks: Vec<Chunk>,
    /// Released or never-used buffers, reused last-in first-out.
    free: Vec<BufferId>,
    recycled: u64,
    /// Chunks past this count fail as if the host refused them.
    #[cfg(test)]
    chunk_limit: Option<usize>,
}

impl SegmentAllocator {
    pub fn new(config: &PmaConfig) -> Self {
        Self {
            capacity: config.capacity(),
            buffers_per_chunk: config.segments_per_chunk(),
            backing: config.backing,
            chunks: Vec::new(),
            free: Vec::new(),
            recycled: 0,
            #[cfg(test)]
            chunk_limit: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_chunk_limit(&mut self, limit: usize) {
        self.chunk_limit = Some(limit);
    }

    /// Returns a zeroed buffer, preferring the free pool.
    pub fn acquire(&mut self) -> Result<BufferId> {
        if let Some(id) = self.free.pop() {
            let (keys, values) = self.buffers_mut(id);
            keys.fill(0);
            values.fill(0);
            self.recycled += 1;
            return Ok(id);
        }

        let slots = self.capacity * self.buffers_per_chunk;
        #[cfg(test)]
        if self.chunk_limit.is_some_and(|limit| self.chunks.len() >= limit) {
            return Err(crate::error::PmaError::AllocationFailure {
                bytes: 2 * slots * crate::config::SLOT_BYTES,
            });
        }
        let keys = ChunkMemory::obtain(self.backing, slots)?;
        let values = ChunkMemory::obtain(self.backing, slots)?;
        let chunk_index = self.chunks.len();
        self.chunks.push(Chunk { keys, values });
        debug!(
            chunk = chunk_index,
            buffers = self.buffers_per_chunk,
            backing = ?self.backing,
            "obtained segment chunk"
        );

        let first = (chunk_index * self.buffers_per_chunk) as u32;
        // Pushed in reverse so the pool hands the chunk out front to back.
        for offset in (1..self.buffers_per_chunk as u32).rev() {
            self.free.push(BufferId(first + offset));
        }
        Ok(BufferId(first))
    }

    /// Returns a buffer to the pool.
    pub fn release(&mut self, id: BufferId) {
        debug_assert!(id.as_usize() < self.chunks.len() * self.buffers_per_chunk);
        self.free.push(id);
    }

    #[inline]
    fn locate(&self, id: BufferId) -> (usize, std::ops::Range<usize>) {
        let chunk = id.as_usize() / self.buffers_per_chunk;
        let start = (id.as_usize() % self.buffers_per_chunk) * self.capacity;
        (chunk, start..start + self.capacity)
    }

    /// Key and value slices of a buffer.
    #[inline]
    pub fn buffers(&self, id: BufferId) -> (&[i64], &[i64]) {
        let (chunk, range) = self.locate(id);
        let chunk = &self.chunks[chunk];
        (&chunk.keys.slots()[range.clone()], &chunk.values.slots()[range])
    }

    /// Mutable key and value slices of a buffer.
    #[inline]
    pub fn buffers_mut(&mut self, id: BufferId) -> (&mut [i64], &mut [i64]) {
        let (chunk, range) = self.locate(id);
        let chunk = &mut self.chunks[chunk];
        (
            &mut chunk.keys.slots_mut()[range.clone()],
            &mut chunk.values.slots_mut()[range],
        )
    }

    /// Number of chunks obtained from the host so far.
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Buffers currently waiting in the pool.
    #[cfg(test)]
    pub fn free_buffers(&self) -> usize {
        self.free.len()
    }

    /// Acquisitions served from the pool.
    pub fn recycled(&self) -> u64 {
        self.recycled
    }

    /// Bytes obtained from the host, keys and values together.
    pub fn reserved_bytes(&self) -> usize {
        self.chunks.len() * self.buffers_per_chunk * self.capacity * 2 * crate::config::SLOT_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PmaConfig {
        PmaConfig::new().segment_bytes(256).chunk_bytes(1024)
    }

    #[test]
    fn test_chunk_is_sliced() {
        let mut alloc = SegmentAllocator::new(&small_config());
        let first = alloc.acquire().unwrap();
        assert_eq!(alloc.chunks(), 1);
        assert_eq!(alloc.free_buffers(), 3);

        let others: Vec<_> = (0..3).map(|_| alloc.acquire().unwrap()).collect();
        assert_eq!(alloc.chunks(), 1);
        assert_eq!(alloc.free_buffers(), 0);
        assert_eq!(first.as_usize(), 0);
        assert_eq!(
            others.iter().map(|b| b.as_usize()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        alloc.acquire().unwrap();
        assert_eq!(alloc.chunks(), 2);
    }

    #[test]
    fn test_buffers_are_disjoint() {
        let mut alloc = SegmentAllocator::new(&small_config());
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        {
            let (keys, values) = alloc.buffers_mut(a);
            keys.fill(7);
            values.fill(70);
        }
        let (keys, values) = alloc.buffers(b);
        assert_eq!(keys.len(), 32);
        assert!(keys.iter().all(|&k| k == 0));
        assert!(values.iter().all(|&v| v == 0));
        let (keys, values) = alloc.buffers(a);
        assert!(keys.iter().all(|&k| k == 7));
        assert!(values.iter().all(|&v| v == 70));
    }

    #[test]
    fn test_released_buffer_is_reused_zeroed() {
        let mut alloc = SegmentAllocator::new(&small_config());
        let a = alloc.acquire().unwrap();
        alloc.buffers_mut(a).0[5] = 99;
        alloc.release(a);
        let again = alloc.acquire().unwrap();
        assert_eq!(again, a);
        assert_eq!(alloc.recycled(), 1);
        assert_eq!(alloc.buffers(again).0[5], 0);
    }

    #[test]
    fn test_anonymous_backing() {
        let config = small_config().backing(Backing::Anonymous);
        let mut alloc = SegmentAllocator::new(&config);
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        alloc.buffers_mut(a).0.fill(-3);
        alloc.buffers_mut(b).1[31] = 12;
        assert!(alloc.buffers(a).0.iter().all(|&k| k == -3));
        assert_eq!(alloc.buffers(b).1[31], 12);
        assert_eq!(alloc.buffers(b).0[0], 0);
    }

    #[test]
    fn test_chunk_limit_fails_only_when_pool_is_dry() {
        let mut alloc = SegmentAllocator::new(&small_config());
        alloc.acquire().unwrap();
        alloc.set_chunk_limit(1);
        let pooled: Vec<_> = (0..3).map(|_| alloc.acquire().unwrap()).collect();
        assert!(matches!(
            alloc.acquire(),
            Err(crate::error::PmaError::AllocationFailure { bytes: 2048 })
        ));
        assert_eq!(alloc.chunks(), 1);
        alloc.release(pooled[1]);
        assert_eq!(alloc.acquire().unwrap(), pooled[1]);
    }
}
