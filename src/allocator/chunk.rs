//! Backing memory for allocator chunks.

use memmap2::MmapMut;
use tracing::debug;

use crate::config::{Backing, SLOT_BYTES};
use crate::error::{PmaError, Result};

/// One contiguous run of `i64` slots obtained from the host.
pub(crate) enum ChunkMemory {
    Heap(Box<[i64]>),
    Mapped(MmapMut),
}

impl ChunkMemory {
    /// Obtains `slots` zeroed slots from `backing`.
    pub(crate) fn obtain(backing: Backing, slots: usize) -> Result<Self> {
        let bytes = slots * SLOT_BYTES;
        let memory = match backing {
            Backing::Heap => {
                let mut data: Vec<i64> = Vec::new();
                data.try_reserve_exact(slots)
                    .map_err(|_| PmaError::AllocationFailure { bytes })?;
                data.resize(slots, 0);
                ChunkMemory::Heap(data.into_boxed_slice())
            }
            Backing::Anonymous => {
                let map = MmapMut::map_anon(bytes).map_err(|err| {
                    debug!(bytes, %err, "anonymous map failed");
                    PmaError::AllocationFailure { bytes }
                })?;
                // Maps are page aligned, so the i64 view always exists.
                if bytemuck::try_cast_slice::<u8, i64>(&map[..]).is_err() {
                    return Err(PmaError::AllocationFailure { bytes });
                }
                ChunkMemory::Mapped(map)
            }
        };
        Ok(memory)
    }

    #[inline]
    pub(crate) fn slots(&self) -> &[i64] {
        match self {
            ChunkMemory::Heap(data) => &data[..],
            ChunkMemory::Mapped(map) => bytemuck::cast_slice(&map[..]),
        }
    }

    #[inline]
    pub(crate) fn slots_mut(&mut self) -> &mut [i64] {
        match self {
            ChunkMemory::Heap(data) => &mut data[..],
            ChunkMemory::Mapped(map) => bytemuck::cast_slice_mut(&mut map[..]),
        }
    }
}
