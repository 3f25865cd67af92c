//! Engine configuration.
//!
//! Every size is fixed when the engine is constructed. The defaults match
//! the layout the engine was tuned with: 1 KiB segments (128 slots), 2 MiB
//! allocation chunks, leaves of five segments and internal nodes of four
//! children.

use crate::error::{PmaError, Result};

/// Slots per occupancy block; one block is one rank-table lookup.
pub const BLOCK_SLOTS: usize = 16;

/// Width in bytes of one stored key (and of one stored value).
pub const SLOT_BYTES: usize = std::mem::size_of::<i64>();

/// Where segment chunks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backing {
    /// Zeroed heap allocations.
    #[default]
    Heap,
    /// Private anonymous memory maps.
    Anonymous,
}

/// Configuration for a [`crate::Pma`].
#[derive(Debug, Clone)]
pub struct PmaConfig {
    /// Bytes of key storage per segment. Capacity is this divided by 8.
    pub segment_bytes: usize,
    /// Bytes obtained per allocator request, sliced into segments.
    pub chunk_bytes: usize,
    /// Largest slot distance left between neighbouring keys when spreading.
    pub max_gap: usize,
    /// Segments per directory leaf.
    pub leaf_fanout: usize,
    /// Children per internal directory node.
    pub node_fanout: usize,
    /// Fill ratio that makes a single segment rebalance.
    pub top_density: f64,
    /// Fill ratio at the deepest escalation level.
    pub bottom_density: f64,
    /// Number of escalation levels between `top_density` and `bottom_density`.
    pub density_levels: usize,
    /// Fill ratio targeted by each segment written during redistribution.
    /// `None` uses the midpoint of the top and bottom densities.
    pub redistribute_density: Option<f64>,
    pub backing: Backing,
}

impl Default for PmaConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 1024,
            chunk_bytes: 2 * 1024 * 1024,
            max_gap: 3,
            leaf_fanout: 5,
            node_fanout: 4,
            top_density: 0.95,
            bottom_density: 0.50,
            density_levels: 65,
            redistribute_density: None,
            backing: Backing::Heap,
        }
    }
}

impl PmaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_bytes(mut self, bytes: usize) -> Self {
        self.segment_bytes = bytes;
        self
    }

    pub fn chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes;
        self
    }

    pub fn max_gap(mut self, gap: usize) -> Self {
        self.max_gap = gap;
        self
    }

    pub fn fanout(mut self, leaf: usize, node: usize) -> Self {
        self.leaf_fanout = leaf;
        self.node_fanout = node;
        self
    }

    pub fn densities(mut self, top: f64, bottom: f64, levels: usize) -> Self {
        self.top_density = top;
        self.bottom_density = bottom;
        self.density_levels = levels;
        self
    }

    pub fn redistribute_density(mut self, density: f64) -> Self {
        self.redistribute_density = Some(density);
        self
    }

    pub fn backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    /// Slots per segment.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.segment_bytes / SLOT_BYTES
    }

    #[inline]
    pub fn blocks_per_segment(&self) -> usize {
        self.capacity() / BLOCK_SLOTS
    }

    #[inline]
    pub fn segments_per_chunk(&self) -> usize {
        self.chunk_bytes / self.segment_bytes
    }

    pub fn validate(&self) -> Result<()> {
        let capacity = self.capacity();
        if self.segment_bytes % (BLOCK_SLOTS * SLOT_BYTES) != 0 || capacity < 2 * BLOCK_SLOTS {
            return Err(PmaError::Config(format!(
                "segment_bytes must be a multiple of {} and hold at least {} slots, got {}",
                BLOCK_SLOTS * SLOT_BYTES,
                2 * BLOCK_SLOTS,
                self.segment_bytes
            )));
        }
        if self.chunk_bytes < self.segment_bytes || self.chunk_bytes % self.segment_bytes != 0 {
            return Err(PmaError::Config(format!(
                "chunk_bytes ({}) must be a non-zero multiple of segment_bytes ({})",
                self.chunk_bytes, self.segment_bytes
            )));
        }
        if self.max_gap == 0 {
            return Err(PmaError::Config("max_gap must be at least 1".into()));
        }
        if self.leaf_fanout < 2 || self.node_fanout < 2 {
            return Err(PmaError::Config(format!(
                "fanouts must be at least 2, got leaf={} node={}",
                self.leaf_fanout, self.node_fanout
            )));
        }
        let (top, bottom) = (self.top_density, self.bottom_density);
        if !(bottom > 0.0 && bottom < top && top < 1.0) {
            return Err(PmaError::Config(format!(
                "densities must satisfy 0 < bottom < top < 1, got top={top} bottom={bottom}"
            )));
        }
        // A segment must never be forced to fill up before it rebalances.
        if (top * capacity as f64) >= (capacity - 1) as f64 {
            return Err(PmaError::Config(format!(
                "top_density {top} leaves no headroom in a {capacity}-slot segment"
            )));
        }
        if self.density_levels < 2 {
            return Err(PmaError::Config("density_levels must be at least 2".into()));
        }
        let fill = self.fill_target();
        if !(fill > 0.0 && fill <= top) {
            return Err(PmaError::Config(format!(
                "redistribute_density must lie in (0, top_density], got {fill}"
            )));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn fill_target(&self) -> f64 {
        self.redistribute_density
            .unwrap_or((self.top_density + self.bottom_density) / 2.0)
    }
}

/// Level-indexed fill-ratio thresholds.
///
/// Level 0 is a single segment, level 1 a leaf, level `n` an internal node
/// `n - 1` levels above the leaves. Thresholds fall linearly from the top
/// density at level 0 to the bottom density at the last level.
#[derive(Debug, Clone)]
pub struct DensitySchedule {
    levels: Vec<f64>,
}

impl DensitySchedule {
    pub fn new(top: f64, bottom: f64, levels: usize) -> Self {
        let step = (top - bottom) / levels as f64;
        let levels = (0..=levels).map(|i| top - step * i as f64).collect();
        Self { levels }
    }

    pub fn from_config(config: &PmaConfig) -> Self {
        Self::new(config.top_density, config.bottom_density, config.density_levels)
    }

    /// Threshold at `level`. Levels past the schedule use the bottom density.
    #[inline]
    pub fn at(&self, level: usize) -> f64 {
        let last = self.levels.len() - 1;
        self.levels[level.min(last)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PmaConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capacity(), 128);
        assert_eq!(config.blocks_per_segment(), 8);
        assert_eq!(config.segments_per_chunk(), 2048);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(PmaConfig::new().segment_bytes(1000).validate().is_err());
        assert!(PmaConfig::new().segment_bytes(128).validate().is_err());
        assert!(PmaConfig::new().chunk_bytes(1500).validate().is_err());
        assert!(PmaConfig::new().max_gap(0).validate().is_err());
        assert!(PmaConfig::new().fanout(1, 4).validate().is_err());
        assert!(PmaConfig::new().densities(0.5, 0.9, 10).validate().is_err());
        assert!(PmaConfig::new().densities(0.99, 0.5, 10).segment_bytes(256).validate().is_err());
        assert!(PmaConfig::new().redistribute_density(0.97).validate().is_err());
    }

    #[test]
    fn test_schedule_is_linear_and_clamped() {
        let schedule = DensitySchedule::new(0.95, 0.50, 9);
        assert!((schedule.at(0) - 0.95).abs() < 1e-12);
        assert!((schedule.at(9) - 0.50).abs() < 1e-12);
        assert!((schedule.at(3) - 0.80).abs() < 1e-12);
        assert!((schedule.at(100) - 0.50).abs() < 1e-12);
        for level in 1..=9 {
            assert!(schedule.at(level) < schedule.at(level - 1));
        }
    }
}
