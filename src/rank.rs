//! Precomputed popcount and set-bit positions for every 16-bit pattern.
//!
//! Occupancy bitmaps are stored in 16-slot blocks. Looking a block up here
//! answers "how many slots are taken" and "which ones" with a single index,
//! which lets the segment code jump over whole blocks when it hunts for the
//! nearest occupied or vacant slot.

use std::sync::OnceLock;

use crate::config::BLOCK_SLOTS;

const PATTERNS: usize = 1 << BLOCK_SLOTS;

/// Rank entry for one 16-bit pattern.
#[derive(Clone, Copy)]
struct Rank {
    count: u8,
    /// Set-bit positions in ascending order; only `count` are meaningful.
    positions: [u8; BLOCK_SLOTS],
}

/// The process-wide rank table. Built once, never mutated.
pub struct RankTable {
    ranks: Box<[Rank]>,
}

impl RankTable {
    /// Returns the shared table, building it on first use.
    pub fn global() -> &'static RankTable {
        static TABLE: OnceLock<RankTable> = OnceLock::new();
        TABLE.get_or_init(RankTable::build)
    }

    fn build() -> Self {
        let mut ranks = Vec::with_capacity(PATTERNS);
        for pattern in 0..PATTERNS {
            let mut rank = Rank {
                count: 0,
                positions: [0; BLOCK_SLOTS],
            };
            for bit in 0..BLOCK_SLOTS {
                if pattern & (1 << bit) != 0 {
                    rank.positions[rank.count as usize] = bit as u8;
                    rank.count += 1;
                }
            }
            ranks.push(rank);
        }
        Self {
            ranks: ranks.into_boxed_slice(),
        }
    }

    /// Number of set bits in `pattern`.
    #[inline]
    pub fn count(&self, pattern: u16) -> usize {
        self.ranks[pattern as usize].count as usize
    }

    /// Set-bit positions of `pattern`, ascending.
    #[inline]
    pub fn positions(&self, pattern: u16) -> &[u8] {
        let rank = &self.ranks[pattern as usize];
        &rank.positions[..rank.count as usize]
    }

    /// Highest set bit of `pattern`.
    #[inline]
    pub fn last(&self, pattern: u16) -> Option<usize> {
        self.positions(pattern).last().map(|&p| p as usize)
    }

    /// Lowest set bit of `pattern`.
    #[inline]
    pub fn first(&self, pattern: u16) -> Option<usize> {
        self.positions(pattern).first().map(|&p| p as usize)
    }

    /// Highest set bit strictly below `bit`.
    #[inline]
    pub fn last_below(&self, pattern: u16, bit: usize) -> Option<usize> {
        self.positions(pattern)
            .iter()
            .rev()
            .map(|&p| p as usize)
            .find(|&p| p < bit)
    }

    /// Lowest set bit strictly above `bit`.
    #[inline]
    pub fn first_above(&self, pattern: u16, bit: usize) -> Option<usize> {
        self.positions(pattern)
            .iter()
            .map(|&p| p as usize)
            .find(|&p| p > bit)
    }

    /// Lowest clear bit strictly above `bit`.
    ///
    /// Walks the gaps between consecutive set positions instead of testing
    /// every bit.
    pub fn first_clear_above(&self, pattern: u16, bit: usize) -> Option<usize> {
        match self.count(pattern) {
            0 => (bit + 1 < BLOCK_SLOTS).then_some(bit + 1),
            BLOCK_SLOTS => None,
            _ => {
                let mut candidate = bit + 1;
                for &p in self.positions(pattern) {
                    let p = p as usize;
                    if p < candidate {
                        continue;
                    }
                    if p > candidate {
                        break;
                    }
                    candidate += 1;
                }
                (candidate < BLOCK_SLOTS).then_some(candidate)
            }
        }
    }

    /// Lowest clear bit of `pattern`.
    #[inline]
    pub fn first_clear(&self, pattern: u16) -> Option<usize> {
        if pattern & 1 == 0 {
            Some(0)
        } else {
            self.first_clear_above(pattern, 0)
        }
    }

    /// Highest clear bit of `pattern`.
    #[inline]
    pub fn last_clear(&self, pattern: u16) -> Option<usize> {
        self.last_clear_below(pattern, BLOCK_SLOTS)
    }

    /// Highest clear bit strictly below `bit`.
    pub fn last_clear_below(&self, pattern: u16, bit: usize) -> Option<usize> {
        match self.count(pattern) {
            0 => bit.checked_sub(1),
            BLOCK_SLOTS => None,
            _ => {
                let mut candidate = bit.checked_sub(1)?;
                for &p in self.positions(pattern).iter().rev() {
                    let p = p as usize;
                    if p > candidate {
                        continue;
                    }
                    if p < candidate {
                        break;
                    }
                    candidate = candidate.checked_sub(1)?;
                }
                Some(candidate)
            }
        }
    }
}
