//! Constant-time "is this block mapped?" lookups.
use crate::bmap::{BlockRange, Bmap};

const WORD_BITS: u64 = u64::BITS as u64;

/// A packed bit set with one bit per block of the image.
///
/// Building it touches each mapped block at most once (whole 64-block words
/// are filled at a time), so a huge image with a few ranges is cheap.
#[derive(Clone, Debug)]
pub struct BlockIndex {
    words: Vec<u64>,
    blocks_count: u64,
}

impl BlockIndex {
    pub fn build(bmap: &Bmap) -> Self {
        Self::from_ranges(bmap.blocks_count, &bmap.ranges)
    }

    /// Builds an index for `blocks_count` blocks with every block in `ranges`
    /// marked as mapped. Parts of a range at or past `blocks_count` are ignored.
    pub fn from_ranges(blocks_count: u64, ranges: &[BlockRange]) -> Self {
        let mut index = BlockIndex {
            words: vec![0; blocks_count.div_ceil(WORD_BITS) as usize],
            blocks_count,
        };
        for range in ranges {
            if range.from >= blocks_count {
                continue;
            }
            index.mark(range.from, range.to.min(blocks_count - 1));
        }
        index
    }

    /// Marks the inclusive block span `[first, last]`.
    fn mark(&mut self, first: u64, last: u64) {
        let mut block = first;
        while block <= last {
            let word = (block / WORD_BITS) as usize;
            let bit = block % WORD_BITS;
            let span = (last - block + 1).min(WORD_BITS - bit);
            let mask = if span == WORD_BITS {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << bit
            };
            self.words[word] |= mask;
            block += span;
        }
    }

    /// Returns whether `block` is mapped. Blocks past the end of the image
    /// are never mapped.
    #[inline]
    pub fn is_mapped(&self, block: u64) -> bool {
        if block >= self.blocks_count {
            return false;
        }
        let word = self.words[(block / WORD_BITS) as usize];
        word & (1 << (block % WORD_BITS)) != 0
    }

    pub fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    /// Number of mapped blocks.
    pub fn mapped_count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }
}
