//! Turns a sequential block stream into offset-tagged write chunks.
//!
//! Holes are dropped and runs of contiguous mapped blocks are merged into a
//! single chunk, so a sparse image is written with as few positioned writes as
//! possible. Runs are cut at [`MAX_CHUNK_SIZE`] so progress is reported at
//! least once per MiB even in the middle of a long run.
use crate::block_index::BlockIndex;
use crate::error::{Error, Result};
use std::io;

/// Upper bound on the size of a coalesced chunk.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// A buffer to be written at a byte offset of the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// A run of contiguous mapped blocks that has not been emitted yet.
struct Run {
    start_block: u64,
    last_block: u64,
    data: Vec<u8>,
}

impl Run {
    fn into_chunk(self, block_size: u64) -> Chunk {
        Chunk {
            offset: self.start_block * block_size,
            data: self.data,
        }
    }
}

/// Iterator adapter from image blocks to write [`Chunk`]s.
///
/// Input blocks are numbered from zero in the order they arrive. Chunk offsets
/// come out strictly increasing and never overlap.
pub struct Coalescer<'a, I> {
    blocks: I,
    index: &'a BlockIndex,
    block_size: u64,
    current_block: u64,
    pending: Option<Run>,
    finished: bool,
}

impl<'a, I> Coalescer<'a, I>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    pub fn new(blocks: I, index: &'a BlockIndex, block_size: u64) -> Self {
        Self {
            blocks,
            index,
            block_size,
            current_block: 0,
            pending: None,
            finished: false,
        }
    }

    fn flush(&mut self) -> Option<Chunk> {
        self.pending
            .take()
            .map(|run| run.into_chunk(self.block_size))
    }

    /// Feeds one block; returns a chunk if the block completed a run.
    fn push(&mut self, block: Vec<u8>) -> Result<Option<Chunk>> {
        let number = self.current_block;
        self.current_block += 1;

        if !self.index.is_mapped(number) {
            return Ok(self.flush());
        }

        let Some(run) = self.pending.as_mut() else {
            self.pending = Some(Run {
                start_block: number,
                last_block: number,
                data: block,
            });
            return Ok(self.flush_if_last(number));
        };

        if run.last_block + 1 != number {
            return Err(Error::StreamProtocol {
                expected: run.last_block + 1,
                got: number,
            });
        }

        run.data.extend_from_slice(&block);
        run.last_block = number;
        if run.data.len() >= MAX_CHUNK_SIZE {
            return Ok(self.flush());
        }
        Ok(self.flush_if_last(number))
    }

    /// The final block of the image always closes the pending run.
    fn flush_if_last(&mut self, number: u64) -> Option<Chunk> {
        if number + 1 == self.index.blocks_count() {
            self.flush()
        } else {
            None
        }
    }
}

impl<I> Iterator for Coalescer<'_, I>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let Some(block) = self.blocks.next() else {
                self.finished = true;
                // The image ended before its last mapped block.
                return self.flush().map(Ok);
            };
            let result = block
                .map_err(|e| Error::io(format!("reading image block {}", self.current_block), e))
                .and_then(|block| self.push(block));
            match result {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bmap::BlockRange;

    fn range(from: u64, to: u64) -> BlockRange {
        BlockRange {
            from,
            to,
            checksum: String::new(),
        }
    }

    /// `count` blocks of `size` bytes, each filled with its block number.
    fn numbered_blocks(count: u64, size: usize) -> Vec<io::Result<Vec<u8>>> {
        (0..count).map(|b| Ok(vec![b as u8; size])).collect()
    }

    fn layout(chunks: &[Chunk]) -> Vec<(u64, usize)> {
        chunks.iter().map(|c| (c.offset, c.data.len())).collect()
    }

    fn coalesce(index: &BlockIndex, blocks: Vec<io::Result<Vec<u8>>>, size: u64) -> Vec<Chunk> {
        Coalescer::new(blocks.into_iter(), index, size)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_runs_are_merged_and_holes_dropped() {
        let size = 16;
        let index = BlockIndex::from_ranges(8, &[range(0, 1), range(4, 7)]);
        let chunks = coalesce(&index, numbered_blocks(8, size), size as u64);

        assert_eq!(layout(&chunks), vec![(0, 2 * size), (4 * 16, 4 * size)]);
        assert_eq!(chunks[0].data[..size], [0u8; 16]);
        assert_eq!(chunks[0].data[size..], [1u8; 16]);
        assert_eq!(chunks[1].data[3 * size..], [7u8; 16]);
    }

    #[test]
    fn test_last_block_flushes_short_run() {
        let index = BlockIndex::from_ranges(4, &[range(2, 3)]);
        let mut coalescer = Coalescer::new(numbered_blocks(4, 8).into_iter(), &index, 8);

        // The run is emitted when block 3 arrives, not at end of input.
        let chunk = coalescer.next().unwrap().unwrap();
        assert_eq!((chunk.offset, chunk.data.len()), (16, 16));
        assert!(coalescer.next().is_none());
    }

    #[test]
    fn test_single_mapped_last_block() {
        let index = BlockIndex::from_ranges(4, &[range(3, 3)]);
        let chunks = coalesce(&index, numbered_blocks(4, 8), 8);
        assert_eq!(layout(&chunks), vec![(24, 8)]);
    }

    #[test]
    fn test_long_run_is_split_at_one_mib() {
        let size = 4096;
        let blocks_per_mib = (MAX_CHUNK_SIZE / size) as u64;
        let count = blocks_per_mib * 2 + 10;
        let index = BlockIndex::from_ranges(count, &[range(0, count - 1)]);
        let chunks = coalesce(&index, numbered_blocks(count, size), size as u64);

        assert_eq!(
            layout(&chunks),
            vec![
                (0, MAX_CHUNK_SIZE),
                (MAX_CHUNK_SIZE as u64, MAX_CHUNK_SIZE),
                (2 * MAX_CHUNK_SIZE as u64, 10 * size),
            ]
        );
    }

    #[test]
    fn test_no_ranges_emits_nothing() {
        let index = BlockIndex::from_ranges(8, &[]);
        assert!(coalesce(&index, numbered_blocks(8, 4), 4).is_empty());
    }

    #[test]
    fn test_truncated_image_flushes_pending_run() {
        let index = BlockIndex::from_ranges(8, &[range(2, 7)]);
        let chunks = coalesce(&index, numbered_blocks(5, 4), 4);
        assert_eq!(layout(&chunks), vec![(8, 12)]);
    }

    #[test]
    fn test_blocks_past_the_image_are_ignored() {
        let index = BlockIndex::from_ranges(4, &[range(0, 3)]);
        let chunks = coalesce(&index, numbered_blocks(6, 4), 4);
        assert_eq!(layout(&chunks), vec![(0, 16)]);
    }

    #[test]
    fn test_offsets_strictly_increase() {
        let index = BlockIndex::from_ranges(
            20,
            &[range(15, 16), range(0, 0), range(3, 9), range(18, 19)],
        );
        let chunks = coalesce(&index, numbered_blocks(20, 2), 2);
        assert_eq!(
            layout(&chunks),
            vec![(0, 2), (6, 14), (30, 4), (36, 4)]
        );
        for pair in chunks.windows(2) {
            assert!(pair[0].offset + pair[0].data.len() as u64 <= pair[1].offset);
        }
    }

    #[test]
    fn test_read_error_is_reported_once() {
        let index = BlockIndex::from_ranges(4, &[range(0, 3)]);
        let blocks = vec![Ok(vec![0u8; 4]), Err(io::Error::other("bad sector"))];
        let mut coalescer = Coalescer::new(blocks.into_iter(), &index, 4);

        assert!(matches!(coalescer.next(), Some(Err(Error::Io { .. }))));
        assert!(coalescer.next().is_none());
    }

    #[test]
    fn test_discontinuous_run_is_a_protocol_error() {
        let index = BlockIndex::from_ranges(8, &[range(0, 7)]);
        let mut coalescer = Coalescer::new(numbered_blocks(8, 4).into_iter(), &index, 4);
        coalescer.push(vec![0; 4]).unwrap();
        // Simulate a block that skipped ahead without passing through a hole.
        coalescer.current_block = 5;

        assert!(matches!(
            coalescer.push(vec![0; 4]),
            Err(Error::StreamProtocol {
                expected: 1,
                got: 5
            })
        ));
    }
}
