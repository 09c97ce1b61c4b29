//! Splits an image stream into fixed-size blocks.
use std::io::{self, Read};

/// Iterator over consecutive `block_size` blocks of a reader.
///
/// A trailing partial block is padded with zeros to the full block size. The
/// reader is consumed incrementally, one block at a time.
pub struct Blocks<R> {
    reader: R,
    block_size: usize,
    done: bool,
}

impl<R: Read> Blocks<R> {
    pub fn new(reader: R, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            reader,
            block_size,
            done: false,
        }
    }

    fn read_block(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut block = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < block.len() {
            match self.reader.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if filled < block.len() {
            self.done = true;
        }
        // The tail of `block` is already zeroed.
        Ok((filled > 0).then_some(block))
    }
}

impl<R: Read> Iterator for Blocks<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_block() {
            Ok(block) => block.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
