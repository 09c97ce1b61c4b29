//! Contains the logic for writing a sparse image to a device.
//!
//! Writing an image is a multi-stage process:
//! 1.  Parsing the bmap descriptor and rejecting unsupported versions.
//! 2.  Optionally zeroing a fixed-size preamble at the start of the device.
//! 3.  Streaming the image block by block, dropping holes and coalescing
//!     contiguous mapped blocks into chunks.
//! 4.  Writing each chunk at its offset, one write at a time, in order.
use crate::bmap::Bmap;
use crate::block_index::BlockIndex;
use crate::chunker::Blocks;
use crate::coalesce::{Chunk, Coalescer};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::progress::{self, Progress, ProgressState};
use log::{debug, info};
use std::io::{self, Read};
use std::time::Duration;

/// Options for [`run`].
#[derive(Clone, Debug)]
pub struct FlashOptions {
    /// Number of bytes to zero at the start of the device before writing the
    /// image, e.g. to wipe a stale partition table. `0` disables it.
    pub zero_fill_prefix_bytes: u64,
    /// Minimum time between two progress notifications.
    pub progress_interval: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            zero_fill_prefix_bytes: 0,
            progress_interval: progress::DEFAULT_INTERVAL,
        }
    }
}

impl FlashOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zero_fill_prefix_bytes(mut self, bytes: u64) -> Self {
        self.zero_fill_prefix_bytes = bytes;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Writes `count` zero bytes at the start of the device.
///
/// A zero count issues no write at all; some block devices fail a zero-length
/// write with `EIO`.
pub fn zero_fill<D>(device: &mut D, count: u64) -> Result<()>
where
    D: BlockDevice + ?Sized,
{
    if count == 0 {
        return Ok(());
    }
    let len = usize::try_from(count).map_err(|_| {
        Error::io(
            format!("zeroing the first {count} bytes"),
            io::Error::new(io::ErrorKind::InvalidInput, "zero-fill length does not fit in memory"),
        )
    })?;
    device
        .write_at(&vec![0u8; len], 0)
        .map_err(|e| Error::io(format!("zeroing the first {count} bytes"), e))
}

/// Writes each chunk at its offset, strictly in order.
///
/// A write is only issued after the previous one returned, so at most one
/// write is outstanding and the device sees non-decreasing offsets. The first
/// failure ends the sequence and is returned; nothing after it is written.
/// `on_written` is called with the size of every successfully written chunk.
///
/// Returns the total number of bytes written.
pub fn write_chunks<D, I, F>(device: &mut D, chunks: I, mut on_written: F) -> Result<u64>
where
    D: BlockDevice + ?Sized,
    I: IntoIterator<Item = Result<Chunk>>,
    F: FnMut(u64),
{
    let mut written = 0u64;
    for chunk in chunks {
        let chunk = chunk?;
        let len = chunk.data.len() as u64;
        debug!("Writing {} bytes at offset {:#x}", len, chunk.offset);
        device.write_at(&chunk.data, chunk.offset).map_err(|e| {
            Error::io(
                format!("writing {} bytes at offset {}", len, chunk.offset),
                e,
            )
        })?;
        written += len;
        on_written(len);
    }
    Ok(written)
}

/// Writes a sparse image to a device, guided by the text of its bmap file.
///
/// This is the main entry point for flashing. The descriptor is parsed and
/// its version checked before the device is touched.
///
/// # Arguments
///
/// * `image` - The raw (already decompressed) image stream. It is read block by
///   block and never held in memory as a whole.
/// * `device` - The target device. It is borrowed; the caller opens and closes
///   it.
/// * `bmap_text` - Contents of the bmap file describing `image`.
/// * `options` - See [`FlashOptions`].
/// * `on_progress` - Closure called, throttled, with the write progress. It is
///   never called after this function returns.
///
/// # Errors
///
/// This function will return an error if:
/// - The bmap is malformed ([`Error::Format`]) or its version is not supported
///   ([`Error::UnsupportedVersion`]). No I/O has happened in that case.
/// - Reading the image or writing the device fails ([`Error::Io`]).
pub fn run<R, D, F>(
    image: R,
    device: &mut D,
    bmap_text: &str,
    options: &FlashOptions,
    on_progress: F,
) -> Result<()>
where
    R: Read,
    D: BlockDevice + ?Sized,
    F: FnMut(&ProgressState),
{
    debug!("Parsing bmap");
    let bmap = Bmap::parse(bmap_text)?;
    run_with_bmap(image, device, &bmap, options, on_progress)
}

/// Same as [`run`] for an already parsed bmap.
pub fn run_with_bmap<R, D, F>(
    image: R,
    device: &mut D,
    bmap: &Bmap,
    options: &FlashOptions,
    on_progress: F,
) -> Result<()>
where
    R: Read,
    D: BlockDevice + ?Sized,
    F: FnMut(&ProgressState),
{
    bmap.ensure_supported()?;

    let index = BlockIndex::build(bmap);
    if index.mapped_count() != bmap.mapped_blocks_count {
        return Err(Error::format(format!(
            "ranges overlap: {} distinct blocks mapped but MappedBlocksCount is {}",
            index.mapped_count(),
            bmap.mapped_blocks_count
        )));
    }

    if options.zero_fill_prefix_bytes > 0 {
        debug!("Zeroing the first {} bytes", options.zero_fill_prefix_bytes);
    }
    zero_fill(device, options.zero_fill_prefix_bytes)?;

    debug!(
        "Streaming {} mapped blocks of {} bytes",
        bmap.mapped_blocks_count, bmap.block_size
    );
    let block_size = usize::try_from(bmap.block_size)
        .map_err(|_| Error::format(format!("block size {} is too large", bmap.block_size)))?;
    let chunks = Coalescer::new(Blocks::new(image, block_size), &index, bmap.block_size);

    let mut progress = Progress::new(bmap.mapped_bytes(), options.progress_interval, on_progress);
    let written = write_chunks(device, chunks, |len| progress.tick(len))?;
    device
        .sync()
        .map_err(|e| Error::io("flushing the device", e))?;
    progress.stop();

    info!(
        "Wrote {} bytes ({} of {} blocks mapped)",
        written, bmap.mapped_blocks_count, bmap.blocks_count
    );
    Ok(())
}
