//! Contains the logic for verifying a flashed device against its bmap.
use crate::bmap::{BlockRange, Bmap};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::progress::{self, Progress, ProgressState};
use log::{debug, info};
use std::io;

// Ranges are read and hashed in pieces of at most 1 MiB.
const BUFFER_SIZE: u64 = 1024 * 1024;

/// Re-reads every mapped range from the device and checks its checksum.
///
/// Ranges are processed in descriptor order, one read at a time. A mismatch
/// does not stop the scan: all mismatching ranges are collected and returned,
/// so an empty list means the device holds the image.
///
/// # Arguments
///
/// * `device` - The flashed device. It is borrowed; the caller opens and closes
///   it.
/// * `bmap_text` - Contents of the bmap file the device was flashed with.
/// * `on_progress` - Closure called, throttled, with the verification progress.
///
/// # Errors
///
/// This function will return an error if:
/// - The bmap is malformed or its version is not supported.
/// - Reading the device fails, or it ends before a mapped range does.
pub fn run<D, F>(device: &mut D, bmap_text: &str, on_progress: F) -> Result<Vec<BlockRange>>
where
    D: BlockDevice + ?Sized,
    F: FnMut(&ProgressState),
{
    let bmap = Bmap::parse(bmap_text)?;
    run_with_bmap(device, &bmap, progress::DEFAULT_INTERVAL, on_progress)
}

/// Same as [`run`] for an already parsed bmap, with a custom progress
/// interval.
pub fn run_with_bmap<D, F>(
    device: &mut D,
    bmap: &Bmap,
    progress_interval: std::time::Duration,
    on_progress: F,
) -> Result<Vec<BlockRange>>
where
    D: BlockDevice + ?Sized,
    F: FnMut(&ProgressState),
{
    bmap.ensure_supported()?;

    let mut progress = Progress::new(bmap.mapped_bytes(), progress_interval, on_progress);
    let largest_range = bmap
        .ranges
        .iter()
        .map(|r| r.byte_len(bmap.block_size))
        .max()
        .unwrap_or(0);
    let mut buffer = vec![0u8; largest_range.min(BUFFER_SIZE) as usize];
    let mut invalid = Vec::new();

    for range in &bmap.ranges {
        let checksum = range_checksum(device, bmap, range, &mut buffer, &mut progress)?;
        if !checksum.eq_ignore_ascii_case(&range.checksum) {
            info!(
                "Checksum mismatch in blocks {}-{}: expected {}, got {}",
                range.from, range.to, range.checksum, checksum
            );
            invalid.push(range.clone());
        }
    }
    progress.stop();

    info!(
        "Verified {} ranges, {} mismatched",
        bmap.ranges.len(),
        invalid.len()
    );
    Ok(invalid)
}

fn range_checksum<D, F>(
    device: &mut D,
    bmap: &Bmap,
    range: &BlockRange,
    buffer: &mut [u8],
    progress: &mut Progress<F>,
) -> Result<String>
where
    D: BlockDevice + ?Sized,
    F: FnMut(&ProgressState),
{
    let start = range.byte_offset(bmap.block_size);
    let len = range.byte_len(bmap.block_size);
    debug!("Reading {} bytes at offset {:#x}", len, start);

    let mut hasher = bmap.checksum_type.hasher();
    let mut done = 0u64;
    while done < len {
        let want = (len - done).min(buffer.len() as u64) as usize;
        let offset = start + done;
        let got = device
            .read_at(&mut buffer[..want], offset)
            .map_err(|e| Error::io(format!("reading {want} bytes at offset {offset}"), e))?;
        if got != want {
            return Err(Error::io(
                format!("reading {want} bytes at offset {offset}"),
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("expected {want} bytes but got {got}"),
                ),
            ));
        }
        hasher.update(&buffer[..want]);
        progress.tick(want as u64);
        done += want as u64;
    }
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumType;
    use std::io::Cursor;

    const BLOCK: u64 = 4;

    fn bmap(device: &[u8], ranges: &[(u64, u64)], checksum_type: ChecksumType) -> Bmap {
        let ranges: Vec<BlockRange> = ranges
            .iter()
            .map(|&(from, to)| BlockRange {
                from,
                to,
                checksum: checksum_type
                    .checksum(&device[(from * BLOCK) as usize..((to + 1) * BLOCK) as usize]),
            })
            .collect();
        Bmap {
            version: "2.0".into(),
            checksum_type,
            image_size: device.len() as u64,
            block_size: BLOCK,
            blocks_count: device.len() as u64 / BLOCK,
            mapped_blocks_count: ranges.iter().map(BlockRange::block_count).sum(),
            ranges,
        }
    }

    fn device() -> Vec<u8> {
        (0..32u8).collect()
    }

    fn verify(device: Vec<u8>, bmap: &Bmap) -> Result<Vec<BlockRange>> {
        run_with_bmap(&mut Cursor::new(device), bmap, progress::DEFAULT_INTERVAL, |_| {})
    }

    #[test]
    fn test_matching_device_verifies() {
        let bmap = bmap(&device(), &[(0, 1), (4, 7)], ChecksumType::Sha256);
        assert!(verify(device(), &bmap).unwrap().is_empty());
    }

    #[test]
    fn test_mismatches_are_collected_without_stopping() {
        let bmap = bmap(&device(), &[(6, 7), (0, 0), (2, 3), (5, 5)], ChecksumType::Sha1);
        let mut corrupted = device();
        corrupted[0] ^= 0xff; // block 0
        corrupted[29] ^= 0xff; // block 7

        let invalid = verify(corrupted, &bmap).unwrap();
        let invalid: Vec<_> = invalid.iter().map(|r| (r.from, r.to)).collect();
        assert_eq!(invalid, vec![(6, 7), (0, 0)]);
    }

    #[test]
    fn test_holes_are_not_checked() {
        let bmap = bmap(&device(), &[(0, 1)], ChecksumType::Md5);
        let mut changed = device();
        changed[20] = 0;
        assert!(verify(changed, &bmap).unwrap().is_empty());
    }

    #[test]
    fn test_short_device_is_an_io_error() {
        let bmap = bmap(&device(), &[(0, 1), (6, 7)], ChecksumType::Sha1);
        let result = verify(device()[..26].to_vec(), &bmap);
        match result {
            Err(Error::Io { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected a short read error, got {other:?}"),
        }
    }

    #[test]
    fn test_progress_counts_every_mapped_byte() {
        let bmap = bmap(&device(), &[(0, 1), (4, 7)], ChecksumType::Sha1);
        let mut last = None;
        run_with_bmap(
            &mut Cursor::new(device()),
            &bmap,
            std::time::Duration::from_secs(3600),
            |s| last = Some(s.clone()),
        )
        .unwrap();

        let last = last.unwrap();
        assert_eq!(last.transferred, 24);
        assert_eq!(last.total, 24);
    }

    #[test]
    fn test_unsupported_version() {
        let mut bmap = bmap(&device(), &[(0, 1)], ChecksumType::Sha1);
        bmap.version = "99.9".into();
        assert!(matches!(
            verify(device(), &bmap),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_no_ranges() {
        let bmap = bmap(&device(), &[], ChecksumType::Sha1);
        assert!(verify(device(), &bmap).unwrap().is_empty());
    }
}
