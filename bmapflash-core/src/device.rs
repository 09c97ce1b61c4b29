//! Positioned I/O on the caller's target device.
//!
//! The core never opens or closes a device. Callers hand in anything that
//! implements [`BlockDevice`]: an opened `/dev/sdX` file, a regular file, or an
//! in-memory `io::Cursor` in tests.
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Reads and writes at absolute byte offsets.
pub trait BlockDevice {
    /// Writes all of `buf` starting at `offset`.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Reads into `buf` starting at `offset` until `buf` is full or the
    /// device ends, returning the number of bytes read.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Makes every completed write durable on the device.
    fn sync(&mut self) -> io::Result<()>;
}

fn seek_write<T: Write + Seek>(inner: &mut T, buf: &[u8], offset: u64) -> io::Result<()> {
    inner.seek(SeekFrom::Start(offset))?;
    inner.write_all(buf)
}

fn seek_read<T: Read + Seek>(inner: &mut T, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    inner.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match inner.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl BlockDevice for File {
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        seek_write(self, buf, offset)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        seek_read(self, buf, offset)
    }

    /// `flush` is a no-op for files; only `fsync` gets the data to the medium.
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl<T> BlockDevice for Cursor<T>
where
    Cursor<T>: Read + Write + Seek,
{
    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        seek_write(self, buf, offset)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        seek_read(self, buf, offset)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}
