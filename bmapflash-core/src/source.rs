//! Opens image files, decompressing them on the fly.
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

/// Compression formats recognized by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// Wraps `reader` in the decoder for `compression`.
pub fn decoder<'a, R>(reader: R, compression: Compression) -> io::Result<Box<dyn Read + 'a>>
where
    R: Read + 'a,
{
    let reader = BufReader::new(reader);
    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
        Compression::Xz => Box::new(XzDecoder::new(reader)),
        Compression::Zstd => Box::new(ZstdDecoder::with_buffer(reader)?),
    })
}

/// Opens an image file as a stream of raw image bytes.
///
/// `.gz`, `.xz` and `.zst` images are decompressed while they are read, so
/// the decompressed image never has to exist on disk or in memory.
pub fn open_image(path: &Path) -> io::Result<Box<dyn Read>> {
    let file = File::open(path)?;
    decoder(file, Compression::from_path(path))
}
