//! Error types for bmapflash-core.

use std::io;
use thiserror::Error;

/// Errors that terminate a flash or verify operation.
///
/// Checksum mismatches found during verification are not errors; they are
/// returned as data by [`crate::verify::run`].
#[derive(Debug, Error)]
pub enum Error {
    /// The bmap descriptor is malformed or incomplete.
    #[error("Malformed bmap: {0}")]
    Format(String),

    /// The bmap descriptor declares a version outside the supported set.
    #[error("Unsupported bmap version: {0}")]
    UnsupportedVersion(String),

    /// Reading the image, or reading/writing the device, failed.
    ///
    /// Short reads and short writes are reported here as well.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A mapped block arrived that does not continue the pending run.
    #[error("Block {got} arrived while a run ending at block {expected} was pending")]
    StreamProtocol { expected: u64, got: u64 },
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns `true` for device or image I/O failures.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. })
    }
}

/// Result type for bmapflash-core operations.
pub type Result<T> = std::result::Result<T, Error>;
