//! The core, UI-agnostic library for the `bmapflash` sparse imaging utility.
//!
//! `bmapflash-core` writes disk images to block devices using a bmap file: an
//! XML descriptor listing which blocks of the image actually hold data. Only
//! those blocks are written, which for typical OS images skips most of the
//! device. Afterwards every mapped range can be read back and checked against
//! the checksums in the bmap.
//!
//! The library is structured into several key modules:
//! - [`bmap`]: The parsed bmap descriptor and its validation.
//! - [`block_index`]: Constant-time lookup of whether a block is mapped.
//! - [`coalesce`]: Turns a block stream into offset-tagged write chunks.
//! - [`mod@write`]: Writes an image to a device. Entry point: [`write::run`].
//! - [`verify`]: Checks a device against a bmap. Entry point: [`verify::run`].
//! - [`progress`]: Throttled progress reporting used by both of the above.
//! - [`source`]: Opens (optionally compressed) image files.
//!
//! Both entry points run to completion on the calling thread and report their
//! progress via a callback, allowing the calling application to display it in
//! any way it chooses. The device is borrowed for the duration of the call;
//! opening and closing it is up to the caller.
//!
//! ## Example: Flashing and Verifying an Image
//!
//! ```rust,no_run
//! use bmapflash_core::{source, verify, write};
//! use std::fs::{self, OpenOptions};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bmap = fs::read_to_string("path/to/image.img.bmap")?;
//!     let image = source::open_image(Path::new("path/to/image.img.xz"))?;
//!     let mut device = OpenOptions::new().read(true).write(true).open("/dev/sdX")?;
//!
//!     let options = write::FlashOptions::new().zero_fill_prefix_bytes(1024 * 1024);
//!     write::run(image, &mut device, &bmap, &options, |state| {
//!         println!("{:.1}% written", state.percentage);
//!     })?;
//!
//!     let invalid = verify::run(&mut device, &bmap, |state| {
//!         println!("{:.1}% verified", state.percentage);
//!     })?;
//!     if !invalid.is_empty() {
//!         println!("{} ranges did not verify", invalid.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod block_index;
pub mod bmap;
pub mod checksum;
pub mod chunker;
pub mod coalesce;
pub mod device;
pub mod error;
pub mod progress;
pub mod source;
pub mod verify;
pub mod write;
mod xml;

pub use bmap::{BlockRange, Bmap};
pub use device::BlockDevice;
pub use error::{Error, Result};
pub use progress::ProgressState;
pub use write::FlashOptions;
