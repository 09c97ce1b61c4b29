//! The bmap descriptor model.
//!
//! A bmap file describes which fixed-size blocks of a disk image contain
//! data. Everything else is a hole that does not need to be written. Each
//! mapped range carries a checksum so the written blocks can be verified
//! afterwards.
//!
//! ```xml
//! <bmap version="2.0">
//!     <ImageSize> 821752 </ImageSize>
//!     <BlockSize> 4096 </BlockSize>
//!     <BlocksCount> 201 </BlocksCount>
//!     <MappedBlocksCount> 117 </MappedBlocksCount>
//!     <ChecksumType> sha256 </ChecksumType>
//!     <BlockMap>
//!         <Range chksum="9eaf19215d55d23de1be1fe4bed4a95bfe620a404352fd06e782738fff58e500"> 0-1 </Range>
//!         ...
//!     </BlockMap>
//! </bmap>
//! ```
use crate::checksum::ChecksumType;
use crate::error::{Error, Result};
use crate::xml::{self, Element};

/// bmap versions this crate knows how to flash.
pub const SUPPORTED_VERSIONS: [&str; 4] = ["1.1", "1.3", "1.4", "2.0"];

/// Returns `true` if `version` exactly matches a supported bmap version.
pub fn is_version_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// An inclusive range of mapped blocks and the checksum of their contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRange {
    /// First block of the range.
    pub from: u64,
    /// Last block of the range (inclusive).
    pub to: u64,
    /// Lowercase hex checksum of the range's bytes.
    pub checksum: String,
}

impl BlockRange {
    /// Number of blocks in the range.
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn byte_offset(&self, block_size: u64) -> u64 {
        self.from * block_size
    }

    pub fn byte_len(&self, block_size: u64) -> u64 {
        self.block_count() * block_size
    }
}

/// A parsed and validated bmap descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bmap {
    pub version: String,
    pub checksum_type: ChecksumType,
    pub image_size: u64,
    pub block_size: u64,
    pub blocks_count: u64,
    pub mapped_blocks_count: u64,
    /// Mapped ranges in descriptor order. They do not overlap but are not
    /// necessarily sorted.
    pub ranges: Vec<BlockRange>,
}

impl Bmap {
    /// Parses and validates the text of a bmap file.
    ///
    /// The `version` attribute is checked first, byte for byte, so a
    /// descriptor of an unknown version is rejected whatever its layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedVersion`] if the version is not one of
    /// [`SUPPORTED_VERSIONS`], and [`Error::Format`] if the XML is malformed, a required field is
    /// missing or not an integer, a range is inverted or lies beyond the
    /// image, or the declared counts contradict the ranges.
    pub fn parse(text: &str) -> Result<Self> {
        let root = xml::parse(text)?;
        if root.name != "bmap" {
            return Err(Error::format(format!(
                "expected root element <bmap>, found <{}>",
                root.name
            )));
        }

        let version = root
            .attribute("version")
            .ok_or_else(|| Error::format("missing version attribute"))?
            .to_string();
        if !is_version_supported(&version) {
            return Err(Error::UnsupportedVersion(version));
        }

        let checksum_type = match root.child("ChecksumType") {
            Some(element) if !element.text.trim().is_empty() => element.text.parse()?,
            _ => ChecksumType::default(),
        };

        let block_map = root
            .child("BlockMap")
            .ok_or_else(|| Error::format("missing <BlockMap>"))?;
        let ranges = block_map
            .children_named("Range")
            .map(|range| parse_range(range, checksum_type))
            .collect::<Result<Vec<_>>>()?;

        let bmap = Bmap {
            version,
            checksum_type,
            image_size: number_field(&root, "ImageSize")?,
            block_size: number_field(&root, "BlockSize")?,
            blocks_count: number_field(&root, "BlocksCount")?,
            mapped_blocks_count: number_field(&root, "MappedBlocksCount")?,
            ranges,
        };
        bmap.validate()?;
        Ok(bmap)
    }

    /// Fails with [`Error::UnsupportedVersion`] unless the version is one of
    /// [`SUPPORTED_VERSIONS`].
    pub fn ensure_supported(&self) -> Result<()> {
        if is_version_supported(&self.version) {
            Ok(())
        } else {
            Err(Error::UnsupportedVersion(self.version.clone()))
        }
    }

    /// Total number of bytes covered by mapped blocks.
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_blocks_count * self.block_size
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::format("block size is zero"));
        }
        let capacity = self
            .blocks_count
            .checked_mul(self.block_size)
            .ok_or_else(|| Error::format("blocks count times block size overflows"))?;
        if capacity < self.image_size {
            return Err(Error::format(format!(
                "{} blocks of {} bytes cannot hold an image of {} bytes",
                self.blocks_count, self.block_size, self.image_size
            )));
        }

        let mut mapped = 0u64;
        for range in &self.ranges {
            if range.to >= self.blocks_count {
                return Err(Error::format(format!(
                    "range {}-{} lies beyond the last block {}",
                    range.from,
                    range.to,
                    self.blocks_count.saturating_sub(1)
                )));
            }
            mapped = mapped.saturating_add(range.block_count());
        }
        if self.mapped_blocks_count > self.blocks_count {
            return Err(Error::format(format!(
                "MappedBlocksCount {} exceeds BlocksCount {}",
                self.mapped_blocks_count, self.blocks_count
            )));
        }
        if mapped != self.mapped_blocks_count {
            return Err(Error::format(format!(
                "ranges map {} blocks but MappedBlocksCount is {}",
                mapped, self.mapped_blocks_count
            )));
        }
        Ok(())
    }
}

fn number_field(root: &Element<'_>, name: &str) -> Result<u64> {
    let element = root
        .child(name)
        .ok_or_else(|| Error::format(format!("missing <{name}>")))?;
    parse_number(&element.text)
        .ok_or_else(|| Error::format(format!("<{name}> is not a non-negative integer")))
}

fn parse_number(text: &str) -> Option<u64> {
    text.trim().parse().ok()
}

fn parse_range(element: &Element<'_>, checksum_type: ChecksumType) -> Result<BlockRange> {
    let text = element.text.trim();
    let (from, to) = match text.split_once('-') {
        Some((from, to)) => (parse_number(from), parse_number(to)),
        None => (parse_number(text), parse_number(text)),
    };
    let (Some(from), Some(to)) = (from, to) else {
        return Err(Error::format(format!("invalid range '{text}'")));
    };
    if from > to {
        return Err(Error::format(format!("inverted range '{text}'")));
    }

    let checksum = element
        .attribute("chksum")
        .or_else(|| element.attribute(checksum_type.name()))
        .ok_or_else(|| Error::format(format!("range '{text}' has no checksum")))?;

    Ok(BlockRange {
        from,
        to,
        checksum: checksum.trim().to_ascii_lowercase(),
    })
}
