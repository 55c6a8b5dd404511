//! TIFF directory classification and tile location data.
//!
//! WSI files contain multiple IFDs, but not all are pyramid levels. Tiled
//! directories become resolution levels in chain order (scanners write them
//! from finest to coarsest); stripped directories are candidates for
//! associated images (thumbnail, label, macro).

use std::collections::HashSet;

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{Ifd, TiffHeader, BIGTIFF_HEADER_SIZE};
use super::tags::{Compression, TiffTag};
use super::values::ValueReader;

/// Maximum number of IFDs to parse (safety limit)
const MAX_IFDS: usize = 100;

// =============================================================================
// TiffLevel
// =============================================================================

/// One tiled directory: a single resolution level with its tile index.
///
/// All tile offsets and byte counts are loaded at parse time; a region read
/// then needs exactly one range request per tile.
#[derive(Debug, Clone)]
pub struct TiffLevel {
    /// Position of this level in the pyramid (0 = full resolution)
    pub level_index: usize,

    /// Index of the backing IFD in the file's IFD chain
    pub ifd_index: usize,

    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Tile width in pixels
    pub tile_width: u32,

    /// Tile height in pixels
    pub tile_height: u32,

    /// Number of tiles in X direction
    pub tiles_x: u32,

    /// Number of tiles in Y direction
    pub tiles_y: u32,

    /// Compression scheme of the tile payloads
    pub compression: Compression,

    /// Byte offset of each tile in the file, row-major
    pub tile_offsets: Vec<u64>,

    /// Byte count of each tile, row-major
    pub tile_byte_counts: Vec<u64>,

    /// JPEGTables data for abbreviated streams (if present)
    pub jpeg_tables: Option<Bytes>,

    /// Tiles with no payload, by row-major index
    pub missing: HashSet<u32>,

    /// The parsed IFD for this level
    pub ifd: Ifd,
}

impl TiffLevel {
    /// Load a level from a tiled IFD.
    ///
    /// Returns `Ok(None)` when the IFD lacks the required tile tags.
    async fn load<R: RangeReader>(
        reader: &R,
        header: &TiffHeader,
        ifd: Ifd,
        ifd_index: usize,
    ) -> Result<Option<Self>, TiffError> {
        let byte_order = header.byte_order;

        let (Some(tile_width), Some(tile_height)) =
            (ifd.tile_width(byte_order), ifd.tile_height(byte_order))
        else {
            return Ok(None);
        };
        let (Some(width), Some(height)) =
            (ifd.image_width(byte_order), ifd.image_height(byte_order))
        else {
            return Ok(None);
        };

        if tile_width == 0 || tile_height == 0 || width == 0 || height == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: "TileWidth",
                message: "zero image or tile dimension".to_string(),
            });
        }

        let compression_code = ifd.compression(byte_order).unwrap_or(7);
        let compression = Compression::from_u16(compression_code).ok_or_else(|| {
            TiffError::UnsupportedCompression(format!("code {compression_code}"))
        })?;

        let tiles_x = width.div_ceil(tile_width);
        let tiles_y = height.div_ceil(tile_height);
        let tile_count = (tiles_x as u64) * (tiles_y as u64);

        let values = ValueReader::new(reader, header);

        let offsets_entry = ifd
            .get_entry_by_tag(TiffTag::TileOffsets)
            .ok_or(TiffError::MissingTag("TileOffsets"))?;
        let counts_entry = ifd
            .get_entry_by_tag(TiffTag::TileByteCounts)
            .ok_or(TiffError::MissingTag("TileByteCounts"))?;

        let tile_offsets = values.read_u64_array(offsets_entry).await?;
        let tile_byte_counts = values.read_u64_array(counts_entry).await?;

        if tile_offsets.len() as u64 != tile_count || tile_byte_counts.len() as u64 != tile_count {
            return Err(TiffError::InvalidTagValue {
                tag: "TileOffsets",
                message: format!(
                    "expected {} tile records, got {} offsets and {} byte counts",
                    tile_count,
                    tile_offsets.len(),
                    tile_byte_counts.len()
                ),
            });
        }

        let jpeg_tables = match ifd.get_entry_by_tag(TiffTag::JpegTables) {
            Some(entry) => Some(values.read_raw_bytes(entry).await?),
            None => None,
        };

        let missing = tile_byte_counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(i, _)| i as u32)
            .collect();

        Ok(Some(TiffLevel {
            level_index: 0, // assigned when the pyramid is assembled
            ifd_index,
            width,
            height,
            tile_width,
            tile_height,
            tiles_x,
            tiles_y,
            compression,
            tile_offsets,
            tile_byte_counts,
            jpeg_tables,
            missing,
            ifd,
        }))
    }

    /// Row-major tile index for a tile coordinate, or `None` out of bounds.
    pub fn tile_index(&self, tile_x: u32, tile_y: u32) -> Option<u32> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            return None;
        }
        Some(tile_y * self.tiles_x + tile_x)
    }

    /// File location `(offset, byte_count)` of a tile's payload.
    pub fn tile_location(&self, tile_x: u32, tile_y: u32) -> Option<(u64, u64)> {
        let index = self.tile_index(tile_x, tile_y)? as usize;
        Some((self.tile_offsets[index], self.tile_byte_counts[index]))
    }

    /// Whether a tile has no payload.
    pub fn is_missing(&self, tile_x: u32, tile_y: u32) -> bool {
        match self.tile_index(tile_x, tile_y) {
            Some(index) => self.missing.contains(&index),
            None => true,
        }
    }

    /// Mark a tile missing.
    pub fn mark_missing(&mut self, tile_x: u32, tile_y: u32) {
        if let Some(index) = self.tile_index(tile_x, tile_y) {
            self.missing.insert(index);
        }
    }

    /// Pixel dimensions of a specific tile; edge tiles may be partial.
    pub fn tile_dimensions(&self, tile_x: u32, tile_y: u32) -> Option<(u32, u32)> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            return None;
        }

        let w = if tile_x == self.tiles_x - 1 {
            let remainder = self.width % self.tile_width;
            if remainder == 0 {
                self.tile_width
            } else {
                remainder
            }
        } else {
            self.tile_width
        };

        let h = if tile_y == self.tiles_y - 1 {
            let remainder = self.height % self.tile_height;
            if remainder == 0 {
                self.tile_height
            } else {
                remainder
            }
        } else {
            self.tile_height
        };

        Some((w, h))
    }
}

// =============================================================================
// StrippedIfd
// =============================================================================

/// A non-tiled directory: a candidate associated image.
#[derive(Debug, Clone)]
pub struct StrippedIfd {
    /// Index of the backing IFD in the file's IFD chain
    pub ifd_index: usize,

    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Compression scheme of the strip payloads
    pub compression: Compression,

    /// Rows covered by each strip
    pub rows_per_strip: u32,

    /// Byte offset of each strip
    pub strip_offsets: Vec<u64>,

    /// Byte count of each strip
    pub strip_byte_counts: Vec<u64>,

    /// JPEGTables data (if present)
    pub jpeg_tables: Option<Bytes>,

    /// The parsed IFD
    pub ifd: Ifd,
}

impl StrippedIfd {
    /// Load strip data from a non-tiled IFD.
    ///
    /// Returns `Ok(None)` when the IFD has no strip records or an
    /// unrecognized compression (such images are skipped, not fatal).
    async fn load<R: RangeReader>(
        reader: &R,
        header: &TiffHeader,
        ifd: Ifd,
        ifd_index: usize,
    ) -> Result<Option<Self>, TiffError> {
        let byte_order = header.byte_order;

        let (Some(width), Some(height)) =
            (ifd.image_width(byte_order), ifd.image_height(byte_order))
        else {
            return Ok(None);
        };

        let compression_code = ifd.compression(byte_order).unwrap_or(1);
        let Some(compression) = Compression::from_u16(compression_code) else {
            return Ok(None);
        };

        let (Some(offsets_entry), Some(counts_entry)) = (
            ifd.get_entry_by_tag(TiffTag::StripOffsets),
            ifd.get_entry_by_tag(TiffTag::StripByteCounts),
        ) else {
            return Ok(None);
        };

        let values = ValueReader::new(reader, header);
        let strip_offsets = values.read_u64_array(offsets_entry).await?;
        let strip_byte_counts = values.read_u64_array(counts_entry).await?;

        if strip_offsets.len() != strip_byte_counts.len() || strip_offsets.is_empty() {
            return Ok(None);
        }

        let rows_per_strip = match ifd.get_entry_by_tag(TiffTag::RowsPerStrip) {
            Some(entry) => values.read_u32(entry).await.unwrap_or(height),
            None => height,
        };

        let jpeg_tables = match ifd.get_entry_by_tag(TiffTag::JpegTables) {
            Some(entry) => Some(values.read_raw_bytes(entry).await?),
            None => None,
        };

        Ok(Some(StrippedIfd {
            ifd_index,
            width,
            height,
            compression,
            rows_per_strip,
            strip_offsets,
            strip_byte_counts,
            jpeg_tables,
            ifd,
        }))
    }
}

// =============================================================================
// TiffPyramid
// =============================================================================

/// A parsed TIFF slide: pyramid levels plus associated image candidates.
#[derive(Debug, Clone)]
pub struct TiffPyramid {
    /// The TIFF header
    pub header: TiffHeader,

    /// Pyramid levels in file chain order (0 = full resolution)
    pub levels: Vec<TiffLevel>,

    /// Non-tiled directories, in chain order
    pub stripped: Vec<StrippedIfd>,
}

impl TiffPyramid {
    /// Parse a TIFF file and classify its directories.
    ///
    /// Tiled IFDs become pyramid levels in chain order; scanners write the
    /// full-resolution image first and coarser levels after it. Whether the
    /// resulting dimensions actually decrease monotonically is validated by
    /// the open dispatcher when downsamples are computed.
    pub async fn parse<R: RangeReader>(reader: &R) -> Result<Self, TiffError> {
        let header_bytes = reader.read_exact_at(0, BIGTIFF_HEADER_SIZE).await?;
        let header = TiffHeader::parse(&header_bytes, reader.size())?;

        let ifds = Self::parse_all_ifds(reader, &header).await?;

        let mut levels = Vec::new();
        let mut stripped = Vec::new();

        for (ifd_index, ifd) in ifds.into_iter().enumerate() {
            if ifd.is_tiled() {
                if let Some(mut level) = TiffLevel::load(reader, &header, ifd, ifd_index).await? {
                    level.level_index = levels.len();
                    levels.push(level);
                }
            } else if let Some(image) = StrippedIfd::load(reader, &header, ifd, ifd_index).await? {
                stripped.push(image);
            }
        }

        Ok(TiffPyramid {
            header,
            levels,
            stripped,
        })
    }

    /// Parse all IFDs in the file following the next-IFD chain.
    async fn parse_all_ifds<R: RangeReader>(
        reader: &R,
        header: &TiffHeader,
    ) -> Result<Vec<Ifd>, TiffError> {
        let mut ifds = Vec::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 && ifds.len() < MAX_IFDS {
            if offset >= reader.size() {
                return Err(TiffError::InvalidIfdOffset(offset));
            }

            let count_size = header.ifd_count_size();
            let count_bytes = reader.read_exact_at(offset, count_size).await?;

            let entry_count = if header.is_bigtiff {
                header.byte_order.read_u64(&count_bytes)
            } else {
                header.byte_order.read_u16(&count_bytes) as u64
            };

            let ifd_size = Ifd::calculate_size(entry_count, header);
            let ifd_bytes = reader.read_exact_at(offset, ifd_size).await?;
            let ifd = Ifd::parse(&ifd_bytes, header)?;

            let next_offset = ifd.next_ifd_offset;
            ifds.push(ifd);

            offset = next_offset;
        }

        Ok(ifds)
    }

    /// Get the number of pyramid levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Dimensions of the full-resolution level.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.levels.first().map(|l| (l.width, l.height))
    }
}

// =============================================================================
// Tests
// =============================================================================
