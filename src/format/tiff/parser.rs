//! TIFF header and IFD structure parsing.
//!
//! This module handles parsing of TIFF and BigTIFF file headers and the
//! Image File Directories (IFDs) they chain together. Everything else in
//! the TIFF path builds on these structures.
//!
//! # TIFF Header Structure
//!
//! ## Classic TIFF (8 bytes)
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! ## BigTIFF (16 bytes)
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (43 = 0x002B)
//! Bytes 4-5: Offset byte size (must be 8)
//! Bytes 6-7: Reserved (must be 0)
//! Bytes 8-15: Offset to first IFD (8 bytes)
//! ```

use crate::error::TiffError;
use crate::io::{read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le};

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
const VERSION_TIFF: u16 = 42;

/// Version number for BigTIFF
const VERSION_BIGTIFF: u16 = 43;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of BigTIFF header in bytes
pub const BIGTIFF_HEADER_SIZE: usize = 16;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
///
/// TIFF files declare their byte order in the first two bytes of the header.
/// All multi-byte values in the file must be read respecting this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from a byte slice using this byte order.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    /// Read a u32 from a byte slice using this byte order.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    /// Read a u64 from a byte slice using this byte order.
    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrder::LittleEndian => read_u64_le(bytes),
            ByteOrder::BigEndian => read_u64_be(bytes),
        }
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed TIFF file header.
///
/// Contains the essential information needed to begin parsing IFDs:
/// - Byte order for reading all subsequent values
/// - Whether this is classic TIFF or BigTIFF (affects entry sizes and offset widths)
/// - Location of the first IFD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Whether this is a BigTIFF file (64-bit offsets)
    pub is_bigtiff: bool,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from raw bytes.
    ///
    /// The input must contain at least 8 bytes for classic TIFF or 16 bytes
    /// for BigTIFF.
    ///
    /// # Errors
    /// - `InvalidMagic` if byte order bytes are not II or MM
    /// - `InvalidVersion` if version is not 42 or 43
    /// - `InvalidBigTiffOffsetSize` if BigTIFF offset size is not 8
    /// - `FileTooSmall` if there aren't enough bytes for the header
    /// - `InvalidIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        // The byte-order mark is a fixed byte pattern, read order-independent
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);

        match version {
            VERSION_TIFF => {
                let first_ifd_offset = byte_order.read_u32(&bytes[4..8]) as u64;
                if first_ifd_offset >= file_size {
                    return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
                }

                Ok(TiffHeader {
                    byte_order,
                    is_bigtiff: false,
                    first_ifd_offset,
                })
            }
            VERSION_BIGTIFF => {
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(TiffError::FileTooSmall {
                        required: BIGTIFF_HEADER_SIZE as u64,
                        actual: bytes.len() as u64,
                    });
                }

                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::InvalidBigTiffOffsetSize(offset_size));
                }

                let first_ifd_offset = byte_order.read_u64(&bytes[8..16]);
                if first_ifd_offset >= file_size {
                    return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
                }

                Ok(TiffHeader {
                    byte_order,
                    is_bigtiff: true,
                    first_ifd_offset,
                })
            }
            _ => Err(TiffError::InvalidVersion(version)),
        }
    }

    /// Size of an IFD entry in bytes.
    ///
    /// Classic TIFF: 12 bytes (2 tag + 2 type + 4 count + 4 value/offset)
    /// BigTIFF: 20 bytes (2 tag + 2 type + 8 count + 8 value/offset)
    #[inline]
    pub const fn ifd_entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    /// Size of the entry count field at the start of an IFD.
    #[inline]
    pub const fn ifd_count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    /// Size of the next IFD offset field at the end of an IFD.
    #[inline]
    pub const fn ifd_next_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }

    /// Size of the value/offset field in an IFD entry.
    ///
    /// This determines the inline value threshold.
    #[inline]
    pub const fn value_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// A single entry in an Image File Directory.
///
/// Each entry describes one tag: its field type, how many values it holds,
/// and either the values themselves (inline) or the file offset where they
/// are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    /// Numeric tag ID
    pub tag_id: u16,

    /// Decoded field type, `None` when the type code is unknown
    pub field_type: Option<FieldType>,

    /// Raw field type code as stored in the file
    pub field_type_raw: u16,

    /// Number of values of `field_type`
    pub count: u64,

    /// Raw bytes of the value/offset field (4 bytes classic, 8 bytes BigTIFF)
    pub value_offset_bytes: Vec<u8>,

    /// Whether the value is stored inline in `value_offset_bytes`
    pub is_inline: bool,
}

impl IfdEntry {
    /// Parse one IFD entry from its raw bytes.
    fn parse(bytes: &[u8], header: &TiffHeader) -> Self {
        let byte_order = header.byte_order;

        let tag_id = byte_order.read_u16(&bytes[0..2]);
        let field_type_raw = byte_order.read_u16(&bytes[2..4]);
        let field_type = FieldType::from_u16(field_type_raw);

        let (count, value_offset_bytes) = if header.is_bigtiff {
            (
                byte_order.read_u64(&bytes[4..12]),
                bytes[12..20].to_vec(),
            )
        } else {
            (
                byte_order.read_u32(&bytes[4..8]) as u64,
                bytes[8..12].to_vec(),
            )
        };

        let is_inline = field_type
            .map(|ft| ft.fits_inline(count, header.is_bigtiff))
            .unwrap_or(false);

        IfdEntry {
            tag_id,
            field_type,
            field_type_raw,
            count,
            value_offset_bytes,
            is_inline,
        }
    }

    /// Total byte size of this entry's value.
    ///
    /// Returns `None` when the field type is unknown.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type
            .map(|ft| ft.size_in_bytes() as u64 * self.count)
    }

    /// File offset of the value, for entries stored out of line.
    pub fn value_offset(&self, byte_order: ByteOrder) -> u64 {
        if self.value_offset_bytes.len() == 8 {
            byte_order.read_u64(&self.value_offset_bytes)
        } else {
            byte_order.read_u32(&self.value_offset_bytes) as u64
        }
    }

    /// Read a single inline u32 value, when the entry is inline with count 1.
    ///
    /// Handles Short and Long field types.
    pub fn inline_u32(&self, byte_order: ByteOrder) -> Option<u32> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes) as u32),
            FieldType::Long => Some(byte_order.read_u32(&self.value_offset_bytes)),
            _ => None,
        }
    }

    /// Read a single inline u64 value, when the entry is inline with count 1.
    ///
    /// Handles Short, Long, and Long8 field types.
    pub fn inline_u64(&self, byte_order: ByteOrder) -> Option<u64> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes) as u64),
            FieldType::Long => Some(byte_order.read_u32(&self.value_offset_bytes) as u64),
            FieldType::Long8 => Some(byte_order.read_u64(&self.value_offset_bytes)),
            _ => None,
        }
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
///
/// An IFD is a list of tag entries plus the offset of the next IFD in the
/// chain (0 when this is the last one).
#[derive(Debug, Clone)]
pub struct Ifd {
    /// Entries in file order (TIFF requires ascending tag IDs, but this is
    /// not enforced here)
    pub entries: Vec<IfdEntry>,

    /// Offset of the next IFD in the chain, 0 if none
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// Total byte size of an IFD with `entry_count` entries, including the
    /// count field and the next-IFD offset.
    pub fn calculate_size(entry_count: u64, header: &TiffHeader) -> usize {
        header.ifd_count_size()
            + entry_count as usize * header.ifd_entry_size()
            + header.ifd_next_offset_size()
    }

    /// Parse an IFD from raw bytes starting at the entry count field.
    ///
    /// `bytes` must span the whole IFD, as computed by [`Ifd::calculate_size`].
    pub fn parse(bytes: &[u8], header: &TiffHeader) -> Result<Self, TiffError> {
        let byte_order = header.byte_order;
        let count_size = header.ifd_count_size();

        if bytes.len() < count_size {
            return Err(TiffError::FileTooSmall {
                required: count_size as u64,
                actual: bytes.len() as u64,
            });
        }

        let entry_count = if header.is_bigtiff {
            byte_order.read_u64(&bytes[0..8])
        } else {
            byte_order.read_u16(&bytes[0..2]) as u64
        };

        let expected = Self::calculate_size(entry_count, header);
        if bytes.len() < expected {
            return Err(TiffError::FileTooSmall {
                required: expected as u64,
                actual: bytes.len() as u64,
            });
        }

        let entry_size = header.ifd_entry_size();
        let mut entries = Vec::with_capacity(entry_count as usize);
        for i in 0..entry_count as usize {
            let start = count_size + i * entry_size;
            entries.push(IfdEntry::parse(&bytes[start..start + entry_size], header));
        }

        let next_start = count_size + entry_count as usize * entry_size;
        let next_ifd_offset = if header.is_bigtiff {
            byte_order.read_u64(&bytes[next_start..next_start + 8])
        } else {
            byte_order.read_u32(&bytes[next_start..next_start + 4]) as u64
        };

        Ok(Ifd {
            entries,
            next_ifd_offset,
        })
    }

    /// Find an entry by tag.
    pub fn get_entry_by_tag(&self, tag: TiffTag) -> Option<&IfdEntry> {
        let id = tag.as_u16();
        self.entries.iter().find(|e| e.tag_id == id)
    }

    /// Whether this IFD describes a tiled image.
    pub fn is_tiled(&self) -> bool {
        self.get_entry_by_tag(TiffTag::TileWidth).is_some()
            && self.get_entry_by_tag(TiffTag::TileLength).is_some()
    }

    /// Inline u32 value of a tag, if present and inline.
    fn tag_u32(&self, tag: TiffTag, byte_order: ByteOrder) -> Option<u32> {
        self.get_entry_by_tag(tag)?.inline_u32(byte_order)
    }

    /// Image width in pixels.
    pub fn image_width(&self, byte_order: ByteOrder) -> Option<u32> {
        self.tag_u32(TiffTag::ImageWidth, byte_order)
    }

    /// Image height in pixels.
    pub fn image_height(&self, byte_order: ByteOrder) -> Option<u32> {
        self.tag_u32(TiffTag::ImageLength, byte_order)
    }

    /// Tile width in pixels.
    pub fn tile_width(&self, byte_order: ByteOrder) -> Option<u32> {
        self.tag_u32(TiffTag::TileWidth, byte_order)
    }

    /// Tile height in pixels.
    pub fn tile_height(&self, byte_order: ByteOrder) -> Option<u32> {
        self.tag_u32(TiffTag::TileLength, byte_order)
    }

    /// Compression scheme code.
    pub fn compression(&self, byte_order: ByteOrder) -> Option<u16> {
        self.tag_u32(TiffTag::Compression, byte_order)
            .map(|v| v as u16)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // TiffHeader parsing
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_tiff_little_endian() {
        let header = [
            0x49, 0x49, // II (little-endian)
            0x2A, 0x00, // Version 42
            0x08, 0x00, 0x00, 0x00, // First IFD offset = 8
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::LittleEndian);
        assert!(!result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_tiff_big_endian() {
        let header = [
            0x4D, 0x4D, // MM (big-endian)
            0x00, 0x2A, // Version 42
            0x00, 0x00, 0x00, 0x08, // First IFD offset = 8
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::BigEndian);
        assert!(!result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_bigtiff() {
        let header = [
            0x49, 0x49, // II
            0x2B, 0x00, // Version 43 (BigTIFF)
            0x08, 0x00, // Offset size = 8
            0x00, 0x00, // Reserved
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // First IFD offset = 16
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert!(result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 16);
    }

    #[test]
    fn test_parse_invalid_magic() {
        let header = [0x00, 0x00, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00];
        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::InvalidMagic(0x0000))));
    }

    #[test]
    fn test_parse_invalid_version() {
        let header = [0x49, 0x49, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00];
        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::InvalidVersion(0))));
    }

    #[test]
    fn test_parse_bigtiff_invalid_offset_size() {
        let header = [
            0x49, 0x49, 0x2B, 0x00, // BigTIFF
            0x04, 0x00, // Invalid offset size = 4
            0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::InvalidBigTiffOffsetSize(4))));
    }

    #[test]
    fn test_parse_ifd_offset_beyond_file() {
        let header = [
            0x49, 0x49, 0x2A, 0x00, //
            0xE8, 0x03, 0x00, 0x00, // First IFD offset = 1000
        ];
        let result = TiffHeader::parse(&header, 500);
        assert!(matches!(result, Err(TiffError::InvalidIfdOffset(1000))));
    }

    #[test]
    fn test_header_field_sizes() {
        let tiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        };
        assert_eq!(tiff.ifd_entry_size(), 12);
        assert_eq!(tiff.ifd_count_size(), 2);
        assert_eq!(tiff.value_offset_size(), 4);

        let bigtiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: true,
            first_ifd_offset: 16,
        };
        assert_eq!(bigtiff.ifd_entry_size(), 20);
        assert_eq!(bigtiff.ifd_count_size(), 8);
        assert_eq!(bigtiff.value_offset_size(), 8);
    }

    // -------------------------------------------------------------------------
    // Ifd parsing
    // -------------------------------------------------------------------------

    fn le_header() -> TiffHeader {
        TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        }
    }

    /// Build a classic little-endian IFD with the given (tag, type, count,
    /// value bytes) entries.
    fn build_ifd(entries: &[(u16, u16, u32, [u8; 4])], next: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (tag, ftype, count, value) in entries {
            bytes.extend_from_slice(&tag.to_le_bytes());
            bytes.extend_from_slice(&ftype.to_le_bytes());
            bytes.extend_from_slice(&count.to_le_bytes());
            bytes.extend_from_slice(value);
        }
        bytes.extend_from_slice(&next.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_ifd_entries() {
        // ImageWidth = 4096, ImageLength = 2048
        let bytes = build_ifd(
            &[
                (256, 4, 1, 4096u32.to_le_bytes()),
                (257, 4, 1, 2048u32.to_le_bytes()),
            ],
            0,
        );

        let header = le_header();
        let ifd = Ifd::parse(&bytes, &header).unwrap();
        assert_eq!(ifd.entries.len(), 2);
        assert_eq!(ifd.next_ifd_offset, 0);
        assert_eq!(ifd.image_width(header.byte_order), Some(4096));
        assert_eq!(ifd.image_height(header.byte_order), Some(2048));
    }

    #[test]
    fn test_parse_ifd_next_offset() {
        let bytes = build_ifd(&[(256, 4, 1, 64u32.to_le_bytes())], 0x500);
        let ifd = Ifd::parse(&bytes, &le_header()).unwrap();
        assert_eq!(ifd.next_ifd_offset, 0x500);
    }

    #[test]
    fn test_parse_ifd_truncated() {
        let bytes = build_ifd(&[(256, 4, 1, 64u32.to_le_bytes())], 0);
        let result = Ifd::parse(&bytes[..6], &le_header());
        assert!(matches!(result, Err(TiffError::FileTooSmall { .. })));
    }

    #[test]
    fn test_ifd_is_tiled() {
        let header = le_header();

        let tiled = build_ifd(
            &[
                (322, 4, 1, 256u32.to_le_bytes()),
                (323, 4, 1, 256u32.to_le_bytes()),
            ],
            0,
        );
        assert!(Ifd::parse(&tiled, &header).unwrap().is_tiled());

        let stripped = build_ifd(&[(278, 4, 1, 16u32.to_le_bytes())], 0);
        assert!(!Ifd::parse(&stripped, &header).unwrap().is_tiled());
    }

    #[test]
    fn test_entry_inline_short() {
        // SHORT count 1: value in first two bytes of the value field
        let bytes = build_ifd(&[(259, 3, 1, [0x07, 0x00, 0x00, 0x00])], 0);
        let ifd = Ifd::parse(&bytes, &le_header()).unwrap();
        assert_eq!(ifd.compression(ByteOrder::LittleEndian), Some(7));
    }

    #[test]
    fn test_entry_offset_value() {
        // 8 LONG values cannot be inline in classic TIFF
        let bytes = build_ifd(&[(324, 4, 8, 0x1000u32.to_le_bytes())], 0);
        let ifd = Ifd::parse(&bytes, &le_header()).unwrap();
        let entry = ifd.get_entry_by_tag(TiffTag::TileOffsets).unwrap();
        assert!(!entry.is_inline);
        assert_eq!(entry.value_offset(ByteOrder::LittleEndian), 0x1000);
        assert_eq!(entry.value_byte_size(), Some(32));
    }

    #[test]
    fn test_entry_unknown_field_type() {
        let bytes = build_ifd(&[(256, 99, 1, [0; 4])], 0);
        let ifd = Ifd::parse(&bytes, &le_header()).unwrap();
        let entry = &ifd.entries[0];
        assert!(entry.field_type.is_none());
        assert_eq!(entry.field_type_raw, 99);
        assert!(entry.value_byte_size().is_none());
    }
}
