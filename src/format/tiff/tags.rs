//! TIFF tag and field type definitions.
//!
//! This module defines the vocabulary for TIFF parsing, including:
//! - Field types that determine how values are encoded
//! - Tag IDs that identify metadata fields
//! - Compression scheme codes, including the vendor JPEG 2000 codes
//!
//! The definitions support both classic TIFF and BigTIFF formats.

// =============================================================================
// TIFF Field Types
// =============================================================================

/// TIFF field types that determine how values are encoded.
///
/// Each field type has a specific size in bytes, which is critical for:
/// - Determining if a value fits inline in an IFD entry
/// - Reading arrays of values correctly
///
/// Note: We only define types actually used in WSI files. TIFF supports
/// additional types (SBYTE, FLOAT, etc.) that are not needed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    /// Unsigned 8-bit integer (1 byte)
    Byte = 1,

    /// 8-bit ASCII character (1 byte)
    Ascii = 2,

    /// Unsigned 16-bit integer (2 bytes)
    Short = 3,

    /// Unsigned 32-bit integer (4 bytes)
    Long = 4,

    /// Unsigned rational: two u32 values, numerator then denominator (8 bytes)
    Rational = 5,

    /// Undefined byte data (1 byte per element)
    Undefined = 7,

    /// Unsigned 64-bit integer (8 bytes) - BigTIFF only
    Long8 = 16,
}

impl FieldType {
    /// Size of a single value of this type in bytes.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            FieldType::Byte => 1,
            FieldType::Ascii => 1,
            FieldType::Short => 2,
            FieldType::Long => 4,
            FieldType::Rational => 8,
            FieldType::Undefined => 1,
            FieldType::Long8 => 8,
        }
    }

    /// Create a FieldType from its numeric value.
    ///
    /// Returns `None` for unsupported or unknown type values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FieldType::Byte),
            2 => Some(FieldType::Ascii),
            3 => Some(FieldType::Short),
            4 => Some(FieldType::Long),
            5 => Some(FieldType::Rational),
            7 => Some(FieldType::Undefined),
            16 => Some(FieldType::Long8),
            _ => None,
        }
    }

    /// Maximum bytes that can be stored inline in a classic TIFF IFD entry.
    pub const INLINE_THRESHOLD_TIFF: usize = 4;

    /// Maximum bytes that can be stored inline in a BigTIFF IFD entry.
    pub const INLINE_THRESHOLD_BIGTIFF: usize = 8;

    /// Check if a value with this type and count fits inline in a TIFF entry.
    #[inline]
    pub fn fits_inline(self, count: u64, is_bigtiff: bool) -> bool {
        let total_size = self.size_in_bytes() as u64 * count;
        let threshold = if is_bigtiff {
            Self::INLINE_THRESHOLD_BIGTIFF as u64
        } else {
            Self::INLINE_THRESHOLD_TIFF as u64
        };
        total_size <= threshold
    }
}

// =============================================================================
// TIFF Tags
// =============================================================================

/// TIFF tag IDs relevant to WSI parsing.
///
/// Tags are 16-bit identifiers that describe the type of metadata in an IFD
/// entry. We define only the tags needed for:
/// - Basic image structure (dimensions, organization)
/// - Tile and strip access (offsets, byte counts, sizes)
/// - Compression and JPEG handling
/// - Vendor metadata (ImageDescription, Software)
///
/// Tags not listed here are ignored during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TiffTag {
    // -------------------------------------------------------------------------
    // Basic Image Structure
    // -------------------------------------------------------------------------
    /// Image width in pixels
    ImageWidth = 256,

    /// Image height (length) in pixels
    ImageLength = 257,

    /// Bits per sample (typically 8)
    BitsPerSample = 258,

    /// Compression scheme used
    Compression = 259,

    /// Photometric interpretation (RGB, YCbCr, etc.)
    PhotometricInterpretation = 262,

    /// Description string (vendor metadata lives here)
    ImageDescription = 270,

    /// Number of components per pixel (e.g., 3 for RGB)
    SamplesPerPixel = 277,

    /// How components are organized (chunky vs planar)
    PlanarConfiguration = 284,

    /// Software that produced the file (vendor marker for some scanners)
    Software = 305,

    // -------------------------------------------------------------------------
    // Strip Organization (associated images)
    // -------------------------------------------------------------------------
    /// Row count per strip
    RowsPerStrip = 278,

    /// Byte offsets of strips
    StripOffsets = 273,

    /// Byte counts of strips
    StripByteCounts = 279,

    // -------------------------------------------------------------------------
    // Tile Organization (pyramid levels)
    // -------------------------------------------------------------------------
    /// Width of each tile in pixels
    TileWidth = 322,

    /// Height (length) of each tile in pixels
    TileLength = 323,

    /// Byte offsets of each tile in the file
    TileOffsets = 324,

    /// Byte counts of each tile
    TileByteCounts = 325,

    // -------------------------------------------------------------------------
    // JPEG Handling
    // -------------------------------------------------------------------------
    /// JPEG quantization and Huffman tables for abbreviated streams
    ///
    /// Aperio files store incomplete JPEG streams per tile; the tables from
    /// this tag must be merged with tile data before decoding.
    JpegTables = 347,

    /// YCbCr subsampling factors
    YCbCrSubSampling = 530,

    // -------------------------------------------------------------------------
    // Resolution (optional metadata)
    // -------------------------------------------------------------------------
    /// Pixels per unit in X direction
    XResolution = 282,

    /// Pixels per unit in Y direction
    YResolution = 283,

    /// Unit of resolution (1=none, 2=inch, 3=centimeter)
    ResolutionUnit = 296,
}

impl TiffTag {
    /// Create a TiffTag from its numeric value.
    ///
    /// Returns `None` for unrecognized tags. Unknown tags are not an error;
    /// they are simply ignored during parsing.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            256 => Some(TiffTag::ImageWidth),
            257 => Some(TiffTag::ImageLength),
            258 => Some(TiffTag::BitsPerSample),
            259 => Some(TiffTag::Compression),
            262 => Some(TiffTag::PhotometricInterpretation),
            270 => Some(TiffTag::ImageDescription),
            273 => Some(TiffTag::StripOffsets),
            277 => Some(TiffTag::SamplesPerPixel),
            278 => Some(TiffTag::RowsPerStrip),
            279 => Some(TiffTag::StripByteCounts),
            282 => Some(TiffTag::XResolution),
            283 => Some(TiffTag::YResolution),
            284 => Some(TiffTag::PlanarConfiguration),
            296 => Some(TiffTag::ResolutionUnit),
            305 => Some(TiffTag::Software),
            322 => Some(TiffTag::TileWidth),
            323 => Some(TiffTag::TileLength),
            324 => Some(TiffTag::TileOffsets),
            325 => Some(TiffTag::TileByteCounts),
            347 => Some(TiffTag::JpegTables),
            530 => Some(TiffTag::YCbCrSubSampling),
            _ => None,
        }
    }

    /// Get the numeric tag ID.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Compression Values
// =============================================================================

/// TIFF compression scheme identifiers.
///
/// The tile path supports JPEG (7) and the Aperio JPEG 2000 codes (33003
/// YCbCr, 33005 RGB). Uncompressed strips (1) are accepted for associated
/// images only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Compression {
    /// No compression
    None = 1,

    /// LZW compression (not supported)
    Lzw = 5,

    /// "Old-style" JPEG (not supported, rarely used)
    OldJpeg = 6,

    /// JPEG compression (supported)
    Jpeg = 7,

    /// Deflate/zlib compression (not supported)
    Deflate = 8,

    /// Adobe Deflate (not supported)
    AdobeDeflate = 32946,

    /// Aperio JPEG 2000, YCbCr color space (supported)
    Jp2kYcbcr = 33003,

    /// Aperio JPEG 2000, RGB color space (supported)
    Jp2kRgb = 33005,
}

impl Compression {
    /// Create a Compression from its numeric value.
    ///
    /// Returns `None` for unrecognized compression values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Compression::None),
            5 => Some(Compression::Lzw),
            6 => Some(Compression::OldJpeg),
            7 => Some(Compression::Jpeg),
            8 => Some(Compression::Deflate),
            32946 => Some(Compression::AdobeDeflate),
            33003 => Some(Compression::Jp2kYcbcr),
            33005 => Some(Compression::Jp2kRgb),
            _ => None,
        }
    }

    /// Check if this compression scheme is supported for pyramid tiles.
    #[inline]
    pub const fn is_supported(self) -> bool {
        matches!(
            self,
            Compression::Jpeg | Compression::Jp2kYcbcr | Compression::Jp2kRgb
        )
    }

    /// Get a human-readable name for the compression scheme.
    pub const fn name(self) -> &'static str {
        match self {
            Compression::None => "None",
            Compression::Lzw => "LZW",
            Compression::OldJpeg => "Old JPEG",
            Compression::Jpeg => "JPEG",
            Compression::Deflate => "Deflate",
            Compression::AdobeDeflate => "Adobe Deflate",
            Compression::Jp2kYcbcr => "JPEG 2000 (YCbCr)",
            Compression::Jp2kRgb => "JPEG 2000 (RGB)",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
