//! Container format parsing.
//!
//! Structure parsers for the supported slide containers: TIFF/BigTIFF
//! directories, Hamamatsu key files, and InteMedic metadata. The
//! [`SlideFormat`] enum names the formats the open dispatcher can bind a
//! file to; the actual probe/open logic lives with each backend in
//! [`crate::slide`].

pub mod tiff;
pub mod tron;
pub mod vms;

use tiff::{ByteOrder, TIFF_HEADER_SIZE};

// =============================================================================
// SlideFormat
// =============================================================================

/// Detected slide format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideFormat {
    /// Aperio SVS (TIFF-based, JPEG or JPEG 2000 tiles, JPEGTables streams)
    AperioSvs,

    /// Trestle (TIFF-based, tile overlaps declared in metadata)
    Trestle,

    /// Generic pyramidal TIFF (standard tiled TIFF with multiple resolutions)
    GenericTiff,

    /// Hamamatsu VMS (JPEG mosaic indexed by a key file)
    HamamatsuVms,

    /// InteMedic .tron (Zip64 container with encrypted metadata)
    IntemedicTron,
}

impl SlideFormat {
    /// Get a human-readable name for the format.
    pub const fn name(&self) -> &'static str {
        match self {
            SlideFormat::AperioSvs => "Aperio SVS",
            SlideFormat::Trestle => "Trestle TIFF",
            SlideFormat::GenericTiff => "Generic Pyramidal TIFF",
            SlideFormat::HamamatsuVms => "Hamamatsu VMS",
            SlideFormat::IntemedicTron => "InteMedic Tron",
        }
    }

    /// Value of the `openslide.vendor` property for this format.
    pub const fn vendor(&self) -> &'static str {
        match self {
            SlideFormat::AperioSvs => "aperio",
            SlideFormat::Trestle => "trestle",
            SlideFormat::GenericTiff => "generic-tiff",
            SlideFormat::HamamatsuVms => "hamamatsu",
            SlideFormat::IntemedicTron => "intemedic",
        }
    }
}

// =============================================================================
// Magic sniffing
// =============================================================================

/// Check if bytes begin with a valid TIFF or BigTIFF header.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < TIFF_HEADER_SIZE {
        return false;
    }

    let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
    if magic != 0x4949 && magic != 0x4D4D {
        return false;
    }

    let byte_order = if magic == 0x4949 {
        ByteOrder::LittleEndian
    } else {
        ByteOrder::BigEndian
    };

    let version = byte_order.read_u16(&bytes[2..4]);
    version == 42 || version == 43
}

/// Check if bytes begin with a ZIP local-file-header signature.
pub fn is_zip_header(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == [0x50, 0x4B, 0x03, 0x04]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_tiff_header_classic() {
        let le = [0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00];
        let be = [0x4D, 0x4D, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x08];
        assert!(is_tiff_header(&le));
        assert!(is_tiff_header(&be));
    }

    #[test]
    fn test_is_tiff_header_bigtiff() {
        let header = [
            0x49, 0x49, 0x2B, 0x00, 0x08, 0x00, 0x00, 0x00, //
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert!(is_tiff_header(&header));
    }

    #[test]
    fn test_is_tiff_header_rejects() {
        // JPEG magic
        assert!(!is_tiff_header(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46]));
        // PNG magic
        assert!(!is_tiff_header(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]));
        // Bad version
        assert!(!is_tiff_header(&[0x49, 0x49, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00]));
        // Too short
        assert!(!is_tiff_header(&[0x49, 0x49, 0x2A, 0x00]));
    }

    #[test]
    fn test_is_zip_header() {
        assert!(is_zip_header(b"PK\x03\x04rest"));
        assert!(!is_zip_header(b"PK\x05\x06"));
        assert!(!is_zip_header(b"PK"));
    }

    #[test]
    fn test_format_names_and_vendors() {
        assert_eq!(SlideFormat::AperioSvs.name(), "Aperio SVS");
        assert_eq!(SlideFormat::AperioSvs.vendor(), "aperio");
        assert_eq!(SlideFormat::HamamatsuVms.vendor(), "hamamatsu");
        assert_eq!(SlideFormat::IntemedicTron.vendor(), "intemedic");
        assert_eq!(SlideFormat::GenericTiff.vendor(), "generic-tiff");
        assert_eq!(SlideFormat::Trestle.vendor(), "trestle");
    }
}
