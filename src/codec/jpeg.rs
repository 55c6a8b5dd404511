//! JPEG decoding and stream handling.
//!
//! Two kinds of JPEG streams flow through this module:
//!
//! - **Abbreviated streams** (Aperio): per-tile JPEG data lacking the
//!   quantization (DQT) and Huffman (DHT) tables, which live once in the
//!   TIFF's `JPEGTables` tag and must be merged in before decoding.
//!
//! - **Monolithic mosaics** (Hamamatsu): one giant JPEG whose restart
//!   intervals act as tiles. A per-tile stream is synthesized from the
//!   file header plus one restart interval's entropy data, with the frame
//!   dimensions patched down to the tile size.
//!
//! # Merging Process
//!
//! 1. JPEGTables starts with SOI (FFD8) and ends with EOI (FFD9)
//! 2. Tile data also starts with SOI and ends with EOI
//! 3. To merge: strip EOI from tables, strip SOI from tile, concatenate
//!
//! Result: SOI + tables_content + tile_content + EOI

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use image::ImageReader;

use crate::error::SlideError;

// =============================================================================
// JPEG Markers
// =============================================================================

/// Start Of Image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End Of Image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Start Of Frame (baseline DCT) marker
pub const SOF0: [u8; 2] = [0xFF, 0xC0];

/// Start Of Frame (extended sequential DCT) marker
pub const SOF1: [u8; 2] = [0xFF, 0xC1];

/// Define Huffman Table marker
pub const DHT: [u8; 2] = [0xFF, 0xC4];

/// Define Quantization Table marker
pub const DQT: [u8; 2] = [0xFF, 0xDB];

/// Define Restart Interval marker
pub const DRI: [u8; 2] = [0xFF, 0xDD];

/// Start Of Scan marker
pub const SOS: [u8; 2] = [0xFF, 0xDA];

/// Check whether the second byte of a marker is a restart marker code
/// (`FF D0` through `FF D7`).
#[inline]
pub fn is_restart_code(byte: u8) -> bool {
    (0xD0..=0xD7).contains(&byte)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a complete JPEG stream to packed ARGB pixels, returning the
/// frame dimensions.
///
/// Only 3-component (color) images are accepted.
pub fn decode_jpeg_image(data: &[u8]) -> Result<(Vec<u32>, u32, u32), SlideError> {
    let decoded = ImageReader::with_format(Cursor::new(data), image::ImageFormat::Jpeg)
        .decode()
        .map_err(|e| SlideError::decode(format!("JPEG decode failed: {e}")))?;

    let rgb = match decoded {
        image::DynamicImage::ImageRgb8(img) => img,
        other => {
            return Err(SlideError::bad_data(format!(
                "expected 3-component JPEG, got {:?}",
                other.color()
            )))
        }
    };

    let (width, height) = (rgb.width(), rgb.height());
    let mut pixels = Vec::with_capacity((width as usize) * (height as usize));
    for chunk in rgb.as_raw().chunks_exact(3) {
        let (r, g, b) = (chunk[0] as u32, chunk[1] as u32, chunk[2] as u32);
        pixels.push(0xFF00_0000 | (r << 16) | (g << 8) | b);
    }

    Ok((pixels, width, height))
}

/// Decode a complete JPEG stream to packed ARGB pixels.
///
/// The decoded dimensions must match `expected_w` x `expected_h` exactly.
pub fn decode_jpeg(data: &[u8], expected_w: u32, expected_h: u32) -> Result<Vec<u32>, SlideError> {
    let (pixels, width, height) = decode_jpeg_image(data)?;

    if width != expected_w || height != expected_h {
        return Err(SlideError::bad_data(format!(
            "JPEG dimensions {width}x{height} do not match expected {expected_w}x{expected_h}"
        )));
    }

    Ok(pixels)
}

// =============================================================================
// Header Scanning
// =============================================================================

/// Structural facts about a JPEG stream, read from its header segments.
///
/// For mosaic JPEGs the restart interval defines the tile geometry: one
/// tile is `restart_interval` MCUs wide and one MCU row tall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegStreamInfo {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// MCU width in pixels (8 or 16, from the max horizontal sampling factor)
    pub mcu_width: u32,

    /// MCU height in pixels (8 or 16, from the max vertical sampling factor)
    pub mcu_height: u32,

    /// Restart interval in MCUs, 0 when no DRI segment is present
    pub restart_interval: u32,

    /// Offset of the first entropy-coded byte (just past the SOS segment)
    pub entropy_start: u64,
}

impl JpegStreamInfo {
    /// Scan header segments from the start of a JPEG stream.
    ///
    /// Returns `Ok(None)` when `bytes` ends before the Start-of-Scan segment
    /// (the caller should retry with a longer prefix), or `BadData` when the
    /// stream is not a JPEG or a frame header is malformed.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, SlideError> {
        if bytes.len() < 2 {
            return Ok(None);
        }
        if bytes[0..2] != SOI {
            return Err(SlideError::bad_data("missing JPEG start-of-image marker"));
        }

        let mut width = 0u32;
        let mut height = 0u32;
        let mut mcu_width = 8u32;
        let mut mcu_height = 8u32;
        let mut restart_interval = 0u32;

        let mut pos = 2usize;
        loop {
            if pos + 4 > bytes.len() {
                return Ok(None);
            }
            if bytes[pos] != 0xFF {
                return Err(SlideError::bad_data(format!(
                    "expected JPEG marker at offset {pos}"
                )));
            }
            let code = bytes[pos + 1];
            let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            if length < 2 {
                return Err(SlideError::bad_data("JPEG segment length below 2"));
            }
            let segment_end = pos + 2 + length;
            if segment_end > bytes.len() {
                return Ok(None);
            }
            let segment = &bytes[pos + 4..segment_end];

            match [0xFF, code] {
                SOF0 | SOF1 => {
                    if segment.len() < 6 {
                        return Err(SlideError::bad_data("truncated JPEG frame header"));
                    }
                    height = u16::from_be_bytes([segment[1], segment[2]]) as u32;
                    width = u16::from_be_bytes([segment[3], segment[4]]) as u32;

                    let components = segment[5] as usize;
                    if segment.len() < 6 + components * 3 {
                        return Err(SlideError::bad_data("truncated JPEG component list"));
                    }
                    let mut max_h = 1u32;
                    let mut max_v = 1u32;
                    for c in 0..components {
                        let sampling = segment[6 + c * 3 + 1];
                        max_h = max_h.max((sampling >> 4) as u32);
                        max_v = max_v.max((sampling & 0x0F) as u32);
                    }
                    mcu_width = max_h * 8;
                    mcu_height = max_v * 8;
                }
                DRI => {
                    if segment.len() < 2 {
                        return Err(SlideError::bad_data("truncated JPEG restart interval"));
                    }
                    restart_interval = u16::from_be_bytes([segment[0], segment[1]]) as u32;
                }
                SOS => {
                    if width == 0 || height == 0 {
                        return Err(SlideError::bad_data(
                            "JPEG start-of-scan before frame header",
                        ));
                    }
                    return Ok(Some(JpegStreamInfo {
                        width,
                        height,
                        mcu_width,
                        mcu_height,
                        restart_interval,
                        entropy_start: segment_end as u64,
                    }));
                }
                _ => {}
            }

            pos = segment_end;
        }
    }

    /// Frame width in whole MCUs.
    pub fn mcus_across(&self) -> u32 {
        self.width.div_ceil(self.mcu_width)
    }

    /// Frame height in whole MCUs.
    pub fn mcus_down(&self) -> u32 {
        self.height.div_ceil(self.mcu_height)
    }
}

// =============================================================================
// Tile Stream Synthesis
// =============================================================================

/// Build a standalone JPEG for one restart interval of a mosaic stream.
///
/// The synthesized stream is the original header (start-of-image through
/// the start-of-scan segment) with the frame dimensions patched to
/// `tile_w` x `tile_h` and the restart interval cleared, followed by the
/// interval's entropy bytes and a closing EOI. The patched header makes
/// the decoder stop after exactly one tile's worth of MCUs.
pub fn build_tile_stream(header: &[u8], entropy: &[u8], tile_w: u32, tile_h: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + entropy.len() + 2);
    out.extend_from_slice(header);
    patch_header_for_tile(&mut out, tile_w, tile_h);
    out.extend_from_slice(entropy);
    out.extend_from_slice(&EOI);
    out
}

/// Rewrite frame dimensions and clear the restart interval in place.
///
/// `stream` must start at SOI and contain the full header. Entropy data
/// past the SOS segment, if any, is left untouched.
fn patch_header_for_tile(stream: &mut [u8], tile_w: u32, tile_h: u32) {
    let mut pos = 2usize;
    while pos + 4 <= stream.len() {
        if stream[pos] != 0xFF {
            return;
        }
        let code = stream[pos + 1];
        let length = u16::from_be_bytes([stream[pos + 2], stream[pos + 3]]) as usize;
        let segment_end = pos + 2 + length;
        if length < 2 || segment_end > stream.len() {
            return;
        }

        match [0xFF, code] {
            SOF0 | SOF1 => {
                // height then width, both big-endian, after the precision byte
                let h = (tile_h as u16).to_be_bytes();
                let w = (tile_w as u16).to_be_bytes();
                stream[pos + 5..pos + 7].copy_from_slice(&h);
                stream[pos + 7..pos + 9].copy_from_slice(&w);
            }
            DRI => {
                stream[pos + 4] = 0;
                stream[pos + 5] = 0;
            }
            SOS => return,
            _ => {}
        }

        pos = segment_end;
    }
}

// =============================================================================
// JPEG Stream Analysis
// =============================================================================

/// Check if JPEG data is an abbreviated stream (missing tables).
///
/// An abbreviated stream starts with SOI (FFD8) but is immediately followed
/// by SOS (FFDA) without any DQT (FFDB) or DHT (FFC4) markers in between.
pub fn is_abbreviated_stream(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    if data[0..2] != SOI {
        return false;
    }

    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }

        let marker = [data[pos], data[pos + 1]];

        // If we find DQT or DHT, it's a full stream
        if marker == DQT || marker == DHT {
            return false;
        }

        // If we find SOS first (without DQT/DHT), it's abbreviated
        if marker == SOS {
            return true;
        }

        // Skip marker segment (marker + 2-byte length + data)
        if pos + 3 < data.len() && marker[1] != 0x00 && marker[1] != 0xD8 && marker[1] != 0xD9 {
            let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 2 + length;
        } else {
            pos += 2;
        }
    }

    // Didn't find SOS - inconclusive, treat as not abbreviated
    false
}

/// Check if JPEG data is a complete stream (has required tables).
///
/// A complete stream contains at least one DQT marker.
pub fn is_complete_stream(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    if data[0..2] != SOI {
        return false;
    }

    for i in 2..data.len().saturating_sub(1) {
        if data[i] == 0xFF && data[i + 1] == 0xDB {
            return true;
        }
    }

    false
}

// =============================================================================
// JPEG Tables Merging
// =============================================================================

/// Merge JPEGTables with abbreviated tile data.
///
/// This function combines the tables (containing DQT/DHT markers) with
/// the tile's compressed data to create a complete, decodable JPEG.
///
/// # Merge Algorithm
///
/// 1. Validate both inputs start with SOI
/// 2. Strip EOI from tables (if present)
/// 3. Strip SOI from tile data
/// 4. Concatenate: tables_content + tile_content
///
/// The result maintains proper JPEG structure: SOI + tables + scan data + EOI
pub fn merge_jpeg_tables(tables: &[u8], tile_data: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(tile_data);
    }
    if tile_data.is_empty() {
        return Bytes::new();
    }

    // Find where tables content ends (strip trailing EOI if present)
    let tables_end = if tables.len() >= 2 && tables[tables.len() - 2..] == EOI {
        tables.len() - 2
    } else {
        tables.len()
    };

    // Find where tile content starts (skip leading SOI if present)
    let tile_start = if tile_data.len() >= 2 && tile_data[0..2] == SOI {
        2
    } else {
        0
    };

    let total_size = tables_end + (tile_data.len() - tile_start);
    let mut result = BytesMut::with_capacity(total_size);

    result.extend_from_slice(&tables[..tables_end]);
    result.extend_from_slice(&tile_data[tile_start..]);

    result.freeze()
}

/// Prepare tile data for decoding, merging tables if needed.
///
/// Detects whether the tile data is abbreviated and merges tables if so.
pub fn prepare_tile_jpeg(tables: Option<&[u8]>, tile_data: &[u8]) -> Bytes {
    if is_complete_stream(tile_data) {
        return Bytes::copy_from_slice(tile_data);
    }

    if let Some(tables) = tables {
        if is_abbreviated_stream(tile_data) {
            return merge_jpeg_tables(tables, tile_data);
        }
    }

    Bytes::copy_from_slice(tile_data)
}

// =============================================================================
// Tests
// =============================================================================
