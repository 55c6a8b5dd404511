//! InteMedic `.tron` container metadata.
//!
//! The container is a Zip64 archive; its `.tron` entry holds an encrypted
//! JSON document (see [`crate::codec::crypto`]) describing the pyramid:
//! level count, per-level tile grid, tile size, and display hints like the
//! background color. Tile entries are named
//! `{level}\0\{row}\{col}.jpg` with either path separator; the constant
//! middle segment is the focal plane (only plane 0 is written).

use serde::Deserialize;

use crate::error::SlideError;

/// Decrypted metadata document.
#[derive(Debug, Clone, Deserialize)]
pub struct TronMetadata {
    /// Number of pyramid levels
    #[serde(rename = "LevelCount")]
    pub level_count: u32,

    /// Tile width in pixels, shared by all levels
    #[serde(rename = "TileWidth")]
    pub tile_width: u32,

    /// Tile height in pixels, shared by all levels
    #[serde(rename = "TileHeight")]
    pub tile_height: u32,

    /// Per-level geometry, finest first
    #[serde(rename = "Levels")]
    pub levels: Vec<TronLevelInfo>,

    /// Background color as decimal "R, G, B"
    #[serde(rename = "BackgroundColor", default)]
    pub background_color: Option<String>,

    /// Microns per pixel at level 0
    #[serde(rename = "MppX", default)]
    pub mpp_x: Option<f64>,

    #[serde(rename = "MppY", default)]
    pub mpp_y: Option<f64>,

    /// Objective lens power
    #[serde(rename = "ScanObjective", default)]
    pub objective: Option<f64>,
}

/// Geometry of one pyramid level.
#[derive(Debug, Clone, Deserialize)]
pub struct TronLevelInfo {
    /// Level width in pixels
    #[serde(rename = "Width")]
    pub width: u32,

    /// Level height in pixels
    #[serde(rename = "Height")]
    pub height: u32,

    /// Tile columns
    #[serde(rename = "Cols")]
    pub cols: u32,

    /// Tile rows
    #[serde(rename = "Rows")]
    pub rows: u32,
}

impl TronMetadata {
    /// Parse and validate a decrypted metadata payload.
    pub fn parse(plaintext: &[u8]) -> Result<Self, SlideError> {
        let metadata: TronMetadata = serde_json::from_slice(plaintext)
            .map_err(|e| SlideError::bad_data(format!("metadata JSON: {e}")))?;

        if metadata.level_count == 0 {
            return Err(SlideError::bad_data("metadata declares zero levels"));
        }
        if metadata.levels.len() != metadata.level_count as usize {
            return Err(SlideError::bad_data(format!(
                "metadata declares {} levels but lists {}",
                metadata.level_count,
                metadata.levels.len()
            )));
        }
        if metadata.tile_width == 0 || metadata.tile_height == 0 {
            return Err(SlideError::bad_data("metadata declares a zero tile size"));
        }
        for (i, level) in metadata.levels.iter().enumerate() {
            if level.width == 0 || level.height == 0 || level.cols == 0 || level.rows == 0 {
                return Err(SlideError::bad_data(format!(
                    "metadata level {i} has empty geometry"
                )));
            }
        }

        Ok(metadata)
    }

    /// Background color as packed RGB, when present and well-formed.
    pub fn background_rgb(&self) -> Option<u32> {
        parse_background_color(self.background_color.as_deref()?)
    }
}

/// Parse a decimal "R, G, B" string into packed `0xRRGGBB`.
pub fn parse_background_color(value: &str) -> Option<u32> {
    let mut parts = value.split(',').map(|p| p.trim().parse::<u32>());
    let r = parts.next()?.ok()?;
    let g = parts.next()?.ok()?;
    let b = parts.next()?.ok()?;
    if parts.next().is_some() || r > 255 || g > 255 || b > 255 {
        return None;
    }
    Some((r << 16) | (g << 8) | b)
}

/// Split a tile entry name into `(level, row, col)`.
///
/// Accepts both `\` and `/` separators; the focal-plane segment must be
/// `0`. Non-tile entries (metadata, associated images) return `None`.
pub fn parse_tile_entry_name(name: &str) -> Option<(u32, u32, u32)> {
    let segments: Vec<&str> = name.split(['\\', '/']).collect();
    let [level, plane, row, file] = segments.as_slice() else {
        return None;
    };
    if *plane != "0" {
        return None;
    }
    let col = file.strip_suffix(".jpg")?;
    Some((level.parse().ok()?, row.parse().ok()?, col.parse().ok()?))
}

// =============================================================================
// Tests
// =============================================================================
