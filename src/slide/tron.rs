//! InteMedic `.tron` backend: a Zip64 container of JPEG tiles.
//!
//! The encrypted metadata entry describes the pyramid; tile entries are
//! named `{level}\0\{row}\{col}.jpg` and decoded as plain JPEGs. Grids are
//! tilemaps built from the entries actually present: archives omit
//! background tiles, and those cells render as a background fill.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::codec::crypto::decrypt_metadata;
use crate::codec::jpeg::{decode_jpeg, decode_jpeg_image};
use crate::codec::zip::{ZipArchive, ZipEntry};
use crate::error::SlideError;
use crate::format::tron::{parse_tile_entry_name, TronMetadata};
use crate::format::{is_zip_header, SlideFormat};
use crate::io::{FileRangeReader, RangeReader};
use crate::tile::{
    Surface, TileCache, TileHandle, TileKey, TilemapGrid, TilePainter, TilePixels,
};

use super::backend::{compute_downsamples, AssociatedImage, LevelInfo};
use super::properties::{
    format_background_color, format_number, PROP_BACKGROUND_COLOR, PROP_MPP_X, PROP_MPP_Y,
    PROP_OBJECTIVE_POWER, PROP_VENDOR,
};

/// Entry names exposed as associated images when present.
const ASSOCIATED_ENTRIES: [&str; 3] = ["label", "macro", "preview"];

// =============================================================================
// Detection
// =============================================================================

/// Probe a path as an InteMedic container: the right extension and a ZIP
/// local-header magic.
pub(crate) async fn detect(path: &Path, reader: &FileRangeReader) -> Result<bool, SlideError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if extension != "tron" {
        return Ok(false);
    }

    let magic = reader.read_at_most(0, 4).await.map_err(SlideError::Io)?;
    Ok(is_zip_header(&magic))
}

// =============================================================================
// TronBackend
// =============================================================================

/// Payload of one tilemap cell: the archive entry plus its pixel footprint.
#[derive(Debug, Clone)]
struct TronTileRef {
    entry: ZipEntry,
    width: u32,
    height: u32,
}

struct TronLevelState {
    grid: TilemapGrid<TronTileRef>,
    downsample: f64,

    /// Nominal tile size; edge cells are smaller
    tile_width: u32,
    tile_height: u32,
}

pub(crate) struct TronBackend {
    reader: FileRangeReader,
    archive: ZipArchive,
    levels: Vec<TronLevelState>,
    cache: Arc<TileCache>,

    /// Background fill for cells with no tile entry, packed ARGB
    background: u32,
}

impl TronBackend {
    /// Open a detected container.
    pub(crate) async fn open(
        reader: FileRangeReader,
        cache: Arc<TileCache>,
    ) -> Result<super::backend::OpenedSlide, SlideError> {
        let archive = ZipArchive::parse(&reader).await?;

        // The metadata entry carries the container's own extension
        let metadata_entry = archive
            .entries()
            .iter()
            .find(|e| e.name.to_lowercase().ends_with(".tron"))
            .cloned()
            .ok_or_else(|| SlideError::bad_data("container has no metadata entry"))?;

        let blob = archive.read_entry(&reader, &metadata_entry).await?;
        let plaintext = decrypt_metadata(&blob)?;
        let metadata = TronMetadata::parse(&plaintext)?;

        let dims: Vec<(u32, u32)> = metadata.levels.iter().map(|l| (l.width, l.height)).collect();
        let downsamples = compute_downsamples(&dims)?;

        // Tilemap grids from the entries actually present
        let mut grids: Vec<TilemapGrid<TronTileRef>> = metadata
            .levels
            .iter()
            .map(|_| TilemapGrid::new(metadata.tile_width as f64, metadata.tile_height as f64))
            .collect();

        for entry in archive.entries() {
            let Some((level, row, col)) = parse_tile_entry_name(&entry.name) else {
                continue;
            };
            let Some(info) = metadata.levels.get(level as usize) else {
                warn!(name = %entry.name, "skipping tile entry for undeclared level");
                continue;
            };
            if col >= info.cols || row >= info.rows {
                warn!(name = %entry.name, "skipping tile entry outside the level grid");
                continue;
            }

            // Edge tiles are clipped to the level bounds
            let width = info
                .width
                .saturating_sub(col * metadata.tile_width)
                .min(metadata.tile_width);
            let height = info
                .height
                .saturating_sub(row * metadata.tile_height)
                .min(metadata.tile_height);
            if width == 0 || height == 0 {
                warn!(name = %entry.name, "skipping tile entry with no footprint");
                continue;
            }

            grids[level as usize].add_tile(
                col as i64,
                row as i64,
                0.0,
                0.0,
                width as f64,
                height as f64,
                TronTileRef {
                    entry: entry.clone(),
                    width,
                    height,
                },
            );
        }

        let background_rgb = metadata.background_rgb().unwrap_or(0xFFFFFF);

        let mut levels = Vec::new();
        let mut infos = Vec::new();
        for (i, grid) in grids.into_iter().enumerate() {
            infos.push(LevelInfo {
                width: dims[i].0,
                height: dims[i].1,
                tile_width: metadata.tile_width as f64,
                tile_height: metadata.tile_height as f64,
                downsample: downsamples[i],
            });
            levels.push(TronLevelState {
                grid,
                downsample: downsamples[i],
                tile_width: metadata.tile_width,
                tile_height: metadata.tile_height,
            });
        }

        // Associated images are plain JPEG entries with well-known names
        let mut associated = BTreeMap::new();
        for name in ASSOCIATED_ENTRIES {
            let Some(entry) = archive.entry(name) else {
                continue;
            };
            let data = archive.read_entry(&reader, entry).await?;
            match decode_jpeg_image(&data) {
                Ok((argb, width, height)) => {
                    associated.insert(
                        name.to_string(),
                        AssociatedImage {
                            width,
                            height,
                            argb,
                        },
                    );
                }
                Err(e) => warn!(name, error = %e, "skipping undecodable associated image"),
            }
        }

        let mut properties = BTreeMap::new();
        properties.insert(PROP_VENDOR.to_string(), SlideFormat::IntemedicTron.vendor().to_string());
        properties.insert(
            PROP_BACKGROUND_COLOR.to_string(),
            format_background_color(background_rgb),
        );
        if let Some(mpp) = metadata.mpp_x {
            properties.insert(PROP_MPP_X.to_string(), format_number(mpp));
        }
        if let Some(mpp) = metadata.mpp_y {
            properties.insert(PROP_MPP_Y.to_string(), format_number(mpp));
        }
        if let Some(objective) = metadata.objective {
            properties.insert(PROP_OBJECTIVE_POWER.to_string(), format_number(objective));
        }
        properties.insert(
            "intemedic.LevelCount".to_string(),
            metadata.level_count.to_string(),
        );
        properties.insert(
            "intemedic.TileWidth".to_string(),
            metadata.tile_width.to_string(),
        );
        properties.insert(
            "intemedic.TileHeight".to_string(),
            metadata.tile_height.to_string(),
        );
        if let Some(color) = &metadata.background_color {
            properties.insert("intemedic.BackgroundColor".to_string(), color.clone());
        }

        debug!(
            levels = levels.len(),
            entries = archive.len(),
            associated = associated.len(),
            "opened tron slide"
        );

        Ok(super::backend::OpenedSlide {
            levels: infos,
            properties,
            associated,
            background: background_rgb,
            backend: super::backend::Backend::Tron(TronBackend {
                reader,
                archive,
                levels,
                cache,
                background: 0xFF00_0000 | background_rgb,
            }),
        })
    }

    /// Paint a level-0 rectangle of `level` onto a level-space surface.
    pub(crate) async fn paint_region(
        &self,
        surface: &mut Surface<'_>,
        x: f64,
        y: f64,
        level: usize,
        w: u32,
        h: u32,
    ) -> Result<(), SlideError> {
        let state = self
            .levels
            .get(level)
            .ok_or_else(|| SlideError::bad_data(format!("level {level} out of range")))?;
        let painter = TronPainter {
            backend: self,
            level,
        };
        let ds = state.downsample;
        state
            .grid
            .paint_region(surface, &painter, x / ds, y / ds, w, h)
            .await
    }

    /// Decode (or fetch from cache) one tile.
    async fn tile_pixels(
        &self,
        level: usize,
        tile: &TronTileRef,
        col: u32,
        row: u32,
    ) -> Result<TileHandle, SlideError> {
        let key = TileKey::new(level as u32, col, row);
        if let Some(handle) = self.cache.get(&key).await {
            return Ok(handle);
        }

        let data = self.archive.read_entry(&self.reader, &tile.entry).await?;
        let pixels = decode_jpeg(&data, tile.width, tile.height)?;

        Ok(self
            .cache
            .put(key, TilePixels::new(pixels, tile.width, tile.height))
            .await)
    }
}

struct TronPainter<'a> {
    backend: &'a TronBackend,
    level: usize,
}

#[async_trait]
impl TilePainter for TronPainter<'_> {
    type Tile = TronTileRef;

    async fn paint_tile(
        &self,
        surface: &mut Surface<'_>,
        tile: &TronTileRef,
        col: i64,
        row: i64,
    ) -> Result<(), SlideError> {
        let pixels = self
            .backend
            .tile_pixels(self.level, tile, col as u32, row as u32)
            .await?;
        surface.paint_image(&pixels.data, pixels.width, pixels.height);
        Ok(())
    }

    async fn paint_missing(
        &self,
        surface: &mut Surface<'_>,
        _col: i64,
        _row: i64,
    ) -> Result<(), SlideError> {
        let state = &self.backend.levels[self.level];
        surface.fill_rect(
            0.0,
            0.0,
            state.tile_width as f64,
            state.tile_height as f64,
            self.backend.background,
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
