//! Spatial tile indexes for one resolution level.
//!
//! A grid maps tile coordinates to tile content and drives region
//! painting: given a rectangle in level pixels, it visits every tile whose
//! footprint intersects, sets the surface transform to the tile's
//! placement, and hands off to the backend's [`TilePainter`].
//!
//! Two shapes exist:
//!
//! - [`SimpleGrid`]: a dense rows x cols lattice with a fixed pitch; tile
//!   content is produced on demand by the painter from `(col, row)` alone.
//! - [`TilemapGrid`]: explicit tile entries, each with its own sub-pixel
//!   placement offset and footprint. Used when tiles overlap, carry
//!   per-tile payloads, or come from sparse sources.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::SlideError;

use super::surface::Surface;

// =============================================================================
// TilePainter
// =============================================================================

/// Backend callback seam for grid painting.
///
/// When `paint_tile` runs, the surface transform already maps the tile's
/// placement origin to user-space `(0, 0)`; the painter draws the tile
/// there and must not assume anything about the surrounding region.
#[async_trait]
pub trait TilePainter: Send + Sync {
    /// Per-tile payload stored in the grid (`()` for simple grids).
    type Tile: Send + Sync;

    /// Draw one tile at the user-space origin.
    async fn paint_tile(
        &self,
        surface: &mut Surface<'_>,
        tile: &Self::Tile,
        col: i64,
        row: i64,
    ) -> Result<(), SlideError>;

    /// Draw a placeholder for a cell with no tile entry.
    ///
    /// The default paints nothing.
    async fn paint_missing(
        &self,
        _surface: &mut Surface<'_>,
        _col: i64,
        _row: i64,
    ) -> Result<(), SlideError> {
        Ok(())
    }
}

// =============================================================================
// SimpleGrid
// =============================================================================

/// Dense grid: cell `(col, row)` exists iff it is inside the lattice.
#[derive(Debug, Clone)]
pub struct SimpleGrid {
    tiles_across: u32,
    tiles_down: u32,
    tile_width: f64,
    tile_height: f64,
}

impl SimpleGrid {
    /// Create a grid of `tiles_across` x `tiles_down` cells with a fixed
    /// tile pitch.
    pub fn new(tiles_across: u32, tiles_down: u32, tile_width: f64, tile_height: f64) -> Self {
        Self {
            tiles_across,
            tiles_down,
            tile_width,
            tile_height,
        }
    }

    /// Number of columns.
    pub fn tiles_across(&self) -> u32 {
        self.tiles_across
    }

    /// Number of rows.
    pub fn tiles_down(&self) -> u32 {
        self.tiles_down
    }

    /// Tile pitch `(width, height)`.
    pub fn tile_size(&self) -> (f64, f64) {
        (self.tile_width, self.tile_height)
    }

    /// Paint every tile intersecting the rectangle `(x, y, w, h)` in level
    /// pixels.
    ///
    /// The surface must already be transformed so level-pixel coordinates
    /// map to the destination; tiles are visited row-major and clipped by
    /// the surface.
    pub async fn paint_region<P>(
        &self,
        surface: &mut Surface<'_>,
        painter: &P,
        x: f64,
        y: f64,
        w: u32,
        h: u32,
    ) -> Result<(), SlideError>
    where
        P: TilePainter<Tile = ()>,
    {
        let (start_col, end_col) =
            pitch_range(x, w, self.tile_width, self.tiles_across as i64);
        let (start_row, end_row) =
            pitch_range(y, h, self.tile_height, self.tiles_down as i64);

        for row in start_row..end_row {
            for col in start_col..end_col {
                surface.save();
                surface.translate(col as f64 * self.tile_width, row as f64 * self.tile_height);
                let result = painter.paint_tile(surface, &(), col, row).await;
                surface.restore();
                result?;
            }
        }

        Ok(())
    }
}

/// Cells of a fixed pitch overlapping `[origin, origin + extent)`, clamped
/// to `[0, cells)`.
fn pitch_range(origin: f64, extent: u32, pitch: f64, cells: i64) -> (i64, i64) {
    if pitch <= 0.0 || cells == 0 {
        return (0, 0);
    }
    let start = (origin / pitch).floor() as i64;
    let end = ((origin + extent as f64) / pitch).ceil() as i64;
    (start.clamp(0, cells), end.clamp(0, cells))
}

// =============================================================================
// TilemapGrid
// =============================================================================

/// One explicit tile entry.
#[derive(Debug, Clone)]
struct TilemapTile<T> {
    /// Placement offset from the cell's nominal origin, in level pixels
    offset_x: f64,
    offset_y: f64,

    /// Footprint in level pixels (may differ from the nominal pitch)
    width: f64,
    height: f64,

    /// Backend payload
    data: T,
}

/// Sparse grid of explicitly placed tiles.
///
/// Cells are addressed on a nominal `tile_width` x `tile_height` lattice,
/// but each entry carries its own placement offset and footprint, so a
/// tile may stick out of its cell. The paint search widens by the largest
/// offsets and footprints seen, so arbitrary placements stay correct.
#[derive(Debug, Clone)]
pub struct TilemapGrid<T> {
    tile_width: f64,
    tile_height: f64,
    tiles: HashMap<(i64, i64), TilemapTile<T>>,

    /// Search margin in cells, grown as tiles are added
    margin_x: i64,
    margin_y: i64,
}

impl<T: Send + Sync> TilemapGrid<T> {
    /// Create an empty tilemap with the given nominal pitch.
    pub fn new(tile_width: f64, tile_height: f64) -> Self {
        Self {
            tile_width,
            tile_height,
            tiles: HashMap::new(),
            margin_x: 1,
            margin_y: 1,
        }
    }

    /// Number of tile entries.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Whether the tilemap has no entries.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Nominal tile pitch `(width, height)`.
    pub fn tile_size(&self) -> (f64, f64) {
        (self.tile_width, self.tile_height)
    }

    /// Add a tile at cell `(col, row)` with a placement offset and
    /// footprint.
    ///
    /// Adding a second tile to the same cell replaces the first.
    pub fn add_tile(
        &mut self,
        col: i64,
        row: i64,
        offset_x: f64,
        offset_y: f64,
        width: f64,
        height: f64,
        data: T,
    ) {
        // Keep the paint search wide enough to find tiles that overhang
        // their nominal cell
        let reach_x = (offset_x.abs() + width) / self.tile_width;
        let reach_y = (offset_y.abs() + height) / self.tile_height;
        self.margin_x = self.margin_x.max(reach_x.ceil() as i64);
        self.margin_y = self.margin_y.max(reach_y.ceil() as i64);

        self.tiles.insert(
            (col, row),
            TilemapTile {
                offset_x,
                offset_y,
                width,
                height,
                data,
            },
        );
    }

    /// Payload of the tile at `(col, row)`, if present.
    pub fn tile_data(&self, col: i64, row: i64) -> Option<&T> {
        self.tiles.get(&(col, row)).map(|t| &t.data)
    }

    /// Paint every tile whose footprint intersects the rectangle
    /// `(x, y, w, h)` in level pixels.
    ///
    /// Cells in the nominal range with no entry get `paint_missing`.
    pub async fn paint_region<P>(
        &self,
        surface: &mut Surface<'_>,
        painter: &P,
        x: f64,
        y: f64,
        w: u32,
        h: u32,
    ) -> Result<(), SlideError>
    where
        P: TilePainter<Tile = T>,
    {
        if self.tile_width <= 0.0 || self.tile_height <= 0.0 {
            return Ok(());
        }

        let start_col = (x / self.tile_width).floor() as i64 - self.margin_x;
        let end_col = ((x + w as f64) / self.tile_width).ceil() as i64 + self.margin_x;
        let start_row = (y / self.tile_height).floor() as i64 - self.margin_y;
        let end_row = ((y + h as f64) / self.tile_height).ceil() as i64 + self.margin_y;

        let x1 = x + w as f64;
        let y1 = y + h as f64;

        for row in start_row..end_row {
            for col in start_col..end_col {
                let nominal_x = col as f64 * self.tile_width;
                let nominal_y = row as f64 * self.tile_height;

                match self.tiles.get(&(col, row)) {
                    Some(tile) => {
                        let tx = nominal_x + tile.offset_x;
                        let ty = nominal_y + tile.offset_y;
                        if tx + tile.width <= x || tx >= x1 || ty + tile.height <= y || ty >= y1
                        {
                            continue;
                        }
                        surface.save();
                        surface.translate(tx, ty);
                        let result = painter.paint_tile(surface, &tile.data, col, row).await;
                        surface.restore();
                        result?;
                    }
                    None => {
                        // Only nominal cells inside the rectangle are missing
                        if nominal_x + self.tile_width <= x
                            || nominal_x >= x1
                            || nominal_y + self.tile_height <= y
                            || nominal_y >= y1
                        {
                            continue;
                        }
                        surface.save();
                        surface.translate(nominal_x, nominal_y);
                        let result = painter.paint_missing(surface, col, row).await;
                        surface.restore();
                        result?;
                    }
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
