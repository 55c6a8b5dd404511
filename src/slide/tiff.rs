//! TIFF-tiled backend: Aperio SVS, Trestle, and generic pyramidal TIFF.
//!
//! Every tiled directory becomes a level with a dense grid. Tile payloads
//! are JPEG (with per-level `JPEGTables` merged into each abbreviated
//! stream) or Aperio's JPEG 2000 flavors, which carry no color-space
//! marker of their own; the TIFF compression code decides YCbCr vs RGB.
//!
//! Aperio writes zero-length payloads for background tiles. Such a tile is
//! rendered by clearing its footprint and recursively painting the same
//! area from the next finer level, scaled down, widened by a pixel to
//! cover seams, and composited with the saturate operator so pieces meet
//! without double-blending. Missing-ness propagates coarse-ward: a tile
//! whose contributing finer tiles include a missing one is itself treated
//! as missing, which keeps the recursion consistent all the way down.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::codec::jp2k::{decode_jp2k, Jp2kColorSpace};
use crate::codec::jpeg::{decode_jpeg, decode_jpeg_image, prepare_tile_jpeg};
use crate::error::SlideError;
use crate::format::tiff::{
    Compression, StrippedIfd, TiffHeader, TiffLevel, TiffPyramid, TiffTag, ValueReader,
};
use crate::format::SlideFormat;
use crate::io::{FileRangeReader, RangeReader};
use crate::tile::{Operator, SimpleGrid, Surface, TileCache, TileHandle, TileKey, TilePainter, TilePixels};

use super::backend::{compute_downsamples, AssociatedImage, LevelInfo};
use super::properties::{
    format_number, PROP_MPP_X, PROP_MPP_Y, PROP_OBJECTIVE_POWER, PROP_VENDOR,
};

/// Marker string identifying Aperio files in ImageDescription.
const APERIO_MARKER: &str = "Aperio";

/// Marker string identifying Trestle files in Software/ImageDescription.
const TRESTLE_MARKER: &str = "MedScan";

// =============================================================================
// Detection
// =============================================================================

/// Classify a TIFF slide by its first directory's vendor markers.
///
/// Returns `None` when the file is a TIFF but not a tiled slide.
pub(crate) async fn detect(reader: &FileRangeReader) -> Result<Option<SlideFormat>, SlideError> {
    let pyramid = match TiffPyramid::parse(reader).await {
        Ok(pyramid) => pyramid,
        Err(e) => return Err(e.into()),
    };

    if pyramid.levels.is_empty() {
        return Ok(None);
    }

    let (description, software) = read_vendor_strings(reader, &pyramid).await;

    if description.contains(APERIO_MARKER) {
        return Ok(Some(SlideFormat::AperioSvs));
    }
    if software.contains(TRESTLE_MARKER) || description.contains(TRESTLE_MARKER) {
        return Ok(Some(SlideFormat::Trestle));
    }
    Ok(Some(SlideFormat::GenericTiff))
}

/// ImageDescription and Software strings of the first level, empty when
/// absent.
async fn read_vendor_strings(reader: &FileRangeReader, pyramid: &TiffPyramid) -> (String, String) {
    let Some(level) = pyramid.levels.first() else {
        return (String::new(), String::new());
    };
    let values = ValueReader::new(reader, &pyramid.header);

    let description = match level.ifd.get_entry_by_tag(TiffTag::ImageDescription) {
        Some(entry) => values.read_string(entry).await.unwrap_or_default(),
        None => String::new(),
    };
    let software = match level.ifd.get_entry_by_tag(TiffTag::Software) {
        Some(entry) => values.read_string(entry).await.unwrap_or_default(),
        None => String::new(),
    };
    (description, software)
}

// =============================================================================
// Aperio metadata
// =============================================================================

/// Parsed metadata from an Aperio ImageDescription string.
///
/// The format is a free-text header followed by pipe-separated
/// `Key = Value` pairs:
///
/// ```text
/// Aperio Image Library v12.0.0
/// 40000x30000 [0,0 40000x30000] (256x256) JPEG/RGB Q=70|AppMag = 20|MPP = 0.4990
/// ```
#[derive(Debug, Clone, Default)]
struct AperioMetadata {
    /// Microns per pixel (resolution)
    mpp: Option<f64>,

    /// Objective magnification (e.g., 20, 40)
    magnification: Option<f64>,

    /// All key-value pairs from the description
    properties: HashMap<String, String>,
}

impl AperioMetadata {
    fn parse(description: &str) -> Self {
        let mut metadata = AperioMetadata::default();

        for part in description.split('|') {
            let part = part.trim();

            let Some(eq_pos) = part.find('=') else {
                continue;
            };
            let key = part[..eq_pos].trim();
            let value = part[eq_pos + 1..].trim();

            metadata
                .properties
                .insert(key.to_string(), value.to_string());

            match key {
                "MPP" => match value.parse::<f64>() {
                    Ok(mpp) => metadata.mpp = Some(mpp),
                    Err(_) => warn!(value, "skipping unparsable MPP"),
                },
                "AppMag" => match value.parse::<f64>() {
                    Ok(mag) => metadata.magnification = Some(mag),
                    Err(_) => warn!(value, "skipping unparsable AppMag"),
                },
                _ => {}
            }
        }

        metadata
    }
}

/// Tile overlap in pixels from a Trestle description (`OverlapsXY=x y`).
fn parse_trestle_overlaps(description: &str) -> (u32, u32) {
    for token in description.split([';', '|', '\n']) {
        let token = token.trim();
        let Some(value) = token.strip_prefix("OverlapsXY=") else {
            continue;
        };
        let mut parts = value.split_whitespace().map(|p| p.parse::<u32>());
        if let (Some(Ok(x)), Some(Ok(y))) = (parts.next(), parts.next()) {
            return (x, y);
        }
        warn!(token, "skipping unparsable overlap value");
    }
    (0, 0)
}

// =============================================================================
// TiffBackend
// =============================================================================

struct TiffLevelState {
    /// Parsed directory with tile locations and the missing set
    level: TiffLevel,

    grid: SimpleGrid,

    /// Tile advance in level pixels (smaller than the tile for overlaps)
    pitch_w: f64,
    pitch_h: f64,

    downsample: f64,
}

pub(crate) struct TiffBackend {
    reader: FileRangeReader,
    levels: Vec<TiffLevelState>,
    cache: Arc<TileCache>,
}

impl TiffBackend {
    /// Build the backend and the slide surface data from a detected file.
    pub(crate) async fn open(
        reader: FileRangeReader,
        format: SlideFormat,
        cache: Arc<TileCache>,
    ) -> Result<super::backend::OpenedSlide, SlideError> {
        let mut pyramid = TiffPyramid::parse(&reader).await?;
        if pyramid.levels.is_empty() {
            return Err(SlideError::unsupported("TIFF has no tiled directories"));
        }

        for level in &pyramid.levels {
            if !level.compression.is_supported() {
                return Err(SlideError::unsupported(format!(
                    "tile compression {} is not supported",
                    level.compression.name()
                )));
            }
        }

        let (description, software) = read_vendor_strings(&reader, &pyramid).await;

        // Vendor metadata drives overlaps and the property map
        let mut properties = BTreeMap::new();
        properties.insert(PROP_VENDOR.to_string(), format.vendor().to_string());

        let mut overlaps = (0, 0);
        match format {
            SlideFormat::AperioSvs => {
                let metadata = AperioMetadata::parse(&description);
                if let Some(mpp) = metadata.mpp {
                    properties.insert(PROP_MPP_X.to_string(), format_number(mpp));
                    properties.insert(PROP_MPP_Y.to_string(), format_number(mpp));
                }
                if let Some(mag) = metadata.magnification {
                    properties.insert(PROP_OBJECTIVE_POWER.to_string(), format_number(mag));
                }
                for (key, value) in metadata.properties {
                    properties.insert(format!("aperio.{key}"), value);
                }
            }
            SlideFormat::Trestle => {
                overlaps = parse_trestle_overlaps(&description);
                overlaps = (
                    overlaps.0.min(pyramid.levels[0].tile_width.saturating_sub(1)),
                    overlaps.1.min(pyramid.levels[0].tile_height.saturating_sub(1)),
                );
                properties.insert(
                    "trestle.Software".to_string(),
                    software.trim().to_string(),
                );
                if !description.is_empty() {
                    properties.insert(
                        "trestle.ImageDescription".to_string(),
                        description.clone(),
                    );
                }
            }
            _ => {
                read_generic_resolution(&reader, &pyramid, &mut properties).await;
            }
        }

        propagate_missing_tiles(&mut pyramid.levels);

        // Advertised dimensions; Trestle levels shrink by the overlap
        // between adjacent tiles
        let dims: Vec<(u32, u32)> = pyramid
            .levels
            .iter()
            .map(|l| {
                (
                    l.width - overlaps.0 * (l.tiles_x - 1),
                    l.height - overlaps.1 * (l.tiles_y - 1),
                )
            })
            .collect();
        let downsamples = compute_downsamples(&dims)?;

        let mut levels = Vec::with_capacity(pyramid.levels.len());
        let mut infos = Vec::with_capacity(pyramid.levels.len());
        for (i, level) in pyramid.levels.into_iter().enumerate() {
            let pitch_w = (level.tile_width - overlaps.0) as f64;
            let pitch_h = (level.tile_height - overlaps.1) as f64;
            let grid = SimpleGrid::new(level.tiles_x, level.tiles_y, pitch_w, pitch_h);
            infos.push(LevelInfo {
                width: dims[i].0,
                height: dims[i].1,
                tile_width: pitch_w,
                tile_height: pitch_h,
                downsample: downsamples[i],
            });
            levels.push(TiffLevelState {
                level,
                grid,
                pitch_w,
                pitch_h,
                downsample: downsamples[i],
            });
        }

        let associated =
            load_associated_images(&reader, &pyramid.header, &pyramid.stripped).await;

        debug!(
            levels = levels.len(),
            associated = associated.len(),
            vendor = format.vendor(),
            "opened TIFF slide"
        );

        Ok(super::backend::OpenedSlide {
            levels: infos,
            properties,
            associated,
            background: 0xFFFFFF,
            backend: super::backend::Backend::Tiff(TiffBackend {
                reader,
                levels,
                cache,
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
        let ds = state.downsample;
        self.paint_level_rect(surface, level, x / ds, y / ds, w, h)
            .await
    }

    /// Paint a rectangle given in `level`'s own pixel coordinates.
    async fn paint_level_rect(
        &self,
        surface: &mut Surface<'_>,
        level: usize,
        x: f64,
        y: f64,
        w: u32,
        h: u32,
    ) -> Result<(), SlideError> {
        let state = &self.levels[level];
        let painter = TiffPainter {
            backend: self,
            level,
        };
        state.grid.paint_region(surface, &painter, x, y, w, h).await
    }

    /// Decode (or fetch from cache) one tile's pixels.
    async fn tile_pixels(
        &self,
        level: usize,
        col: u32,
        row: u32,
    ) -> Result<TileHandle, SlideError> {
        let key = TileKey::new(level as u32, col, row);
        if let Some(handle) = self.cache.get(&key).await {
            return Ok(handle);
        }

        let state = &self.levels[level];
        let (offset, length) = state
            .level
            .tile_location(col, row)
            .ok_or_else(|| SlideError::bad_data(format!("tile ({col},{row}) out of range")))?;
        let (tw, th) = (state.level.tile_width, state.level.tile_height);

        let data = self
            .reader
            .read_exact_at(offset, length as usize)
            .await
            .map_err(SlideError::Io)?;

        let pixels = match state.level.compression {
            Compression::Jpeg => {
                let stream = prepare_tile_jpeg(state.level.jpeg_tables.as_deref(), &data);
                decode_jpeg(&stream, tw, th)?
            }
            Compression::Jp2kYcbcr => decode_jp2k(&data, Jp2kColorSpace::Ycbcr, tw, th)?,
            Compression::Jp2kRgb => decode_jp2k(&data, Jp2kColorSpace::Rgb, tw, th)?,
            other => {
                return Err(SlideError::unsupported(format!(
                    "tile compression {} is not supported",
                    other.name()
                )))
            }
        };

        Ok(self
            .cache
            .put(key, TilePixels::new(pixels, tw, th))
            .await)
    }

    /// Render a missing tile by recursing into the next finer level.
    async fn paint_missing_tile(
        &self,
        surface: &mut Surface<'_>,
        level: usize,
        col: u32,
        row: u32,
    ) -> Result<(), SlideError> {
        let state = &self.levels[level];
        let (tw, th) = (
            state.level.tile_width as f64,
            state.level.tile_height as f64,
        );

        // Punch the footprint transparent so the recursive fill can tell
        // covered pixels from uncovered ones
        surface.clear_rect(0.0, 0.0, tw, th);

        if level == 0 {
            // Nothing finer to read; the background shows through
            return Ok(());
        }

        let prev = level - 1;
        let ratio = self.levels[prev].downsample / state.downsample;

        // This tile's origin and extent in finer-level pixels
        let ox = (col as f64 * state.pitch_w) / ratio;
        let oy = (row as f64 * state.pitch_h) / ratio;
        let pw = (tw / ratio + 2.0).ceil() as u32;
        let ph = (th / ratio + 2.0).ceil() as u32;

        surface.save();
        surface.set_operator(Operator::Saturate);
        surface.scale(ratio, ratio);
        surface.translate(-ox, -oy);
        // One extra pixel on each side hides the seam left by scaling
        let result = self
            .paint_level_rect(surface, prev, ox - 1.0, oy - 1.0, pw, ph)
            .await;
        surface.restore();
        result
    }
}

struct TiffPainter<'a> {
    backend: &'a TiffBackend,
    level: usize,
}

#[async_trait]
impl TilePainter for TiffPainter<'_> {
    type Tile = ();

    async fn paint_tile(
        &self,
        surface: &mut Surface<'_>,
        _tile: &(),
        col: i64,
        row: i64,
    ) -> Result<(), SlideError> {
        let (col, row) = (col as u32, row as u32);
        let state = &self.backend.levels[self.level];

        if state.level.is_missing(col, row) {
            return self
                .backend
                .paint_missing_tile(surface, self.level, col, row)
                .await;
        }

        let pixels = self.backend.tile_pixels(self.level, col, row).await?;
        surface.paint_image(&pixels.data, pixels.width, pixels.height);
        Ok(())
    }
}

// =============================================================================
// Missing-tile propagation
// =============================================================================

/// Mark tiles missing wherever a contributing finer tile is missing.
///
/// Runs finest to coarsest so missing areas compound upward; the recursive
/// renderer can then rely on every non-missing tile being decodable.
fn propagate_missing_tiles(levels: &mut [TiffLevel]) {
    for l in 1..levels.len() {
        let (finer_slice, coarser_slice) = levels.split_at_mut(l);
        let finer = &finer_slice[l - 1];
        let coarser = &mut coarser_slice[0];

        if finer.missing.is_empty() {
            continue;
        }

        let scale_x = coarser.width as f64 / finer.width as f64;
        let scale_y = coarser.height as f64 / finer.height as f64;

        let missing: Vec<u32> = finer.missing.iter().copied().collect();
        for index in missing {
            let fcol = index % finer.tiles_x;
            let frow = index / finer.tiles_x;

            // Finer tile footprint, mapped into coarser pixels
            let x0 = fcol as f64 * finer.tile_width as f64 * scale_x;
            let x1 = (fcol + 1) as f64 * finer.tile_width as f64 * scale_x;
            let y0 = frow as f64 * finer.tile_height as f64 * scale_y;
            let y1 = (frow + 1) as f64 * finer.tile_height as f64 * scale_y;

            let c0 = (x0 / coarser.tile_width as f64).floor() as u32;
            let c1 = ((x1 / coarser.tile_width as f64).ceil() as u32).min(coarser.tiles_x);
            let r0 = (y0 / coarser.tile_height as f64).floor() as u32;
            let r1 = ((y1 / coarser.tile_height as f64).ceil() as u32).min(coarser.tiles_y);

            for r in r0..r1 {
                for c in c0..c1 {
                    coarser.mark_missing(c, r);
                }
            }
        }
    }
}

// =============================================================================
// Associated images
// =============================================================================

/// Decode stripped directories into named associated images.
///
/// The first stripped directory is the thumbnail; later ones are named by
/// the `label`/`macro` markers scanners put in their descriptions.
/// Undecodable images are skipped, not fatal.
async fn load_associated_images(
    reader: &FileRangeReader,
    header: &TiffHeader,
    stripped: &[StrippedIfd],
) -> BTreeMap<String, AssociatedImage> {
    let mut associated = BTreeMap::new();

    for (i, ifd) in stripped.iter().enumerate() {
        let Some(name) = classify_stripped(reader, header, ifd, i == 0).await else {
            continue;
        };

        match decode_stripped(reader, ifd).await {
            Ok(image) => {
                associated.insert(name, image);
            }
            Err(e) => {
                warn!(name = %name, error = %e, "skipping undecodable associated image");
            }
        }
    }

    associated
}

/// Pick an associated-image name for a stripped directory.
///
/// The description distinguishes label from macro in Aperio files; an
/// unmarked first stripped directory is the thumbnail.
async fn classify_stripped(
    reader: &FileRangeReader,
    header: &TiffHeader,
    ifd: &StrippedIfd,
    is_first: bool,
) -> Option<String> {
    let values = ValueReader::new(reader, header);
    let description = match ifd.ifd.get_entry_by_tag(TiffTag::ImageDescription) {
        Some(entry) => values.read_string(entry).await.unwrap_or_default(),
        None => String::new(),
    };

    let lower = description.to_lowercase();
    if lower.contains("label") {
        Some("label".to_string())
    } else if lower.contains("macro") {
        Some("macro".to_string())
    } else if is_first {
        Some("thumbnail".to_string())
    } else {
        None
    }
}

/// Decode a stripped image into owned ARGB.
async fn decode_stripped(
    reader: &FileRangeReader,
    ifd: &StrippedIfd,
) -> Result<AssociatedImage, SlideError> {
    let (width, height) = (ifd.width, ifd.height);
    let mut argb = vec![0u32; (width as usize) * (height as usize)];

    let mut row = 0u32;
    for (offset, count) in ifd.strip_offsets.iter().zip(&ifd.strip_byte_counts) {
        if row >= height {
            break;
        }
        let rows = ifd.rows_per_strip.min(height - row);
        let data = reader
            .read_exact_at(*offset, *count as usize)
            .await
            .map_err(SlideError::Io)?;

        match ifd.compression {
            Compression::Jpeg => {
                let stream = prepare_tile_jpeg(ifd.jpeg_tables.as_deref(), &data);
                let (pixels, w, h) = decode_jpeg_image(&stream)?;
                if w != width || h < rows {
                    return Err(SlideError::bad_data(format!(
                        "strip decodes to {w}x{h}, expected {width}x{rows}"
                    )));
                }
                let start = (row as usize) * (width as usize);
                let len = (rows as usize) * (width as usize);
                argb[start..start + len].copy_from_slice(&pixels[..len]);
            }
            Compression::None => {
                let expected = (rows as usize) * (width as usize) * 3;
                if data.len() < expected {
                    return Err(SlideError::bad_data(format!(
                        "strip holds {} bytes, expected {expected}",
                        data.len()
                    )));
                }
                let start = (row as usize) * (width as usize);
                for (i, rgb) in data[..expected].chunks_exact(3).enumerate() {
                    argb[start + i] = 0xFF00_0000
                        | ((rgb[0] as u32) << 16)
                        | ((rgb[1] as u32) << 8)
                        | rgb[2] as u32;
                }
            }
            other => {
                return Err(SlideError::unsupported(format!(
                    "associated image compression {} is not supported",
                    other.name()
                )));
            }
        }

        row += rows;
    }

    Ok(AssociatedImage {
        width,
        height,
        argb,
    })
}

/// Derive mpp properties from generic TIFF resolution tags.
async fn read_generic_resolution(
    reader: &FileRangeReader,
    pyramid: &TiffPyramid,
    properties: &mut BTreeMap<String, String>,
) {
    let Some(level) = pyramid.levels.first() else {
        return;
    };
    let values = ValueReader::new(reader, &pyramid.header);

    let unit = match level.ifd.get_entry_by_tag(TiffTag::ResolutionUnit) {
        Some(entry) => values.read_u32(entry).await.unwrap_or(2),
        None => 2,
    };
    // Only centimeter resolutions convert cleanly to microns per pixel
    if unit != 3 {
        return;
    }

    for (tag, prop) in [
        (TiffTag::XResolution, PROP_MPP_X),
        (TiffTag::YResolution, PROP_MPP_Y),
    ] {
        let Some(entry) = level.ifd.get_entry_by_tag(tag) else {
            continue;
        };
        if let Ok(Some(pixels_per_cm)) = values.read_rational(entry).await {
            if pixels_per_cm > 0.0 {
                properties.insert(prop.to_string(), format_number(10_000.0 / pixels_per_cm));
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
