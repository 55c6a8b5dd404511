//! Hamamatsu VMS backend: a mosaic of monolithic JPEGs.
//!
//! Level 0 is a grid of JPEG files; within each file, restart intervals
//! are the tiles (one interval of MCUs wide, one MCU row tall). Tile byte
//! ranges come from the lazily built restart-marker index; a per-tile
//! stream is synthesized from the file header plus the interval's entropy
//! bytes and decoded as an ordinary JPEG.
//!
//! The low-resolution map JPEG is its own level, and extra levels are
//! derived for every power-of-two divisor of the tile size: they share the
//! level-0 tile records and deliver box-shrunk pixels at decode time.
//!
//! A background worker pre-scans restart markers between region reads; see
//! [`crate::tile::restart`] for the RUN/PAUSE/STOP protocol.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::jpeg::{build_tile_stream, decode_jpeg, decode_jpeg_image, JpegStreamInfo};
use crate::codec::shrink_argb;
use crate::error::{IoError, SlideError};
use crate::format::vms::VmsKeyFile;
use crate::io::{FileHandleCache, RangeReader, SharedHandleCache};
use crate::tile::{
    IndexedJpeg, JpegTileIndex, MarkerWorker, SimpleGrid, Surface, TileCache, TileHandle, TileKey,
    TilePainter, TilePixels,
};

use super::backend::{compute_downsamples, AssociatedImage, LevelInfo};
use super::properties::{
    format_number, PROP_MPP_X, PROP_MPP_Y, PROP_OBJECTIVE_POWER, PROP_VENDOR,
};

/// Largest prefix read while looking for a mosaic JPEG's scan header.
const MAX_HEADER_PREFIX: usize = 4 * 1024 * 1024;

/// Power-of-two divisors tried for derived levels.
const SCALE_DENOMS: [u32; 3] = [2, 4, 8];

// =============================================================================
// Detection
// =============================================================================

/// Probe a path as a VMS key file.
///
/// `.vmu` key files (the uncompressed variant) are recognized but
/// unsupported; the error names them so the caller sees more than a
/// generic rejection.
pub(crate) async fn detect(path: &Path) -> Result<bool, SlideError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "vms" => {
            let bytes = tokio::fs::read(path).await.map_err(IoError::from)?;
            Ok(VmsKeyFile::looks_like_vms(&String::from_utf8_lossy(&bytes)))
        }
        "vmu" => Err(SlideError::unsupported(
            "Hamamatsu VMU uncompressed slides are not supported",
        )),
        _ => Ok(false),
    }
}

// =============================================================================
// VmsBackend
// =============================================================================

/// Header bytes of one mosaic piece, kept for tile-stream synthesis.
struct PieceInfo {
    header: Bytes,
}

enum VmsSource {
    /// Tiles come from the level-0 mosaic, shrunk by `scale_denom`
    Mosaic { scale_denom: u32 },

    /// The whole map JPEG is this level's single tile
    Map,
}

struct VmsLevelState {
    grid: SimpleGrid,
    downsample: f64,
    source: VmsSource,
}

pub(crate) struct VmsBackend {
    handles: SharedHandleCache,

    /// Mosaic pieces in row-major key-file order, shared with the worker
    files: Arc<Vec<IndexedJpeg>>,
    pieces: Vec<PieceInfo>,

    map_path: PathBuf,
    map_width: u32,
    map_height: u32,

    /// Mosaic columns of JPEG files
    num_cols: u32,

    /// Tiles per piece in each axis
    piece_tiles_x: u32,
    piece_tiles_y: u32,

    /// Full-resolution tile size
    tile_width: u32,
    tile_height: u32,

    levels: Vec<VmsLevelState>,
    cache: Arc<TileCache>,
    worker: MarkerWorker,
}

impl VmsBackend {
    /// Open a detected VMS key file and its mosaic.
    pub(crate) async fn open(
        path: &Path,
        cache: Arc<TileCache>,
    ) -> Result<super::backend::OpenedSlide, SlideError> {
        let bytes = tokio::fs::read(path).await.map_err(IoError::from)?;
        let key_file = VmsKeyFile::parse(&String::from_utf8_lossy(&bytes))?;

        if key_file.num_layers != 1 {
            return Err(SlideError::unsupported(format!(
                "{} focal layers; only single-layer slides are supported",
                key_file.num_layers
            )));
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let handles: SharedHandleCache = Arc::new(FileHandleCache::new());

        // Parse every mosaic piece's header; all pieces must agree on
        // their geometry
        let mut files = Vec::new();
        let mut pieces = Vec::new();
        let mut piece_info: Option<JpegStreamInfo> = None;

        for row in 0..key_file.num_rows {
            for col in 0..key_file.num_cols {
                let name = key_file.image_file(col, row).ok_or_else(|| {
                    SlideError::bad_data(format!("mosaic piece ({col},{row}) is not listed"))
                })?;
                let piece_path = dir.join(name);
                let reader = handles.checkout(&piece_path).await.map_err(SlideError::Io)?;
                let (info, header) = parse_piece_header(&reader).await?;

                match piece_info {
                    None => piece_info = Some(info),
                    Some(first) => {
                        if info.width != first.width
                            || info.height != first.height
                            || info.restart_interval != first.restart_interval
                            || info.mcu_width != first.mcu_width
                            || info.mcu_height != first.mcu_height
                        {
                            return Err(SlideError::bad_data(format!(
                                "mosaic piece ({col},{row}) geometry differs from the first piece"
                            )));
                        }
                    }
                }

                let tile_count = piece_tile_count(&info)?;
                files.push(IndexedJpeg {
                    path: piece_path,
                    index: Mutex::new(JpegTileIndex::new(
                        tile_count as usize,
                        info.entropy_start,
                    )),
                });
                pieces.push(PieceInfo { header });
            }
        }

        let info = piece_info.ok_or_else(|| SlideError::bad_data("mosaic has no pieces"))?;
        let (piece_tiles_x, piece_tiles_y) = piece_tile_grid(&info)?;
        let (tile_width, tile_height) = piece_tile_size(&info);

        // Optimisation file: unreliable per-tile marker offsets
        if let Some(opt_name) = &key_file.optimisation_file {
            match load_hints(&dir.join(opt_name), &files).await {
                Ok(()) => {}
                Err(e) => warn!(error = %e, "ignoring unreadable optimisation file"),
            }
        }

        // Map JPEG becomes its own level
        let map_name = key_file
            .map_file
            .as_deref()
            .ok_or_else(|| SlideError::bad_data("key file has no map image"))?;
        let map_path = dir.join(map_name);
        let map_reader = handles.checkout(&map_path).await.map_err(SlideError::Io)?;
        let (map_info, _) = parse_piece_header(&map_reader).await?;

        let width0 = info.width * key_file.num_cols;
        let height0 = info.height * key_file.num_rows;

        // Level candidates: the mosaic, derived power-of-two shrinks of
        // it, and the map; sorted by downsample afterwards
        let mut candidates: Vec<(u32, u32, u32, u32, VmsSource)> = Vec::new();
        candidates.push((
            width0,
            height0,
            tile_width,
            tile_height,
            VmsSource::Mosaic { scale_denom: 1 },
        ));
        for denom in SCALE_DENOMS {
            if tile_width % denom == 0 && tile_height % denom == 0 {
                candidates.push((
                    width0 / denom,
                    height0 / denom,
                    tile_width / denom,
                    tile_height / denom,
                    VmsSource::Mosaic { scale_denom: denom },
                ));
            }
        }
        candidates.push((
            map_info.width,
            map_info.height,
            map_info.width,
            map_info.height,
            VmsSource::Map,
        ));

        candidates.sort_by(|a, b| {
            let area_a = (a.0 as u64) * (a.1 as u64);
            let area_b = (b.0 as u64) * (b.1 as u64);
            area_b.cmp(&area_a)
        });

        let dims: Vec<(u32, u32)> = candidates.iter().map(|c| (c.0, c.1)).collect();
        let downsamples = compute_downsamples(&dims)?;

        let tiles_x = piece_tiles_x * key_file.num_cols;
        let tiles_y = piece_tiles_y * key_file.num_rows;

        let mut levels = Vec::new();
        let mut infos = Vec::new();
        for (i, (w, h, tw, th, source)) in candidates.into_iter().enumerate() {
            let grid = match source {
                VmsSource::Mosaic { .. } => {
                    SimpleGrid::new(tiles_x, tiles_y, tw as f64, th as f64)
                }
                VmsSource::Map => SimpleGrid::new(1, 1, tw as f64, th as f64),
            };
            infos.push(LevelInfo {
                width: w,
                height: h,
                tile_width: tw as f64,
                tile_height: th as f64,
                downsample: downsamples[i],
            });
            levels.push(VmsLevelState {
                grid,
                downsample: downsamples[i],
                source,
            });
        }

        // Associated macro photograph
        let mut associated = BTreeMap::new();
        if let Some(macro_name) = &key_file.macro_image {
            match load_macro(&handles, &dir.join(macro_name)).await {
                Ok(image) => {
                    associated.insert("macro".to_string(), image);
                }
                Err(e) => warn!(error = %e, "skipping undecodable macro image"),
            }
        }

        // Properties
        let mut properties = BTreeMap::new();
        properties.insert(PROP_VENDOR.to_string(), "hamamatsu".to_string());
        if let Some(mpp) = key_file.mpp_x(width0) {
            properties.insert(PROP_MPP_X.to_string(), format_number(mpp));
        }
        if let Some(mpp) = key_file.mpp_y(height0) {
            properties.insert(PROP_MPP_Y.to_string(), format_number(mpp));
        }
        if let Some(lens) = key_file.source_lens {
            properties.insert(PROP_OBJECTIVE_POWER.to_string(), format_number(lens));
        }
        for (key, value) in &key_file.properties {
            properties.insert(format!("hamamatsu.{key}"), value.clone());
        }

        let files = Arc::new(files);
        let worker = MarkerWorker::spawn(Arc::clone(&files), Arc::clone(&handles));

        debug!(
            pieces = pieces.len(),
            levels = levels.len(),
            tile_width,
            tile_height,
            "opened VMS slide"
        );

        Ok(super::backend::OpenedSlide {
            levels: infos,
            properties,
            associated,
            background: 0xFFFFFF,
            backend: super::backend::Backend::Vms(VmsBackend {
                handles,
                files,
                pieces,
                map_path,
                map_width: map_info.width,
                map_height: map_info.height,
                num_cols: key_file.num_cols,
                piece_tiles_x,
                piece_tiles_y,
                tile_width,
                tile_height,
                levels,
                cache,
                worker,
            }),
        })
    }

    /// Paint a level-0 rectangle of `level` onto a level-space surface.
    ///
    /// The background indexer is paused for the duration of the paint.
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

        self.worker.pause();
        let painter = VmsPainter {
            backend: self,
            level,
        };
        let ds = state.downsample;
        let result = state
            .grid
            .paint_region(surface, &painter, x / ds, y / ds, w, h)
            .await;
        self.worker.resume();
        result
    }

    /// Stop the background worker; called from slide close.
    pub(crate) async fn close(&self) {
        self.worker.shutdown().await;
        self.handles.clear().await;
    }

    /// Decode (or fetch from cache) one tile of a mosaic-backed level.
    async fn mosaic_tile(
        &self,
        level: usize,
        scale_denom: u32,
        col: u32,
        row: u32,
    ) -> Result<TileHandle, SlideError> {
        let key = TileKey::new(level as u32, col, row);
        if let Some(handle) = self.cache.get(&key).await {
            return Ok(handle);
        }

        let piece_col = col / self.piece_tiles_x;
        let piece_row = row / self.piece_tiles_y;
        let in_col = col % self.piece_tiles_x;
        let in_row = row % self.piece_tiles_y;
        let piece = (piece_row * self.num_cols + piece_col) as usize;
        let tileno = (in_row * self.piece_tiles_x + in_col) as usize;

        let file = &self.files[piece];
        let reader = self
            .handles
            .checkout(&file.path)
            .await
            .map_err(SlideError::Io)?;

        // Readers take the index lock exclusively; the background worker
        // only uses try_lock, so this never waits on a scan in progress
        self.worker.touch();
        let (start, end) = {
            let mut index = file.index.lock().await;
            index.segment(&reader, tileno).await?
        };

        let entropy = reader
            .read_exact_at(start, (end - start) as usize)
            .await
            .map_err(SlideError::Io)?;

        let stream = build_tile_stream(
            &self.pieces[piece].header,
            &entropy,
            self.tile_width,
            self.tile_height,
        );
        let mut pixels = decode_jpeg(&stream, self.tile_width, self.tile_height)?;
        let (mut out_w, mut out_h) = (self.tile_width, self.tile_height);

        if scale_denom > 1 {
            pixels = shrink_argb(&pixels, out_w, out_h, scale_denom);
            out_w /= scale_denom;
            out_h /= scale_denom;
        }

        Ok(self
            .cache
            .put(key, TilePixels::new(pixels, out_w, out_h))
            .await)
    }

    /// Decode (or fetch from cache) the map level's single tile.
    async fn map_tile(&self, level: usize) -> Result<TileHandle, SlideError> {
        let key = TileKey::new(level as u32, 0, 0);
        if let Some(handle) = self.cache.get(&key).await {
            return Ok(handle);
        }

        let reader = self
            .handles
            .checkout(&self.map_path)
            .await
            .map_err(SlideError::Io)?;
        let data = reader
            .read_exact_at(0, reader.size() as usize)
            .await
            .map_err(SlideError::Io)?;

        let pixels = decode_jpeg(&data, self.map_width, self.map_height)?;
        Ok(self
            .cache
            .put(key, TilePixels::new(pixels, self.map_width, self.map_height))
            .await)
    }
}

struct VmsPainter<'a> {
    backend: &'a VmsBackend,
    level: usize,
}

#[async_trait]
impl TilePainter for VmsPainter<'_> {
    type Tile = ();

    async fn paint_tile(
        &self,
        surface: &mut Surface<'_>,
        _tile: &(),
        col: i64,
        row: i64,
    ) -> Result<(), SlideError> {
        let state = &self.backend.levels[self.level];
        let pixels = match state.source {
            VmsSource::Mosaic { scale_denom } => {
                self.backend
                    .mosaic_tile(self.level, scale_denom, col as u32, row as u32)
                    .await?
            }
            VmsSource::Map => self.backend.map_tile(self.level).await?,
        };
        surface.paint_image(&pixels.data, pixels.width, pixels.height);
        Ok(())
    }
}

// =============================================================================
// Piece geometry
// =============================================================================

/// Tile grid within one piece: restart intervals across, MCU rows down.
fn piece_tile_grid(info: &JpegStreamInfo) -> Result<(u32, u32), SlideError> {
    if info.restart_interval == 0 {
        return Ok((1, 1));
    }
    let mcus_across = info.mcus_across();
    if mcus_across % info.restart_interval != 0 {
        return Err(SlideError::bad_data(format!(
            "restart interval {} does not divide the {} MCU row",
            info.restart_interval, mcus_across
        )));
    }
    Ok((mcus_across / info.restart_interval, info.mcus_down()))
}

/// Pixel size of one tile within a piece.
fn piece_tile_size(info: &JpegStreamInfo) -> (u32, u32) {
    if info.restart_interval == 0 {
        return (info.width, info.height);
    }
    (info.restart_interval * info.mcu_width, info.mcu_height)
}

fn piece_tile_count(info: &JpegStreamInfo) -> Result<u32, SlideError> {
    let (tx, ty) = piece_tile_grid(info)?;
    let (tw, th) = piece_tile_size(info);
    if info.width % tw != 0 || info.height % th != 0 {
        return Err(SlideError::bad_data(format!(
            "piece dimensions {}x{} are not a whole number of {}x{} tiles",
            info.width, info.height, tw, th
        )));
    }
    Ok(tx * ty)
}

/// Read a piece's header: stream facts plus the raw bytes through the
/// start-of-scan segment.
async fn parse_piece_header<R: RangeReader>(
    reader: &R,
) -> Result<(JpegStreamInfo, Bytes), SlideError> {
    let mut prefix_len = 16 * 1024;
    loop {
        let prefix = reader
            .read_at_most(0, prefix_len)
            .await
            .map_err(SlideError::Io)?;
        match JpegStreamInfo::parse(&prefix)? {
            Some(info) => {
                let header = prefix.slice(0..info.entropy_start as usize);
                return Ok((info, header));
            }
            None => {
                if prefix.len() as u64 >= reader.size() {
                    return Err(SlideError::bad_data(
                        "JPEG ends before its start-of-scan segment",
                    ));
                }
                if prefix_len >= MAX_HEADER_PREFIX {
                    return Err(SlideError::bad_data(format!(
                        "no start-of-scan segment in the first {MAX_HEADER_PREFIX} bytes"
                    )));
                }
                prefix_len *= 4;
            }
        }
    }
}

/// Load an optimisation file and distribute its offsets as index hints.
///
/// The file is a flat array of little-endian u32 candidate offsets, one
/// per tile slot, pieces in key-file order; `0` and `0xFFFFFFFF` mean "no
/// hint". Offsets are verified against marker bytes before use, so a
/// stale file degrades to a plain scan.
async fn load_hints(path: &Path, files: &[IndexedJpeg]) -> Result<(), SlideError> {
    let bytes = tokio::fs::read(path).await.map_err(IoError::from)?;
    let mut values = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));

    for file in files {
        let mut index = file.index.lock().await;
        let count = index.tile_count();
        let hints: Vec<i64> = (0..count)
            .map(|_| match values.next() {
                Some(0) | Some(u32::MAX) | None => -1,
                Some(v) => v as i64,
            })
            .collect();
        index.set_hints(hints);
    }

    Ok(())
}

/// Decode the macro photograph.
async fn load_macro(
    handles: &SharedHandleCache,
    path: &Path,
) -> Result<AssociatedImage, SlideError> {
    let reader = handles.checkout(path).await.map_err(SlideError::Io)?;
    let data = reader
        .read_exact_at(0, reader.size() as usize)
        .await
        .map_err(SlideError::Io)?;
    let (argb, width, height) = decode_jpeg_image(&data)?;
    Ok(AssociatedImage {
        width,
        height,
        argb,
    })
}

// =============================================================================
// Tests
// =============================================================================
