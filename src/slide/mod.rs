//! The slide handle and the open dispatcher.
//!
//! [`Slide::open`] probes the registered backends in order (Hamamatsu key
//! file, InteMedic container, TIFF flavors); the first whose detect claims
//! the file runs its open. A failed open is final for that backend but the
//! remaining backends still get a chance, so a miscategorized file
//! degrades to the next plausible reader instead of an immediate error.
//!
//! After a successful open the handle is immutable and safe to share
//! across tasks; concurrent `read_region` calls are supported. Errors
//! inside a region read are sticky: once one occurs, every later read
//! fails with it.

mod backend;
mod properties;
mod tiff;
mod tron;
mod vms;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::SlideError;
use crate::format::is_tiff_header;
use crate::io::{FileRangeReader, RangeReader};
use crate::tile::{Surface, TileCache, DEFAULT_CACHE_BUDGET};

use backend::{Backend, OpenedSlide};

pub use backend::{AssociatedImage, LevelInfo};
pub use properties::{
    PROP_BACKGROUND_COLOR, PROP_MPP_X, PROP_MPP_Y, PROP_OBJECTIVE_POWER, PROP_VENDOR,
};

// =============================================================================
// Free functions
// =============================================================================

/// Open a slide, detecting its format.
pub async fn open(path: impl AsRef<Path>) -> Result<Slide, SlideError> {
    Slide::open(path).await
}

/// Check whether a file is recognizable as a slide, without opening it.
///
/// Runs only the cheap detect phase of each backend.
pub async fn can_open(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();

    if matches!(vms::detect(path).await, Ok(true)) {
        return true;
    }

    let Ok(reader) = FileRangeReader::open(path).await else {
        return false;
    };
    if matches!(tron::detect(path, &reader).await, Ok(true)) {
        return true;
    }

    let Ok(magic) = reader.read_at_most(0, 16).await else {
        return false;
    };
    magic.len() >= 8 && is_tiff_header(&magic) && matches!(tiff::detect(&reader).await, Ok(Some(_)))
}

// =============================================================================
// Slide
// =============================================================================

/// An open whole-slide image.
///
/// Owns the level table, property map, associated images, the decoded-tile
/// cache, and the backend. Closing stops background work; dropping without
/// closing signals it to stop without waiting.
pub struct Slide {
    levels: Vec<LevelInfo>,
    properties: BTreeMap<String, String>,
    associated: BTreeMap<String, AssociatedImage>,

    /// Background fill, packed opaque ARGB
    background: u32,

    cache: Arc<TileCache>,
    backend: Backend,

    /// First region-read error; once set, every later read fails with it
    sticky: Mutex<Option<SlideError>>,
}

impl Slide {
    /// Open a slide with the default cache budget.
    pub async fn open(path: impl AsRef<Path>) -> Result<Slide, SlideError> {
        Self::open_with_cache_budget(path, DEFAULT_CACHE_BUDGET).await
    }

    /// Open a slide with an explicit decoded-tile cache budget in bytes.
    pub async fn open_with_cache_budget(
        path: impl AsRef<Path>,
        budget: usize,
    ) -> Result<Slide, SlideError> {
        let path = path.as_ref();
        let cache = Arc::new(TileCache::with_budget(budget));
        let mut last_error: Option<SlideError> = None;

        // Hamamatsu key files: a cheap text probe
        match vms::detect(path).await {
            Ok(true) => match vms::VmsBackend::open(path, Arc::clone(&cache)).await {
                Ok(opened) => return Self::assemble(opened, cache),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "VMS backend failed to open");
                    last_error = Some(e);
                }
            },
            Ok(false) => {}
            Err(e) => last_error = Some(e),
        }

        // Binary probes share one open file
        let reader = FileRangeReader::open(path).await.map_err(SlideError::Io)?;

        match tron::detect(path, &reader).await {
            Ok(true) => match tron::TronBackend::open(reader.clone(), Arc::clone(&cache)).await {
                Ok(opened) => return Self::assemble(opened, cache),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "tron backend failed to open");
                    last_error = last_error.or(Some(e));
                }
            },
            Ok(false) => {}
            Err(e) => last_error = last_error.or(Some(e)),
        }

        let magic = reader.read_at_most(0, 16).await.map_err(SlideError::Io)?;
        if magic.len() >= 8 && is_tiff_header(&magic) {
            match tiff::detect(&reader).await {
                Ok(Some(format)) => {
                    debug!(path = %path.display(), format = format.name(), "detected TIFF slide");
                    match tiff::TiffBackend::open(reader, format, Arc::clone(&cache)).await {
                        Ok(opened) => return Self::assemble(opened, cache),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e,
                                  "TIFF backend failed to open");
                            last_error = last_error.or(Some(e));
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => last_error = last_error.or(Some(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SlideError::unsupported(format!(
                "{} is not a recognized slide format",
                path.display()
            ))
        }))
    }

    fn assemble(opened: OpenedSlide, cache: Arc<TileCache>) -> Result<Slide, SlideError> {
        if opened.levels.is_empty() {
            return Err(SlideError::bad_data("slide has no pyramid levels"));
        }

        Ok(Slide {
            levels: opened.levels,
            properties: opened.properties,
            associated: opened.associated,
            background: 0xFF00_0000 | opened.background,
            cache,
            backend: opened.backend,
            sticky: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Geometry
    // -------------------------------------------------------------------------

    /// Number of pyramid levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Dimensions of the full-resolution level.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.levels[0].width, self.levels[0].height)
    }

    /// Dimensions of a level, or `None` out of range.
    pub fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.levels.get(level).map(|l| (l.width, l.height))
    }

    /// Downsample factor of a level, or `None` out of range.
    pub fn level_downsample(&self, level: usize) -> Option<f64> {
        self.levels.get(level).map(|l| l.downsample)
    }

    /// All level geometry, finest first.
    pub fn levels(&self) -> &[LevelInfo] {
        &self.levels
    }

    /// The largest level whose downsample does not exceed `downsample`,
    /// clamped to level 0.
    pub fn best_level_for_downsample(&self, downsample: f64) -> usize {
        best_level(&self.levels, downsample)
    }

    // -------------------------------------------------------------------------
    // Properties and associated images
    // -------------------------------------------------------------------------

    /// Property keys in sorted order.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Value of a property, or `None` when absent.
    pub fn property_value(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Associated image names in sorted order.
    pub fn associated_image_names(&self) -> impl Iterator<Item = &str> {
        self.associated.keys().map(String::as_str)
    }

    /// Dimensions of an associated image.
    pub fn associated_image_dimensions(&self, name: &str) -> Option<(u32, u32)> {
        self.associated.get(name).map(|img| (img.width, img.height))
    }

    /// An associated image's decoded pixels.
    pub fn read_associated_image(&self, name: &str) -> Option<&AssociatedImage> {
        self.associated.get(name)
    }

    /// Background fill color as packed RGB.
    pub fn background_color(&self) -> u32 {
        self.background & 0x00FF_FFFF
    }

    // -------------------------------------------------------------------------
    // Region reading
    // -------------------------------------------------------------------------

    /// Read a region into a caller-allocated buffer.
    ///
    /// `(x, y)` are level-0 pixel coordinates of the region's top-left
    /// corner; `(w, h)` are the output size in `level` pixels. `dest`
    /// receives ARGB32 pixels (native byte order), row-major, and must be
    /// exactly `w * h * 4` bytes.
    ///
    /// An out-of-range level or non-positive size fills `dest` with the
    /// background color and succeeds. Errors during composition are
    /// sticky: the slide refuses further reads once one occurs.
    pub async fn read_region(
        &self,
        dest: &mut [u8],
        x: i64,
        y: i64,
        level: usize,
        w: i64,
        h: i64,
    ) -> Result<(), SlideError> {
        if let Some(e) = self.sticky.lock().unwrap().clone() {
            return Err(e);
        }

        // Pre-backend validation failures are not errors: the caller gets
        // a background-filled buffer
        if level >= self.levels.len() || w <= 0 || h <= 0 {
            fill_background(dest, self.background);
            return Ok(());
        }
        let (w, h) = (w as u32, h as u32);

        let expected = (w as u64) * (h as u64) * 4;
        if dest.len() as u64 != expected {
            return Err(SlideError::bad_data(format!(
                "destination buffer is {} bytes, expected {expected}",
                dest.len()
            )));
        }

        let ds = self.levels[level].downsample;
        let mut pixels = vec![self.background; (w as usize) * (h as usize)];

        let mut surface = Surface::new(&mut pixels, w, h);
        surface.translate(-(x as f64) / ds, -(y as f64) / ds);

        let result = self
            .backend
            .paint_region(&mut surface, x as f64, y as f64, level, w, h)
            .await;

        match result {
            Ok(()) => {
                // Recursive fills may leave transparency; the background
                // shows through it
                surface.flatten_onto(self.background);
                write_pixels(dest, &pixels);
                Ok(())
            }
            Err(e) => {
                *self.sticky.lock().unwrap() = Some(e.clone());
                // The destination keeps whatever partial composition
                // produced
                write_pixels(dest, &pixels);
                Err(e)
            }
        }
    }

    /// Close the slide, stopping background work and dropping the cache.
    ///
    /// Waits for the background indexer (if any) to observe the stop.
    pub async fn close(self) {
        self.backend.close().await;
        self.cache.clear().await;
    }
}

/// Largest level whose downsample does not exceed the requested factor.
fn best_level(levels: &[LevelInfo], downsample: f64) -> usize {
    levels
        .iter()
        .rposition(|l| l.downsample <= downsample)
        .unwrap_or(0)
}

/// Fill a byte buffer with a packed ARGB color.
fn fill_background(dest: &mut [u8], argb: u32) {
    for chunk in dest.chunks_exact_mut(4) {
        chunk.copy_from_slice(&argb.to_ne_bytes());
    }
}

/// Write packed pixels into the caller's byte buffer.
fn write_pixels(dest: &mut [u8], pixels: &[u32]) {
    for (chunk, pixel) in dest.chunks_exact_mut(4).zip(pixels) {
        chunk.copy_from_slice(&pixel.to_ne_bytes());
    }
}

// =============================================================================
// Tests
// =============================================================================
