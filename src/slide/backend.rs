//! Backend dispatch and shared open plumbing.
//!
//! Backends are a small closed roster, so dispatch is a tagged enum rather
//! than trait objects: each variant wires `paint_region` and `close` to
//! its engine.

use std::collections::BTreeMap;

use crate::error::SlideError;
use crate::tile::Surface;

use super::tiff::TiffBackend;
use super::tron::TronBackend;
use super::vms::VmsBackend;

// =============================================================================
// Public level and image data
// =============================================================================

/// Geometry of one pyramid level as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelInfo {
    /// Level width in pixels
    pub width: u32,

    /// Level height in pixels
    pub height: u32,

    /// Nominal tile width in level pixels.
    ///
    /// Fractional values are legal: overlapping tiles advance by less than
    /// their pixel footprint.
    pub tile_width: f64,

    /// Nominal tile height in level pixels
    pub tile_height: f64,

    /// Downsample factor relative to level 0 (1.0 for level 0)
    pub downsample: f64,
}

/// A named companion image (thumbnail, label, macro, ...), decoded at open.
#[derive(Debug, Clone)]
pub struct AssociatedImage {
    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Row-major packed `0xAARRGGBB` pixels
    pub argb: Vec<u32>,
}

// =============================================================================
// Backend
// =============================================================================

/// Everything a backend's open produces.
pub(crate) struct OpenedSlide {
    pub levels: Vec<LevelInfo>,
    pub properties: BTreeMap<String, String>,
    pub associated: BTreeMap<String, AssociatedImage>,

    /// Background fill as packed RGB
    pub background: u32,

    pub backend: Backend,
}

/// Tagged backend dispatch.
pub(crate) enum Backend {
    Tiff(TiffBackend),
    Vms(VmsBackend),
    Tron(TronBackend),
}

impl Backend {
    /// Paint the region `(x, y, w, h)` (level-0 coordinates) of `level`
    /// onto a surface already transformed to level pixels.
    pub(crate) async fn paint_region(
        &self,
        surface: &mut Surface<'_>,
        x: f64,
        y: f64,
        level: usize,
        w: u32,
        h: u32,
    ) -> Result<(), SlideError> {
        match self {
            Backend::Tiff(backend) => backend.paint_region(surface, x, y, level, w, h).await,
            Backend::Vms(backend) => backend.paint_region(surface, x, y, level, w, h).await,
            Backend::Tron(backend) => backend.paint_region(surface, x, y, level, w, h).await,
        }
    }

    /// Release backend resources; waits for background work to stop.
    pub(crate) async fn close(&self) {
        match self {
            Backend::Tiff(_) => {}
            Backend::Vms(backend) => backend.close().await,
            Backend::Tron(_) => {}
        }
    }
}

// =============================================================================
// Downsample computation
// =============================================================================

/// Compute per-level downsample factors from level dimensions.
///
/// Level 0 is 1.0 by definition; other levels use the arithmetic mean of
/// the width and height ratios. Factors must be monotonically
/// non-decreasing or the pyramid is rejected.
pub(crate) fn compute_downsamples(dims: &[(u32, u32)]) -> Result<Vec<f64>, SlideError> {
    let Some(&(w0, h0)) = dims.first() else {
        return Err(SlideError::bad_data("slide has no pyramid levels"));
    };
    if w0 == 0 || h0 == 0 {
        return Err(SlideError::bad_data("level 0 has empty dimensions"));
    }

    let mut downsamples = Vec::with_capacity(dims.len());
    downsamples.push(1.0f64);

    for (i, &(w, h)) in dims.iter().enumerate().skip(1) {
        if w == 0 || h == 0 {
            return Err(SlideError::bad_data(format!(
                "level {i} has empty dimensions"
            )));
        }
        let downsample = (w0 as f64 / w as f64 + h0 as f64 / h as f64) / 2.0;
        if downsample < downsamples[i - 1] {
            return Err(SlideError::bad_data(format!(
                "downsample decreases at level {i}: {} after {}",
                downsample,
                downsamples[i - 1]
            )));
        }
        downsamples.push(downsample);
    }

    Ok(downsamples)
}
