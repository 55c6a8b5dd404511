//! # WSI Reader
//!
//! A read-only library for whole-slide microscopy images: multi-gigapixel,
//! multi-resolution, tile-based images in vendor-specific containers.
//!
//! The library exposes one uniform operation over every format: give me a
//! rectangle of ARGB pixels at resolution level L. Files far too large to
//! hold in memory are served through a tile pipeline with bounded caching,
//! so viewers can pan and zoom freely.
//!
//! ## Supported formats
//!
//! - **Aperio SVS**: tiled TIFF with abbreviated JPEG or JPEG 2000 tiles
//! - **Trestle**: tiled TIFF with overlapping tiles
//! - **Generic pyramidal TIFF**: any tiled multi-resolution TIFF
//! - **Hamamatsu VMS**: a mosaic of monolithic JPEGs addressed through
//!   restart markers, with a background indexing worker
//! - **InteMedic .tron**: a Zip64 container of JPEG tiles with
//!   AES-encrypted metadata
//!
//! ## Architecture
//!
//! - [`io`] - positional readers over files and a bounded handle pool
//! - [`mod@format`] - TIFF, key-file, and container-metadata parsers
//! - [`codec`] - JPEG, JPEG 2000, ZIP, and crypto adapters
//! - [`tile`] - cache, grids, surface, and the restart-marker indexer
//! - [`slide`] - the public handle and the open dispatcher
//!
//! ## Example
//!
//! ```rust,no_run
//! use wsi_reader::Slide;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wsi_reader::SlideError> {
//!     let slide = Slide::open("specimen.svs").await?;
//!
//!     let (width, height) = slide.dimensions();
//!     println!("{} x {}, {} levels", width, height, slide.level_count());
//!
//!     // Read a 512x512 region from the best level for a 4x zoom-out
//!     let level = slide.best_level_for_downsample(4.0);
//!     let mut buffer = vec![0u8; 512 * 512 * 4];
//!     slide.read_region(&mut buffer, 0, 0, level, 512, 512).await?;
//!
//!     slide.close().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod format;
pub mod io;
pub mod slide;
pub mod tile;

// Re-export commonly used types
pub use error::{IoError, SlideError, TiffError, ZipError};
pub use format::{is_tiff_header, is_zip_header, SlideFormat};
pub use slide::{
    can_open, open, AssociatedImage, LevelInfo, Slide, PROP_BACKGROUND_COLOR, PROP_MPP_X,
    PROP_MPP_Y, PROP_OBJECTIVE_POWER, PROP_VENDOR,
};
pub use tile::{TileCache, TileKey, TilePixels, DEFAULT_CACHE_BUDGET};
