//! The tile-serving pipeline.
//!
//! Region reads flow through here: the grid finds intersecting tiles, the
//! cache serves decoded pixels (or the backend decodes on a miss), and the
//! surface composes everything into the caller's buffer. The restart
//! module adds random access inside monolithic mosaic JPEGs.

pub mod cache;
pub mod grid;
pub mod restart;
pub mod surface;

pub use cache::{TileCache, TileHandle, TileKey, TilePixels, DEFAULT_CACHE_BUDGET};
pub use grid::{SimpleGrid, TilemapGrid, TilePainter};
pub use restart::{IndexedJpeg, JpegTileIndex, MarkerWorker, WorkerState, RESUME_IDLE};
pub use surface::{Operator, Surface};
