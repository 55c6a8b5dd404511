//! Tile cache for decoded ARGB tiles.
//!
//! Decoded tiles are the unit of caching: a region read touching a tile
//! that is resident skips file I/O and the codec entirely.
//!
//! # Cache Key
//!
//! Tiles are cached per slide by `(level, col, row)`.
//!
//! # Pinning and Eviction
//!
//! `get`/`put` hand out shared handles that pin the buffer: a pinned entry
//! is never freed under a reader. Eviction runs on insert, walking entries
//! in least-recently-used order until the byte budget is met. A pinned
//! entry selected as the victim is doomed instead: it leaves the LRU order
//! but stays resident, and is freed on a later insert once every handle is
//! gone.
//!
//! `put` on an existing key is a no-op returning the resident buffer:
//! first writer wins, so two tasks decoding the same tile concurrently
//! converge on one copy.

use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;

/// Default cache budget: 64MB of decoded pixels.
pub const DEFAULT_CACHE_BUDGET: usize = 64 * 1024 * 1024;

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key for decoded tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Pyramid level (0 = highest resolution)
    pub level: u32,

    /// Tile column (0-indexed from left)
    pub col: u32,

    /// Tile row (0-indexed from top)
    pub row: u32,
}

impl TileKey {
    /// Create a new cache key.
    pub fn new(level: u32, col: u32, row: u32) -> Self {
        Self { level, col, row }
    }
}

// =============================================================================
// TilePixels
// =============================================================================

/// A decoded tile: packed ARGB pixels plus dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePixels {
    /// Row-major `0xAARRGGBB` pixels
    pub data: Vec<u32>,

    /// Tile width in pixels
    pub width: u32,

    /// Tile height in pixels
    pub height: u32,
}

impl TilePixels {
    /// Wrap decoded pixels.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn new(data: Vec<u32>, width: u32, height: u32) -> Self {
        assert_eq!(data.len(), (width as usize) * (height as usize));
        Self {
            data,
            width,
            height,
        }
    }

    /// Byte footprint used for eviction accounting.
    pub fn byte_size(&self) -> usize {
        self.data.len() * 4
    }
}

/// Shared handle to a resident tile. Holding one pins the buffer.
pub type TileHandle = Arc<TilePixels>;

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheInner {
    /// Entries in recency order
    lru: LruCache<TileKey, TileHandle>,

    /// Byte total of `lru` entries
    lru_bytes: usize,

    /// Victims that were pinned at eviction time; resident until released
    doomed: Vec<(TileKey, TileHandle)>,

    /// Byte total of doomed entries
    doomed_bytes: usize,
}

impl CacheInner {
    /// Drop doomed entries whose last outside handle is gone.
    fn sweep_doomed(&mut self) {
        let mut freed = 0usize;
        self.doomed.retain(|(key, handle)| {
            if Arc::strong_count(handle) == 1 {
                freed += handle.byte_size();
                trace!(?key, "released doomed tile");
                false
            } else {
                true
            }
        });
        self.doomed_bytes -= freed;
    }
}

/// Byte-budgeted LRU cache of decoded tiles with refcounted pinning.
///
/// Shared across every reader of one slide; all operations are internally
/// synchronized. Decoding happens outside the cache lock.
pub struct TileCache {
    inner: Mutex<CacheInner>,
    budget: usize,
}

impl TileCache {
    /// Create a cache with the default byte budget.
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_CACHE_BUDGET)
    }

    /// Create a cache with a byte budget.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                lru_bytes: 0,
                doomed: Vec::new(),
                doomed_bytes: 0,
            }),
            budget,
        }
    }

    /// Look up a tile, refreshing its recency.
    ///
    /// The returned handle pins the buffer until dropped.
    pub async fn get(&self, key: &TileKey) -> Option<TileHandle> {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.lru.get(key) {
            return Some(Arc::clone(handle));
        }
        // Doomed entries are still resident and readable
        inner
            .doomed
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, handle)| Arc::clone(handle))
    }

    /// Insert a decoded tile, returning a pinned handle.
    ///
    /// If the key is already resident (in the LRU or doomed), the existing
    /// buffer is returned and `pixels` is discarded: first writer wins.
    /// Otherwise the tile is inserted and unpinned entries are evicted in
    /// LRU order until the budget is met; pinned victims are doomed rather
    /// than freed.
    pub async fn put(&self, key: TileKey, pixels: TilePixels) -> TileHandle {
        let mut inner = self.inner.lock().await;

        // Entries released since the last insert can now be freed
        inner.sweep_doomed();

        if let Some(existing) = inner.lru.get(&key) {
            return Arc::clone(existing);
        }
        if let Some((_, existing)) = inner.doomed.iter().find(|(k, _)| k == &key) {
            return Arc::clone(existing);
        }

        let size = pixels.byte_size();
        let handle: TileHandle = Arc::new(pixels);
        inner.lru.put(key, Arc::clone(&handle));
        inner.lru_bytes += size;

        while inner.lru_bytes > self.budget {
            let Some((victim_key, victim)) = inner.lru.pop_lru() else {
                break;
            };
            let victim_size = victim.byte_size();
            inner.lru_bytes -= victim_size;

            // Map reference + our locals; anything beyond means a reader
            // still holds the buffer
            if Arc::strong_count(&victim) > 1 {
                trace!(key = ?victim_key, "doomed pinned tile for later eviction");
                inner.doomed_bytes += victim_size;
                inner.doomed.push((victim_key, victim));
            }
        }

        handle
    }

    /// Number of resident tiles, including doomed ones.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.lru.len() + inner.doomed.len()
    }

    /// Whether the cache holds no tiles.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resident bytes, including doomed entries.
    pub async fn resident_bytes(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.lru_bytes + inner.doomed_bytes
    }

    /// Drop every entry. Buffers pinned by outstanding handles stay alive
    /// until those handles are dropped, but are no longer reachable.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.lru.clear();
        inner.lru_bytes = 0;
        inner.doomed.clear();
        inner.doomed_bytes = 0;
    }

    /// Configured byte budget.
    pub fn budget(&self) -> usize {
        self.budget
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
