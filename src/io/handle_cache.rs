//! Bounded cache of open file handles.
//!
//! Some containers are file-sets rather than single files: a Hamamatsu
//! mosaic can reference dozens of JPEG files, and each region read may
//! touch several of them. Keeping every file open for the slide's lifetime
//! would exhaust descriptor limits when many slides are open, so handles
//! are pooled with LRU eviction.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::IoError;

use super::file_reader::FileRangeReader;

/// Default number of simultaneously open handles per slide.
const DEFAULT_MAX_OPEN: usize = 32;

/// LRU pool of open file handles keyed by path.
///
/// `checkout` returns a shared reader; the pool may close the underlying
/// descriptor later, but a checked-out reader stays valid until the last
/// clone is dropped. Safe for concurrent checkout from multiple tasks.
#[derive(Debug)]
pub struct FileHandleCache {
    handles: Mutex<LruCache<PathBuf, FileRangeReader>>,
}

impl FileHandleCache {
    /// Create a pool with the default handle budget.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_OPEN)
    }

    /// Create a pool that keeps at most `max_open` descriptors open.
    pub fn with_capacity(max_open: usize) -> Self {
        let cap = NonZeroUsize::new(max_open.max(1)).unwrap();
        Self {
            handles: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Get a reader for `path`, opening the file if it is not pooled.
    ///
    /// Opening a file evicts the least-recently-used handle when the pool
    /// is full; evicted descriptors close once no reader clone remains.
    pub async fn checkout(&self, path: &Path) -> Result<FileRangeReader, IoError> {
        {
            let mut handles = self.handles.lock().await;
            if let Some(reader) = handles.get(path) {
                return Ok(reader.clone());
            }
        }

        // Open outside the lock; a concurrent checkout of the same path may
        // also open, and the second insert simply refreshes the slot.
        let reader = FileRangeReader::open(path).await?;
        trace!(path = %path.display(), "opened slide file handle");

        let mut handles = self.handles.lock().await;
        handles.put(path.to_owned(), reader.clone());
        Ok(reader)
    }

    /// Number of currently pooled handles.
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Whether the pool holds no handles.
    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }

    /// Drop every pooled handle.
    pub async fn clear(&self) {
        self.handles.lock().await.clear();
    }
}

impl Default for FileHandleCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared pool handle.
pub type SharedHandleCache = Arc<FileHandleCache>;
