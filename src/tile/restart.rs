//! Random-access indexing of monolithic JPEG mosaics.
//!
//! A Hamamatsu mosaic stores one giant JPEG per image file; its restart
//! intervals are the tiles. Decoding tile `t` requires the byte offset of
//! the `t`-th restart marker, which is only discoverable by scanning the
//! entropy stream. The [`JpegTileIndex`] fills those offsets lazily:
//! directly from a verified hint when one exists, otherwise by scanning
//! forward from the closest known offset and committing every marker found
//! on the way.
//!
//! A [`MarkerWorker`] fills the remaining slots in the background so later
//! reads find their offsets precomputed. It cooperates with readers
//! through a RUN/PAUSE/STOP protocol: region paints pause it, and it only
//! touches an index after the foreground has been idle for a beat, with a
//! non-blocking lock acquire so a reader never waits on it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::jpeg::is_restart_code;
use crate::error::SlideError;
use crate::io::{RangeReader, SharedHandleCache};

/// Foreground idle time before the background worker resumes scanning.
pub const RESUME_IDLE: Duration = Duration::from_secs(1);

/// Bytes scanned per chunk read.
const SCAN_CHUNK: usize = 64 * 1024;

/// Marker slots filled per background lock acquisition.
const WORKER_SLOT_BUDGET: usize = 32;

// =============================================================================
// JpegTileIndex
// =============================================================================

/// Lazily filled restart-marker index for one physical JPEG.
///
/// `tile_count + 1` slots: slot `t` holds the offset of tile `t`'s first
/// entropy byte (just past its restart marker), and the final slot holds
/// the offset just past the end-of-image marker. Unknown slots are `-1`.
#[derive(Debug, Clone)]
pub struct JpegTileIndex {
    offsets: Vec<i64>,
    hints: Option<Vec<i64>>,
    tile_count: usize,
}

impl JpegTileIndex {
    /// Create an index for `tile_count` tiles whose first tile starts at
    /// `entropy_start` (the end-of-header position from a header parse).
    pub fn new(tile_count: usize, entropy_start: u64) -> Self {
        let mut offsets = vec![-1i64; tile_count + 1];
        if tile_count > 0 {
            offsets[0] = entropy_start as i64;
        }
        Self {
            offsets,
            hints: None,
            tile_count,
        }
    }

    /// Attach candidate offsets from an optimisation file, one per tile.
    ///
    /// Hints are unreliable: each is verified against the marker bytes
    /// before being committed. Negative values mean "no hint".
    pub fn set_hints(&mut self, hints: Vec<i64>) {
        self.hints = Some(hints);
    }

    /// Number of tiles indexed.
    pub fn tile_count(&self) -> usize {
        self.tile_count
    }

    /// Offset of slot `t`, when already computed.
    pub fn offset(&self, t: usize) -> Option<u64> {
        match self.offsets.get(t) {
            Some(&v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    /// Whether every slot, including the end cap, is filled.
    pub fn is_complete(&self) -> bool {
        self.offsets.iter().all(|&v| v >= 0)
    }

    /// Index of the first unfilled slot.
    pub fn first_unknown(&self) -> Option<usize> {
        self.offsets.iter().position(|&v| v < 0)
    }

    /// Ensure slot `t` is filled and return its offset.
    ///
    /// Calling this twice for the same slot yields the same offset.
    pub async fn compute<R: RangeReader>(
        &mut self,
        reader: &R,
        t: usize,
    ) -> Result<u64, SlideError> {
        if t >= self.offsets.len() {
            return Err(SlideError::bad_data(format!(
                "tile {t} out of range for {}-tile mosaic",
                self.tile_count
            )));
        }
        if let Some(offset) = self.offset(t) {
            return Ok(offset);
        }

        // A verified hint short-circuits the scan. The end cap (t ==
        // tile_count) has no hint; it always comes from finding the EOI.
        if t < self.tile_count {
            if let Some(hint) = self.hint_for(t) {
                if self.verify_marker_at(reader, hint).await? {
                    trace!(tile = t, offset = hint, "committed hinted marker offset");
                    self.offsets[t] = hint as i64;
                    return Ok(hint);
                }
                debug!(tile = t, offset = hint, "rejected unreliable marker hint");
            }
        }

        // Scan forward from the closest known slot below t
        let start = (0..t).rev().find(|&g| self.offsets[g] >= 0).ok_or_else(|| {
            SlideError::bad_data("restart index has no known starting offset")
        })?;
        self.scan_to(reader, start, t).await?;

        self.offset(t)
            .ok_or_else(|| SlideError::bad_data(format!("tile {t} not reached by marker scan")))
    }

    /// Byte range `(start, end)` of tile `t`'s entropy data.
    ///
    /// `end` excludes the following restart marker (or end-of-image).
    pub async fn segment<R: RangeReader>(
        &mut self,
        reader: &R,
        t: usize,
    ) -> Result<(u64, u64), SlideError> {
        if t >= self.tile_count {
            return Err(SlideError::bad_data(format!(
                "tile {t} out of range for {}-tile mosaic",
                self.tile_count
            )));
        }
        let start = self.compute(reader, t).await?;
        let next = self.compute(reader, t + 1).await?;
        // Both the restart markers and the EOI are two bytes before the
        // slot offset
        Ok((start, next - 2))
    }

    /// Fill up to `max_new` unknown slots from the current scan frontier.
    ///
    /// Returns `true` while unfilled slots remain. This is the background
    /// worker's entry point.
    pub async fn advance<R: RangeReader>(
        &mut self,
        reader: &R,
        max_new: usize,
    ) -> Result<bool, SlideError> {
        let Some(first) = self.first_unknown() else {
            return Ok(false);
        };
        let target = (first + max_new.max(1) - 1).min(self.offsets.len() - 1);

        let start = (0..first)
            .rev()
            .find(|&g| self.offsets[g] >= 0)
            .ok_or_else(|| SlideError::bad_data("restart index has no known starting offset"))?;
        self.scan_to(reader, start, target).await?;

        Ok(!self.is_complete())
    }

    fn hint_for(&self, t: usize) -> Option<u64> {
        match self.hints.as_ref()?.get(t) {
            Some(&v) if v >= 2 => Some(v as u64),
            _ => None,
        }
    }

    /// Check that the two bytes before `offset` are a restart marker.
    async fn verify_marker_at<R: RangeReader>(
        &self,
        reader: &R,
        offset: u64,
    ) -> Result<bool, SlideError> {
        if offset < 2 || offset > reader.size() {
            return Ok(false);
        }
        let bytes = reader.read_exact_at(offset - 2, 2).await.map_err(SlideError::Io)?;
        Ok(bytes[0] == 0xFF && is_restart_code(bytes[1]))
    }

    /// Scan forward from known slot `from`, committing every marker found,
    /// until slot `target` is filled.
    ///
    /// Restart markers fill successive tile slots; the end-of-image marker
    /// fills the final cap slot. Entropy byte stuffing (`FF 00`) and fill
    /// bytes are skipped by construction since neither `00` nor `FF` is a
    /// restart code.
    async fn scan_to<R: RangeReader>(
        &mut self,
        reader: &R,
        from: usize,
        target: usize,
    ) -> Result<(), SlideError> {
        let mut slot = from;
        let mut pos = self.offsets[from] as u64;

        while slot < target {
            let chunk = reader
                .read_at_most(pos, SCAN_CHUNK)
                .await
                .map_err(SlideError::Io)?;
            if chunk.len() < 2 {
                return Err(SlideError::bad_data(
                    "mosaic JPEG ended before all restart markers were found",
                ));
            }

            let mut i = 0usize;
            while i + 1 < chunk.len() && slot < target {
                if chunk[i] != 0xFF {
                    i += 1;
                    continue;
                }
                let code = chunk[i + 1];
                if code == 0xFF {
                    // Fill byte; the marker code may follow the run
                    i += 1;
                    continue;
                }
                let after_marker = pos + i as u64 + 2;

                if is_restart_code(code) {
                    // Markers separate tiles, so they may only fill slots
                    // up to the last tile start; the cap slot is the EOI's
                    if slot + 1 >= self.tile_count {
                        return Err(SlideError::bad_data(
                            "more restart intervals than tiles in mosaic JPEG",
                        ));
                    }
                    slot += 1;
                    self.offsets[slot] = after_marker as i64;
                    trace!(slot, offset = after_marker, "found restart marker");
                } else if code == 0xD9 {
                    if slot + 1 != self.tile_count {
                        return Err(SlideError::bad_data(format!(
                            "end of image after {} of {} tiles",
                            slot + 1,
                            self.tile_count
                        )));
                    }
                    slot = self.tile_count;
                    self.offsets[slot] = after_marker as i64;
                    trace!(offset = after_marker, "found end of image");
                    break;
                }
                i += 2;
            }

            // Overlap one byte so a marker split across chunks is seen
            pos += (chunk.len() - 1) as u64;
        }

        Ok(())
    }
}

// =============================================================================
// Worker protocol
// =============================================================================

/// Background worker states.
///
/// Transitions are driven by the foreground only: a region paint moves the
/// worker to `Pause` while it runs and back to `Run` when it finishes;
/// slide close moves it to `Stop`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Scanning allowed once the foreground has been idle long enough
    Run,

    /// A region read is in flight; the worker stays off the index locks
    Pause,

    /// Terminal; the worker task exits
    Stop,
}

/// One physical mosaic JPEG with its lazily built index.
#[derive(Debug)]
pub struct IndexedJpeg {
    /// File path, resolved through the slide's handle pool at read time
    pub path: PathBuf,

    /// The index lock: readers and the background worker contend here
    pub index: Mutex<JpegTileIndex>,
}

#[derive(Debug)]
struct WorkerShared {
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl WorkerShared {
    fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Handle to the background marker-scanning task.
pub struct MarkerWorker {
    state_tx: watch::Sender<WorkerState>,
    shared: Arc<WorkerShared>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MarkerWorker {
    /// Spawn a worker over a file set with the default idle delay.
    pub fn spawn(files: Arc<Vec<IndexedJpeg>>, handles: SharedHandleCache) -> Self {
        Self::spawn_with_idle(files, handles, RESUME_IDLE)
    }

    /// Spawn a worker with a custom idle delay (tests use a short one).
    pub fn spawn_with_idle(
        files: Arc<Vec<IndexedJpeg>>,
        handles: SharedHandleCache,
        idle: Duration,
    ) -> Self {
        let (state_tx, mut state_rx) = watch::channel(WorkerState::Run);
        let shared = Arc::new(WorkerShared {
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        });

        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            let mut file_idx = 0usize;

            loop {
                let state = *state_rx.borrow();
                match state {
                    WorkerState::Stop => break,
                    WorkerState::Pause => {
                        if state_rx.changed().await.is_err() {
                            break;
                        }
                        continue;
                    }
                    WorkerState::Run => {}
                }

                let idle_for = task_shared.idle();
                if idle_for < idle {
                    let wait = idle - idle_for;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = state_rx.changed() => {}
                    }
                    continue;
                }

                // Advance the cursor past files whose index is done
                let Some(file) = files.get(file_idx) else {
                    debug!("marker worker finished all files");
                    break;
                };

                // Non-blocking acquire: a reader holding the lock wins
                let Ok(mut index) = file.index.try_lock() else {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                        _ = state_rx.changed() => {}
                    }
                    continue;
                };

                if index.is_complete() {
                    file_idx += 1;
                    continue;
                }

                let reader = match handles.checkout(&file.path).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        warn!(path = %file.path.display(), error = %e,
                              "marker worker cannot open mosaic file");
                        file_idx += 1;
                        continue;
                    }
                };

                match index.advance(&reader, WORKER_SLOT_BUDGET).await {
                    Ok(true) => {}
                    Ok(false) => file_idx += 1,
                    Err(e) => {
                        warn!(path = %file.path.display(), error = %e,
                              "marker worker scan failed");
                        file_idx += 1;
                    }
                }
            }
        });

        Self {
            state_tx,
            shared,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Record foreground activity, delaying the worker's next scan.
    pub fn touch(&self) {
        self.shared.touch();
    }

    /// A region paint is starting; keep the worker off the index locks.
    pub fn pause(&self) {
        self.shared.touch();
        let _ = self.state_tx.send(WorkerState::Pause);
    }

    /// The region paint finished; scanning may resume after the idle delay.
    pub fn resume(&self) {
        self.shared.touch();
        let _ = self.state_tx.send(WorkerState::Run);
    }

    /// Stop the worker and wait for it to observe the stop.
    pub async fn shutdown(&self) {
        let _ = self.state_tx.send(WorkerState::Stop);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for MarkerWorker {
    fn drop(&mut self) {
        // Best effort: without an executor we cannot join, but the task
        // observes Stop at its next loop iteration
        let _ = self.state_tx.send(WorkerState::Stop);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileHandleCache, MemoryRangeReader};

    /// Mosaic entropy region with restart markers placed so tile offsets
    /// are exactly [100, 200, 305, 407], EOI at 450.
    fn mosaic_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 452];
        data[198] = 0xFF;
        data[199] = 0xD0;
        data[303] = 0xFF;
        data[304] = 0xD1;
        data[405] = 0xFF;
        data[406] = 0xD2;
        data[450] = 0xFF;
        data[451] = 0xD9;
        data
    }

    fn mosaic_reader() -> MemoryRangeReader {
        MemoryRangeReader::new(mosaic_bytes(), "mem://mosaic.jpg")
    }

    #[tokio::test]
    async fn test_compute_scans_from_header() {
        let reader = mosaic_reader();
        let mut index = JpegTileIndex::new(4, 100);

        assert_eq!(index.compute(&reader, 2).await.unwrap(), 305);
        // The scan filled everything on the way
        assert_eq!(index.offset(1), Some(200));
        assert_eq!(index.offset(2), Some(305));
        assert_eq!(index.offset(3), None);
    }

    #[tokio::test]
    async fn test_compute_is_idempotent() {
        let reader = mosaic_reader();
        let mut index = JpegTileIndex::new(4, 100);

        let first = index.compute(&reader, 3).await.unwrap();
        let second = index.compute(&reader, 3).await.unwrap();
        assert_eq!(first, 407);
        assert_eq!(second, 407);
    }

    #[tokio::test]
    async fn test_bad_hint_rejected_good_offset_found() {
        let reader = mosaic_reader();
        let mut index = JpegTileIndex::new(4, 100);
        index.set_hints(vec![-1, 200, 310, 407]);

        // Hint 310 is wrong (bytes at 308..309 are not FF Dx); the scan
        // must find 305 instead
        assert_eq!(index.compute(&reader, 2).await.unwrap(), 305);
    }

    #[tokio::test]
    async fn test_good_hint_commits_without_scan() {
        let reader = mosaic_reader();
        let mut index = JpegTileIndex::new(4, 100);
        index.set_hints(vec![-1, 200, 310, 407]);

        // Hint 407 verifies (FF D2 at 405..406) and commits directly;
        // intermediate slots stay unknown
        assert_eq!(index.compute(&reader, 3).await.unwrap(), 407);
        assert_eq!(index.offset(1), None);
        assert_eq!(index.offset(2), None);
    }

    #[tokio::test]
    async fn test_segment_bounds() {
        let reader = mosaic_reader();
        let mut index = JpegTileIndex::new(4, 100);

        assert_eq!(index.segment(&reader, 0).await.unwrap(), (100, 198));
        assert_eq!(index.segment(&reader, 1).await.unwrap(), (200, 303));
        // Last tile ends at the EOI
        assert_eq!(index.segment(&reader, 3).await.unwrap(), (407, 450));
    }

    #[tokio::test]
    async fn test_segment_out_of_range() {
        let reader = mosaic_reader();
        let mut index = JpegTileIndex::new(4, 100);
        let result = index.segment(&reader, 4).await;
        assert!(matches!(result, Err(SlideError::BadData(_))));
    }

    #[tokio::test]
    async fn test_eoi_before_all_tiles_is_bad_data() {
        // Only one restart marker but three tiles declared
        let mut data = vec![0u8; 300];
        data[150] = 0xFF;
        data[151] = 0xD0;
        data[250] = 0xFF;
        data[251] = 0xD9;
        let reader = MemoryRangeReader::new(data, "mem://short.jpg");

        let mut index = JpegTileIndex::new(3, 100);
        let result = index.compute(&reader, 2).await;
        assert!(matches!(result, Err(SlideError::BadData(_))));
    }

    #[tokio::test]
    async fn test_truncated_file_is_bad_data() {
        // No EOI at all
        let mut data = vec![0u8; 220];
        data[198] = 0xFF;
        data[199] = 0xD0;
        let reader = MemoryRangeReader::new(data, "mem://trunc.jpg");

        let mut index = JpegTileIndex::new(2, 100);
        let result = index.compute(&reader, 2).await;
        assert!(matches!(result, Err(SlideError::BadData(_))));
    }

    #[tokio::test]
    async fn test_advance_fills_incrementally() {
        let reader = mosaic_reader();
        let mut index = JpegTileIndex::new(4, 100);

        // One slot at a time
        assert!(index.advance(&reader, 1).await.unwrap());
        assert_eq!(index.offset(1), Some(200));
        assert!(index.advance(&reader, 1).await.unwrap());
        assert!(index.advance(&reader, 1).await.unwrap());
        assert!(!index.advance(&reader, 2).await.unwrap());
        assert!(index.is_complete());
        assert_eq!(index.offset(4), Some(452));
    }

    #[tokio::test]
    async fn test_stuffed_ff_bytes_skipped() {
        // FF 00 stuffing inside entropy data must not be taken as a marker
        let mut data = vec![0u8; 260];
        data[120] = 0xFF;
        data[121] = 0x00;
        data[180] = 0xFF;
        data[181] = 0xD0;
        data[250] = 0xFF;
        data[251] = 0xD9;
        let reader = MemoryRangeReader::new(data, "mem://stuffed.jpg");

        let mut index = JpegTileIndex::new(2, 100);
        assert_eq!(index.compute(&reader, 1).await.unwrap(), 182);
    }

    // -------------------------------------------------------------------------
    // Worker tests
    // -------------------------------------------------------------------------

    async fn write_mosaic_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, mosaic_bytes()).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_worker_fills_index_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mosaic_file(&dir, "m.jpg").await;

        let files = Arc::new(vec![IndexedJpeg {
            path,
            index: Mutex::new(JpegTileIndex::new(4, 100)),
        }]);
        let handles = Arc::new(FileHandleCache::new());

        let worker = MarkerWorker::spawn_with_idle(
            Arc::clone(&files),
            handles,
            Duration::from_millis(10),
        );

        // Give the worker time to pass the idle gate and scan
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if files[0].index.lock().await.is_complete() {
                break;
            }
        }

        assert!(files[0].index.lock().await.is_complete());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_stop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mosaic_file(&dir, "m.jpg").await;

        let files = Arc::new(vec![IndexedJpeg {
            path,
            index: Mutex::new(JpegTileIndex::new(4, 100)),
        }]);
        let handles = Arc::new(FileHandleCache::new());

        // Long idle delay: the worker never gets to scan before stop
        let worker =
            MarkerWorker::spawn_with_idle(Arc::clone(&files), handles, Duration::from_secs(60));
        worker.pause();
        worker.shutdown().await;

        assert!(!files[0].index.lock().await.is_complete());
    }

    #[tokio::test]
    async fn test_worker_paused_does_not_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mosaic_file(&dir, "m.jpg").await;

        let files = Arc::new(vec![IndexedJpeg {
            path,
            index: Mutex::new(JpegTileIndex::new(4, 100)),
        }]);
        let handles = Arc::new(FileHandleCache::new());

        let worker = MarkerWorker::spawn_with_idle(
            Arc::clone(&files),
            handles,
            Duration::from_millis(1),
        );
        worker.pause();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!files[0].index.lock().await.is_complete());

        worker.resume();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if files[0].index.lock().await.is_complete() {
                break;
            }
        }
        assert!(files[0].index.lock().await.is_complete());
        worker.shutdown().await;
    }
}
