//! Range readers over local files and in-memory buffers.
//!
//! Slide files are multi-gigabyte, so they are never loaded whole. The
//! [`FileRangeReader`] serves positional reads from a shared file handle;
//! reads run on the blocking thread pool so that tile decoding tasks are
//! not starved by disk latency.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;

use super::range_reader::RangeReader;

// =============================================================================
// FileRangeReader
// =============================================================================

/// Positional reader over a local file.
///
/// The underlying handle is shared; every read is absolute, so no seek
/// state exists and concurrent reads do not interfere. Cloning is cheap
/// and shares the handle.
#[derive(Debug, Clone)]
pub struct FileRangeReader {
    file: Arc<File>,
    size: u64,
    identifier: Arc<str>,
}

impl FileRangeReader {
    /// Open a file for positional reading.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_owned();
        let identifier: Arc<str> = path.to_string_lossy().into_owned().into();

        let (file, size) = tokio::task::spawn_blocking(move || -> Result<_, IoError> {
            let file = File::open(&path)?;
            let size = file.metadata()?.len();
            Ok((file, size))
        })
        .await
        .map_err(|e| IoError::File(format!("blocking task failed: {e}")))??;

        Ok(Self {
            file: Arc::new(file),
            size,
            identifier,
        })
    }
}

#[cfg(unix)]
fn read_exact_at_impl(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at_impl(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        read += n;
    }
    Ok(())
}

#[async_trait]
impl RangeReader for FileRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        if offset + len as u64 > self.size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.size,
            });
        }

        let file = Arc::clone(&self.file);
        let bytes = tokio::task::spawn_blocking(move || -> Result<Bytes, IoError> {
            let mut buf = vec![0u8; len];
            read_exact_at_impl(&file, &mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| IoError::File(format!("blocking task failed: {e}")))??;

        Ok(bytes)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// MemoryRangeReader
// =============================================================================

/// Range reader over a fully in-memory buffer.
///
/// Used for staged resources (a decrypted metadata payload, a synthesized
/// JPEG stream) and widely in tests.
#[derive(Debug, Clone)]
pub struct MemoryRangeReader {
    data: Bytes,
    identifier: Arc<str>,
}

impl MemoryRangeReader {
    /// Wrap a buffer.
    pub fn new(data: impl Into<Bytes>, identifier: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            identifier: identifier.into().into(),
        }
    }
}

#[async_trait]
impl RangeReader for MemoryRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let start = offset as usize;
        let end = start.checked_add(len).unwrap_or(usize::MAX);
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
