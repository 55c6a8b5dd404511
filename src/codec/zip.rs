//! ZIP central directory parsing and entry decompression.
//!
//! The InteMedic container is a Zip64 archive read directly through a
//! [`RangeReader`]: the end-of-central-directory record is located by a
//! backward scan, the central directory yields the entry table, and entry
//! payloads are read on demand by seeking past the local header.
//!
//! Only stored (0) and DEFLATE (8) entries are supported, and split or
//! spanned archives are rejected.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::error::ZipError;
use crate::io::{read_u16_le, read_u32_le, read_u64_le, RangeReader};

// =============================================================================
// Record signatures and layout
// =============================================================================

const EOCD_SIG: u32 = 0x0605_4B50;
const EOCD64_SIG: u32 = 0x0606_4B50;
const EOCD64_LOCATOR_SIG: u32 = 0x0706_4B50;
const CENTRAL_SIG: u32 = 0x0201_4B50;
const LOCAL_SIG: u32 = 0x0403_4B50;

/// Fixed size of the end-of-central-directory record, without the comment.
const EOCD_SIZE: usize = 22;

/// Fixed size of the Zip64 end-of-central-directory locator.
const EOCD64_LOCATOR_SIZE: usize = 20;

/// Fixed size of the Zip64 end-of-central-directory record.
const EOCD64_SIZE: usize = 56;

/// Fixed size of a central directory file header, without variable fields.
const CENTRAL_HEADER_SIZE: usize = 46;

/// Fixed size of a local file header, without variable fields.
const LOCAL_HEADER_SIZE: usize = 30;

/// Maximum ZIP comment length bounds the backward EOCD scan.
const MAX_COMMENT: usize = 0xFFFF;

/// Compression method: stored (no compression).
pub const METHOD_STORED: u16 = 0;

/// Compression method: DEFLATE.
pub const METHOD_DEFLATE: u16 = 8;

// =============================================================================
// ZipEntry
// =============================================================================

/// One file entry from the central directory.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    /// Entry name exactly as stored (path separators are not normalized)
    pub name: String,

    /// Offset of the entry's local file header
    pub header_offset: u64,

    /// Compressed payload size in bytes
    pub compressed_size: u64,

    /// Declared size after decompression
    pub uncompressed_size: u64,

    /// Compression method (0 = stored, 8 = DEFLATE)
    pub method: u16,

    /// General purpose bit flag
    pub flags: u16,
}

// =============================================================================
// ZipArchive
// =============================================================================

/// Parsed central directory of a ZIP archive.
#[derive(Debug, Clone)]
pub struct ZipArchive {
    entries: Vec<ZipEntry>,
    by_name: HashMap<String, usize>,
}

impl ZipArchive {
    /// Parse the central directory of an archive.
    ///
    /// Handles the Zip64 extension when any 32-bit field of the
    /// end-of-central-directory record is saturated.
    pub async fn parse<R: RangeReader>(reader: &R) -> Result<Self, ZipError> {
        let (cd_offset, cd_size, entry_count) = Self::locate_directory(reader).await?;

        let directory = reader
            .read_exact_at(cd_offset, cd_size as usize)
            .await
            .map_err(ZipError::Io)?;

        let mut entries = Vec::with_capacity(entry_count as usize);
        let mut pos = 0usize;

        for _ in 0..entry_count {
            if pos + CENTRAL_HEADER_SIZE > directory.len() {
                return Err(ZipError::MalformedDirectory(
                    "directory ends inside a file header".to_string(),
                ));
            }
            let header = &directory[pos..pos + CENTRAL_HEADER_SIZE];

            let signature = read_u32_le(&header[0..4]);
            if signature != CENTRAL_SIG {
                return Err(ZipError::BadSignature {
                    expected: CENTRAL_SIG,
                    actual: signature,
                });
            }

            let flags = read_u16_le(&header[8..10]);
            let method = read_u16_le(&header[10..12]);
            let mut compressed_size = read_u32_le(&header[20..24]) as u64;
            let mut uncompressed_size = read_u32_le(&header[24..28]) as u64;
            let name_len = read_u16_le(&header[28..30]) as usize;
            let extra_len = read_u16_le(&header[30..32]) as usize;
            let comment_len = read_u16_le(&header[32..34]) as usize;
            let disk_start = read_u16_le(&header[34..36]);
            let mut header_offset = read_u32_le(&header[42..46]) as u64;

            let name_start = pos + CENTRAL_HEADER_SIZE;
            let extra_start = name_start + name_len;
            let next = extra_start + extra_len + comment_len;
            if next > directory.len() {
                return Err(ZipError::MalformedDirectory(
                    "variable fields extend past the directory".to_string(),
                ));
            }

            let name = String::from_utf8_lossy(&directory[name_start..extra_start]).into_owned();

            // Saturated 32-bit fields are replaced by the Zip64 extra field,
            // in declaration order
            let needs_zip64 = uncompressed_size == u32::MAX as u64
                || compressed_size == u32::MAX as u64
                || header_offset == u32::MAX as u64;
            if needs_zip64 {
                let extra = &directory[extra_start..extra_start + extra_len];
                let zip64 = find_zip64_extra(extra).ok_or_else(|| {
                    ZipError::MalformedDirectory(format!(
                        "entry '{name}' saturates 32-bit fields without a Zip64 extra field"
                    ))
                })?;

                let mut fields = zip64.chunks_exact(8);
                if uncompressed_size == u32::MAX as u64 {
                    uncompressed_size = fields
                        .next()
                        .map(read_u64_le)
                        .ok_or_else(|| truncated_zip64(&name))?;
                }
                if compressed_size == u32::MAX as u64 {
                    compressed_size = fields
                        .next()
                        .map(read_u64_le)
                        .ok_or_else(|| truncated_zip64(&name))?;
                }
                if header_offset == u32::MAX as u64 {
                    header_offset = fields
                        .next()
                        .map(read_u64_le)
                        .ok_or_else(|| truncated_zip64(&name))?;
                }
            }

            if disk_start != 0 && disk_start != u16::MAX {
                return Err(ZipError::SplitArchive);
            }

            entries.push(ZipEntry {
                name,
                header_offset,
                compressed_size,
                uncompressed_size,
                method,
                flags,
            });

            pos = next;
        }

        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        Ok(ZipArchive { entries, by_name })
    }

    /// Locate the central directory: `(offset, size, entry_count)`.
    async fn locate_directory<R: RangeReader>(reader: &R) -> Result<(u64, u64, u64), ZipError> {
        let size = reader.size();
        if size < EOCD_SIZE as u64 {
            return Err(ZipError::MissingEocd);
        }

        // The EOCD sits in the trailing comment window
        let tail_len = size.min((MAX_COMMENT + EOCD_SIZE) as u64);
        let tail_start = size - tail_len;
        let tail = reader
            .read_exact_at(tail_start, tail_len as usize)
            .await
            .map_err(ZipError::Io)?;

        let mut eocd_pos = None;
        for i in (0..=tail.len() - EOCD_SIZE).rev() {
            if read_u32_le(&tail[i..i + 4]) == EOCD_SIG {
                eocd_pos = Some(i);
                break;
            }
        }
        let eocd_pos = eocd_pos.ok_or(ZipError::MissingEocd)?;
        let eocd = &tail[eocd_pos..eocd_pos + EOCD_SIZE];

        let disk_number = read_u16_le(&eocd[4..6]);
        let cd_disk = read_u16_le(&eocd[6..8]);
        let entry_count = read_u16_le(&eocd[10..12]) as u64;
        let cd_size = read_u32_le(&eocd[12..16]) as u64;
        let cd_offset = read_u32_le(&eocd[16..20]) as u64;

        let saturated = entry_count == u16::MAX as u64
            || cd_size == u32::MAX as u64
            || cd_offset == u32::MAX as u64;

        if !saturated {
            if disk_number != 0 || cd_disk != 0 {
                return Err(ZipError::SplitArchive);
            }
            return Ok((cd_offset, cd_size, entry_count));
        }

        // Zip64: the locator sits immediately before the EOCD record
        let eocd_abs = tail_start + eocd_pos as u64;
        if eocd_abs < EOCD64_LOCATOR_SIZE as u64 {
            return Err(ZipError::MalformedDirectory(
                "Zip64 locator missing".to_string(),
            ));
        }
        let locator = reader
            .read_exact_at(eocd_abs - EOCD64_LOCATOR_SIZE as u64, EOCD64_LOCATOR_SIZE)
            .await
            .map_err(ZipError::Io)?;

        let locator_sig = read_u32_le(&locator[0..4]);
        if locator_sig != EOCD64_LOCATOR_SIG {
            return Err(ZipError::BadSignature {
                expected: EOCD64_LOCATOR_SIG,
                actual: locator_sig,
            });
        }
        let total_disks = read_u32_le(&locator[16..20]);
        if total_disks > 1 {
            return Err(ZipError::SplitArchive);
        }
        let eocd64_offset = read_u64_le(&locator[8..16]);

        let eocd64 = reader
            .read_exact_at(eocd64_offset, EOCD64_SIZE)
            .await
            .map_err(ZipError::Io)?;
        let eocd64_sig = read_u32_le(&eocd64[0..4]);
        if eocd64_sig != EOCD64_SIG {
            return Err(ZipError::BadSignature {
                expected: EOCD64_SIG,
                actual: eocd64_sig,
            });
        }

        let disk = read_u32_le(&eocd64[16..20]);
        let cd_disk = read_u32_le(&eocd64[20..24]);
        if disk != 0 || cd_disk != 0 {
            return Err(ZipError::SplitArchive);
        }

        let entry_count = read_u64_le(&eocd64[32..40]);
        let cd_size = read_u64_le(&eocd64[40..48]);
        let cd_offset = read_u64_le(&eocd64[48..56]);

        Ok((cd_offset, cd_size, entry_count))
    }

    /// All entries in directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Look up an entry by its exact stored name.
    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read and decompress one entry's payload.
    ///
    /// The local header is parsed only for its variable-field lengths; the
    /// authoritative sizes come from the central directory. The result is
    /// checked against `uncompressed_size`.
    pub async fn read_entry<R: RangeReader>(
        &self,
        reader: &R,
        entry: &ZipEntry,
    ) -> Result<Vec<u8>, ZipError> {
        let header = reader
            .read_exact_at(entry.header_offset, LOCAL_HEADER_SIZE)
            .await
            .map_err(ZipError::Io)?;

        let signature = read_u32_le(&header[0..4]);
        if signature != LOCAL_SIG {
            return Err(ZipError::BadSignature {
                expected: LOCAL_SIG,
                actual: signature,
            });
        }

        let name_len = read_u16_le(&header[26..28]) as u64;
        let extra_len = read_u16_le(&header[28..30]) as u64;
        let data_offset = entry.header_offset + LOCAL_HEADER_SIZE as u64 + name_len + extra_len;

        let compressed = reader
            .read_exact_at(data_offset, entry.compressed_size as usize)
            .await
            .map_err(ZipError::Io)?;

        let data = match entry.method {
            METHOD_STORED => compressed.to_vec(),
            METHOD_DEFLATE => {
                let mut decoder = DeflateDecoder::new(&compressed[..]);
                let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
                decoder.read_to_end(&mut out).map_err(|e| {
                    ZipError::MalformedDirectory(format!(
                        "entry '{}' failed to inflate: {e}",
                        entry.name
                    ))
                })?;
                out
            }
            other => return Err(ZipError::UnsupportedMethod(other)),
        };

        if data.len() as u64 != entry.uncompressed_size {
            return Err(ZipError::SizeMismatch {
                expected: entry.uncompressed_size,
                actual: data.len() as u64,
            });
        }

        Ok(data)
    }
}

/// Find the Zip64 extended-information block (header id 0x0001) in an
/// entry's extra field.
fn find_zip64_extra(extra: &[u8]) -> Option<&[u8]> {
    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let id = read_u16_le(&extra[pos..pos + 2]);
        let len = read_u16_le(&extra[pos + 2..pos + 4]) as usize;
        let start = pos + 4;
        if start + len > extra.len() {
            return None;
        }
        if id == 0x0001 {
            return Some(&extra[start..start + len]);
        }
        pos = start + len;
    }
    None
}

fn truncated_zip64(name: &str) -> ZipError {
    ZipError::MalformedDirectory(format!("entry '{name}' has a truncated Zip64 extra field"))
}

// =============================================================================
// Tests
// =============================================================================
