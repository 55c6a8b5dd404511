//! TIFF tag value reading.
//!
//! Values can be stored either inline in the IFD entry (for small values)
//! or at an offset in the file (for larger values like arrays).
//!
//! For array values (TileOffsets, TileByteCounts, StripOffsets) the entire
//! array is fetched in a single range request.

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{ByteOrder, IfdEntry, TiffHeader};
use super::tags::FieldType;

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values from a TIFF file.
///
/// This struct combines a RangeReader with TIFF header information to
/// read values respecting the file's byte order and format.
pub struct ValueReader<'a, R: RangeReader> {
    reader: &'a R,
    header: &'a TiffHeader,
}

impl<'a, R: RangeReader> ValueReader<'a, R> {
    /// Create a new ValueReader.
    pub fn new(reader: &'a R, header: &'a TiffHeader) -> Self {
        Self { reader, header }
    }

    /// Get the byte order from the header.
    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Read raw bytes for an IFD entry's value.
    ///
    /// For inline values, returns the bytes from the entry.
    /// For offset values, fetches the bytes from the file.
    pub async fn read_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ))
        } else {
            let offset = entry.value_offset(self.header.byte_order);
            let bytes = self.reader.read_exact_at(offset, size as usize).await?;
            Ok(bytes)
        }
    }

    /// Read a single u64 value from an entry.
    ///
    /// Handles Short, Long, and Long8 field types, converting as needed.
    pub async fn read_u64(&self, entry: &IfdEntry) -> Result<u64, TiffError> {
        if let Some(value) = entry.inline_u64(self.header.byte_order) {
            return Ok(value);
        }

        if entry.count != 1 {
            return Err(TiffError::InvalidTagValue {
                tag: "unknown",
                message: format!("expected count 1, got {}", entry.count),
            });
        }

        let values = self.read_u64_array(entry).await?;
        values.first().copied().ok_or(TiffError::InvalidTagValue {
            tag: "unknown",
            message: "empty value".to_string(),
        })
    }

    /// Read a single u32 value from an entry.
    pub async fn read_u32(&self, entry: &IfdEntry) -> Result<u32, TiffError> {
        let value = self.read_u64(entry).await?;
        u32::try_from(value).map_err(|_| TiffError::InvalidTagValue {
            tag: "unknown",
            message: format!("value {value} does not fit in u32"),
        })
    }

    /// Read an array of u64 values from an entry.
    ///
    /// This is the primary method for reading TileOffsets and TileByteCounts.
    /// Handles Short, Long, and Long8 field types, converting all to u64.
    pub async fn read_u64_array(&self, entry: &IfdEntry) -> Result<Vec<u64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        let count = entry.count as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.read_bytes(entry).await?;
        let byte_order = self.header.byte_order;

        let mut values = Vec::with_capacity(count);
        match field_type {
            FieldType::Short => {
                for chunk in bytes.chunks_exact(2).take(count) {
                    values.push(byte_order.read_u16(chunk) as u64);
                }
            }
            FieldType::Long => {
                for chunk in bytes.chunks_exact(4).take(count) {
                    values.push(byte_order.read_u32(chunk) as u64);
                }
            }
            FieldType::Long8 => {
                for chunk in bytes.chunks_exact(8).take(count) {
                    values.push(byte_order.read_u64(chunk));
                }
            }
            _ => {
                return Err(TiffError::InvalidTagValue {
                    tag: "unknown",
                    message: format!(
                        "expected Short, Long, or Long8 for array, got {:?}",
                        field_type
                    ),
                });
            }
        }

        Ok(values)
    }

    /// Read a single unsigned rational (numerator / denominator) as f64.
    ///
    /// Used for XResolution/YResolution. A zero denominator yields `None`.
    pub async fn read_rational(&self, entry: &IfdEntry) -> Result<Option<f64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if field_type != FieldType::Rational {
            return Err(TiffError::InvalidTagValue {
                tag: "unknown",
                message: format!("expected Rational type, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        if bytes.len() < 8 {
            return Err(TiffError::InvalidTagValue {
                tag: "unknown",
                message: "rational value truncated".to_string(),
            });
        }

        let byte_order = self.header.byte_order;
        let numerator = byte_order.read_u32(&bytes[0..4]);
        let denominator = byte_order.read_u32(&bytes[4..8]);

        if denominator == 0 {
            return Ok(None);
        }
        Ok(Some(numerator as f64 / denominator as f64))
    }

    /// Read a string value from an entry (ASCII type).
    ///
    /// The string is expected to be null-terminated. The null terminator
    /// is stripped from the result.
    pub async fn read_string(&self, entry: &IfdEntry) -> Result<String, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if field_type != FieldType::Ascii {
            return Err(TiffError::InvalidTagValue {
                tag: "unknown",
                message: format!("expected Ascii type for string, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(entry).await?;

        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let s = String::from_utf8_lossy(&bytes[..end]).into_owned();

        Ok(s)
    }

    /// Read raw bytes from an entry (for UNDEFINED or opaque data).
    ///
    /// This is used for JPEGTables and other binary data.
    pub async fn read_raw_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        self.read_bytes(entry).await
    }
}

// =============================================================================
// Tests
// =============================================================================
