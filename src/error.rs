use thiserror::Error;

/// I/O errors that can occur when reading slide files
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from the underlying filesystem
    #[error("File error: {0}")]
    File(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File not found
    #[error("File not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => IoError::NotFound(err.to_string()),
            _ => IoError::File(err.to_string()),
        }
    }
}

/// Errors that can occur when parsing TIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),
}

/// Errors that can occur when parsing ZIP containers
#[derive(Debug, Clone, Error)]
pub enum ZipError {
    /// I/O error while reading the archive
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// End-of-central-directory record not found
    #[error("End of central directory not found")]
    MissingEocd,

    /// A record has the wrong signature
    #[error("Bad record signature: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadSignature { expected: u32, actual: u32 },

    /// Archive spans multiple disks
    #[error("Split archives are not supported")]
    SplitArchive,

    /// Entry uses a compression method other than stored or deflate
    #[error("Unsupported compression method: {0}")]
    UnsupportedMethod(u16),

    /// Decompressed entry did not match its declared size
    #[error("Entry size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Central directory is truncated or inconsistent
    #[error("Malformed central directory: {0}")]
    MalformedDirectory(String),
}

/// Top-level error type for slide operations.
///
/// Every failure reported by the library collapses into one of four kinds:
/// the file is not a recognized format, the file is recognized but
/// structurally broken, the underlying read failed, or a codec refused
/// its payload.
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// File is not of a format this build recognizes
    #[error("Unsupported format: {reason}")]
    Unsupported { reason: String },

    /// Format recognized but the file is structurally malformed
    #[error("Bad data: {0}")]
    BadData(String),

    /// Underlying read/seek/open failed
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Codec refused the payload
    #[error("Decode error: {0}")]
    Decode(String),
}

impl SlideError {
    /// Shorthand for an `Unsupported` error.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        SlideError::Unsupported {
            reason: reason.into(),
        }
    }

    /// Shorthand for a `BadData` error.
    pub fn bad_data(message: impl Into<String>) -> Self {
        SlideError::BadData(message.into())
    }

    /// Shorthand for a `Decode` error.
    pub fn decode(message: impl Into<String>) -> Self {
        SlideError::Decode(message.into())
    }
}

impl From<TiffError> for SlideError {
    fn from(err: TiffError) -> Self {
        match err {
            TiffError::Io(io) => SlideError::Io(io),
            other => SlideError::BadData(other.to_string()),
        }
    }
}

impl From<ZipError> for SlideError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(io) => SlideError::Io(io),
            other => SlideError::BadData(other.to_string()),
        }
    }
}
