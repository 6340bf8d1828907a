use miniz_oxide::inflate::TINFLStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid magic, not a DROFS image")]
    InvalidMagic,

    #[error("image of {0} bytes is too short to hold a header")]
    TruncatedHeader(usize),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("original size mismatch: expected {expected}, got {actual}")]
    OriginalSizeMismatch { expected: u32, actual: u64 },

    #[error("malformed entry at offset {offset}: {field} runs past the end of the image")]
    MalformedEntry { offset: u32, field: &'static str },

    #[error("invalid entry type {value} at offset {offset}")]
    InvalidEntryType { offset: u32, value: u8 },

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("child index {index} out of range of {count}")]
    ChildIndex { index: usize, count: usize },

    #[error("inflate failed: {0:?}")]
    Decompression(TINFLStatus),

    #[error("decompression stream already finished or failed")]
    StreamExhausted,

    #[cfg(any(test, feature = "builder"))]
    #[error("cannot build image: {0}")]
    Build(String),

    #[cfg(any(test, feature = "builder"))]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that mean the image bytes themselves are damaged.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic
                | Self::TruncatedHeader(_)
                | Self::ChecksumMismatch { .. }
                | Self::OriginalSizeMismatch { .. }
                | Self::MalformedEntry { .. }
                | Self::InvalidEntryType { .. }
                | Self::Decompression(_)
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;
