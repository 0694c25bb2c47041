//! Error types for the caching engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cache operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying filesystem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `set` could not make room because every remaining entry is
    /// protected from eviction
    #[error("capacity exceeded: cannot evict enough entries to fit the new value")]
    CapacityExceeded,

    /// Value could not be encoded to bytes
    #[error("encode failed: {reason}")]
    Encode { reason: String },

    /// Bytes could not be decoded back into a value
    #[error("decode failed: {reason}")]
    Decode { reason: String },

    /// Compression failed
    #[error("compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// Build an encode error from any displayable cause.
    pub fn encode(reason: impl std::fmt::Display) -> Self {
        Error::Encode {
            reason: reason.to_string(),
        }
    }

    /// Build a decode error from any displayable cause.
    pub fn decode(reason: impl std::fmt::Display) -> Self {
        Error::Decode {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CapacityExceeded;
        assert!(err.to_string().contains("capacity exceeded"));

        let err = Error::encode("bad value");
        assert_eq!(err.to_string(), "encode failed: bad value");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
