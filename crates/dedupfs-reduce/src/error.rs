//! Error types for the dedupfs-reduce subsystem

/// All errors that can occur while digesting or compressing blocks
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Compression operation failed
    #[error("Compression failed ({codec}): {reason}")]
    CompressionFailed {
        /// Codec that failed
        codec: &'static str,
        /// Underlying failure
        reason: String,
    },
    /// Decompression operation failed
    #[error("Decompression failed ({codec}): {reason}")]
    DecompressionFailed {
        /// Codec that failed
        codec: &'static str,
        /// Underlying failure
        reason: String,
    },
    /// A codec name or stored codec id does not map to a known codec
    #[error("Unknown compression codec: {0}")]
    UnknownCodec(String),
    /// A compression method string could not be parsed
    #[error("Invalid compression method: {0}")]
    InvalidMethod(String),
    /// A compression level string could not be parsed
    #[error("Invalid compression level: {0}")]
    InvalidLevel(String),
    /// The configured digest function is not supported
    #[error("Unsupported digest function: {0}")]
    UnsupportedDigest(String),
    /// The compression worker pool is gone or a worker crashed
    #[error("Compression worker pool failure: {0}")]
    WorkerPool(String),
}

impl ReduceError {
    pub(crate) fn compress(codec: &'static str, err: impl std::fmt::Display) -> Self {
        ReduceError::CompressionFailed {
            codec,
            reason: err.to_string(),
        }
    }

    pub(crate) fn decompress(codec: &'static str, err: impl std::fmt::Display) -> Self {
        ReduceError::DecompressionFailed {
            codec,
            reason: err.to_string(),
        }
    }
}
