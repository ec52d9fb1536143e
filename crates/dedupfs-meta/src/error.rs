//! Error taxonomy for the block store and its errno mapping.

use dedupfs_reduce::ReduceError;
use thiserror::Error;

/// Errors raised by the block store, caches and garbage collector
#[derive(Debug, Error)]
pub enum MetaError {
    /// A table operation failed in the KV backend.
    #[error("storage error: {0}")]
    Storage(String),

    /// A digest, inode, name or row is absent.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing object
        what: String,
    },

    /// A directory entry or subvolume name is already taken.
    #[error("{what} already exists")]
    Exists {
        /// Description of the conflicting object
        what: String,
    },

    /// A directory still has entries.
    #[error("{what} is not empty")]
    NotEmpty {
        /// Description of the directory
        what: String,
    },

    /// A cache went over its bound. Triggers eviction and is never surfaced to callers.
    #[error("cache over capacity: {used} bytes > {limit} bytes")]
    Capacity {
        /// Bytes currently held
        used: u64,
        /// Configured bound
        limit: u64,
    },

    /// Stored block content does not match its digest.
    #[error("corruption detected for hash {hash_id}: {reason}")]
    Corruption {
        /// Hash row the block belongs to
        hash_id: u64,
        /// What did not match
        reason: String,
    },

    /// A codec failed and the policy did not allow a fallback.
    #[error("compression error: {0}")]
    Compression(#[from] ReduceError),

    /// A row could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A write would end past the largest representable file offset.
    #[error("write of {len} bytes at offset {offset} exceeds the maximum file size")]
    FileTooLarge {
        /// Requested offset
        offset: u64,
        /// Requested length
        len: u64,
    },

    /// The store was opened read-only.
    #[error("filesystem is mounted read-only")]
    ReadOnly,

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate
pub type MetaResult<T> = std::result::Result<T, MetaError>;

impl MetaError {
    /// Shorthand for [`MetaError::NotFound`]
    pub fn not_found(what: impl Into<String>) -> Self {
        MetaError::NotFound { what: what.into() }
    }

    /// Map to the errno returned to the filesystem dispatch layer
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            MetaError::Storage(_) => EIO,
            MetaError::NotFound { .. } => ENOENT,
            MetaError::Exists { .. } => EEXIST,
            MetaError::NotEmpty { .. } => ENOTEMPTY,
            MetaError::Capacity { .. } => ENOMEM,
            MetaError::Corruption { .. } => EIO,
            MetaError::Compression(_) => EIO,
            MetaError::Serialization(_) => EIO,
            MetaError::Config(_) => EINVAL,
            MetaError::FileTooLarge { .. } => EFBIG,
            MetaError::ReadOnly => EROFS,
            MetaError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        }
    }
}

impl From<bincode::Error> for MetaError {
    fn from(e: bincode::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errno() {
        assert_eq!(MetaError::Storage("disk gone".into()).to_errno(), libc::EIO);
    }

    #[test]
    fn test_not_found_errno() {
        assert_eq!(MetaError::not_found("inode 4").to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_corruption_errno() {
        let err = MetaError::Corruption {
            hash_id: 9,
            reason: "digest mismatch".into(),
        };
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(err.to_string().contains("hash 9"));
    }

    #[test]
    fn test_namespace_errnos() {
        let exists = MetaError::Exists { what: "entry a".into() };
        assert_eq!(exists.to_errno(), libc::EEXIST);
        let not_empty = MetaError::NotEmpty { what: "directory 4".into() };
        assert_eq!(not_empty.to_errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn test_file_too_large_errno() {
        let err = MetaError::FileTooLarge { offset: u64::MAX, len: 2 };
        assert_eq!(err.to_errno(), libc::EFBIG);
    }

    #[test]
    fn test_read_only_errno() {
        assert_eq!(MetaError::ReadOnly.to_errno(), libc::EROFS);
    }

    #[test]
    fn test_io_error_keeps_os_code() {
        let err = MetaError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_compression_error_converts() {
        let err: MetaError = ReduceError::UnsupportedDigest("md5".into()).into();
        assert!(matches!(err, MetaError::Compression(_)));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            MetaError::Storage("x".into()),
            MetaError::not_found("name"),
            MetaError::Capacity { used: 10, limit: 5 },
            MetaError::Serialization("bad".into()),
            MetaError::Config("bad".into()),
            MetaError::ReadOnly,
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
