#![warn(missing_docs)]

//! DedupFS reduction subsystem: content digests, block codecs, compression selection
//!
//! Write path: Block → Digest (BLAKE3/SHA-2) → Dedupe lookup → Select codec → Compress
//! Read path:  Stored bytes → Decompress with the codec recorded for that block

pub mod compression;
pub mod error;
pub mod fingerprint;
pub mod selector;
pub mod worker_pool;

pub use compression::{Codec, CodecKind, CodecRegistry, CompressionLevel, LevelMap};
pub use error::ReduceError;
pub use fingerprint::{BlockDigest, DigestAlgorithm};
pub use selector::{Compressed, CompressionConfig, CompressionMethod, CompressionSelector};
pub use worker_pool::{CompressionPool, PoolConfig};
