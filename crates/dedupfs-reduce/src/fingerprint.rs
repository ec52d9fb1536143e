//! Content fingerprinting: the digest used as the content-addressing key of a block

use crate::error::ReduceError;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;

/// Digest bytes identifying a block's content. Used as the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockDigest(pub Vec<u8>);

impl BlockDigest {
    /// Return the digest as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash function used to address block content.
///
/// Chosen once when the filesystem is created; an unknown name is rejected
/// when the store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// BLAKE3, 32-byte output
    #[default]
    Blake3,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl DigestAlgorithm {
    /// All supported algorithms
    pub const ALL: [DigestAlgorithm; 3] = [
        DigestAlgorithm::Blake3,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha512,
    ];

    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Blake3 => "blake3",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Output length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Blake3 | DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Digest a block of data
    pub fn digest(&self, data: &[u8]) -> BlockDigest {
        match self {
            DigestAlgorithm::Blake3 => BlockDigest(blake3::hash(data).as_bytes().to_vec()),
            DigestAlgorithm::Sha256 => BlockDigest(sha2::Sha256::digest(data).to_vec()),
            DigestAlgorithm::Sha512 => BlockDigest(sha2::Sha512::digest(data).to_vec()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        DigestAlgorithm::ALL
            .into_iter()
            .find(|algo| algo.name() == wanted)
            .ok_or_else(|| ReduceError::UnsupportedDigest(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_is_deterministic() {
        for algo in DigestAlgorithm::ALL {
            assert_eq!(algo.digest(b"hello world"), algo.digest(b"hello world"));
        }
    }

    #[test]
    fn different_data_produces_different_digests() {
        for algo in DigestAlgorithm::ALL {
            assert_ne!(algo.digest(b"hello"), algo.digest(b"world"));
        }
    }

    #[test]
    fn output_lengths_match() {
        for algo in DigestAlgorithm::ALL {
            assert_eq!(algo.digest(b"x").as_bytes().len(), algo.output_len());
        }
    }

    #[test]
    fn parse_names() {
        assert_eq!("BLAKE3".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Blake3);
        assert_eq!(" sha256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("sha512".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha512);
    }

    #[test]
    fn unsupported_digest_is_rejected() {
        let err = "md5".parse::<DigestAlgorithm>().unwrap_err();
        assert!(matches!(err, ReduceError::UnsupportedDigest(name) if name == "md5"));
    }

    #[test]
    fn hex_formatting() {
        let d = BlockDigest(vec![0x00, 0xab, 0x0f]);
        assert_eq!(d.to_hex(), "00ab0f");
        assert_eq!(d.to_string(), "00ab0f");
    }

    proptest! {
        #[test]
        fn prop_blake3_deterministic(data in prop::collection::vec(0u8..=255, 0..10_000)) {
            let algo = DigestAlgorithm::Blake3;
            prop_assert_eq!(algo.digest(&data), algo.digest(&data));
        }
    }
}
