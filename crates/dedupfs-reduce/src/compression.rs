//! Block codecs (zlib, LZ4, Zstd, Snappy) and the registry that dispatches on them.
//!
//! Every stored block records the id of the codec that produced it, so the
//! registry must keep decoding every codec ever shipped, including deprecated
//! ones that are no longer selected for new writes.

use crate::error::ReduceError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Stable identifier of a codec. The numeric id is persisted per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Stored as-is
    None,
    /// zlib (DEFLATE with zlib framing)
    Zlib,
    /// LZ4 block format with the uncompressed size prepended
    Lz4,
    /// Zstandard
    Zstd,
    /// Snappy raw format. Decode-only.
    Snappy,
}

impl CodecKind {
    /// Every codec kind in registry iteration order
    pub const ALL: [CodecKind; 5] = [
        CodecKind::None,
        CodecKind::Zlib,
        CodecKind::Lz4,
        CodecKind::Zstd,
        CodecKind::Snappy,
    ];

    /// Persisted codec id
    pub fn id(&self) -> u8 {
        match self {
            CodecKind::None => 0,
            CodecKind::Zlib => 1,
            CodecKind::Lz4 => 2,
            CodecKind::Zstd => 3,
            CodecKind::Snappy => 4,
        }
    }

    /// Resolve a persisted codec id
    pub fn from_id(id: u8) -> Result<Self, ReduceError> {
        CodecKind::ALL
            .into_iter()
            .find(|k| k.id() == id)
            .ok_or_else(|| ReduceError::UnknownCodec(format!("id {}", id)))
    }

    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::None => "none",
            CodecKind::Zlib => "zlib",
            CodecKind::Lz4 => "lz4",
            CodecKind::Zstd => "zstd",
            CodecKind::Snappy => "snappy",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecKind {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        CodecKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| ReduceError::UnknownCodec(s.to_string()))
    }
}

/// Symbolic or explicit compression level.
///
/// Each codec maps the symbolic levels to its own numeric options and clamps
/// explicit levels to the range it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionLevel {
    /// Codec default
    #[default]
    Default,
    /// Favor speed
    Fast,
    /// Balanced
    Normal,
    /// Favor ratio
    Best,
    /// Explicit codec level, clamped per codec
    Custom(i32),
}

impl CompressionLevel {
    /// The four symbolic levels
    pub const SYMBOLIC: [CompressionLevel; 4] = [
        CompressionLevel::Default,
        CompressionLevel::Fast,
        CompressionLevel::Normal,
        CompressionLevel::Best,
    ];
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionLevel::Default => f.write_str("default"),
            CompressionLevel::Fast => f.write_str("fast"),
            CompressionLevel::Normal => f.write_str("normal"),
            CompressionLevel::Best => f.write_str("best"),
            CompressionLevel::Custom(level) => write!(f, "{}", level),
        }
    }
}

impl FromStr for CompressionLevel {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "" => Ok(CompressionLevel::Default),
            "fast" => Ok(CompressionLevel::Fast),
            "normal" => Ok(CompressionLevel::Normal),
            "best" => Ok(CompressionLevel::Best),
            other => other
                .parse::<i32>()
                .map(CompressionLevel::Custom)
                .map_err(|_| ReduceError::InvalidLevel(s.to_string())),
        }
    }
}

impl TryFrom<String> for CompressionLevel {
    type Error = ReduceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompressionLevel> for String {
    fn from(level: CompressionLevel) -> Self {
        level.to_string()
    }
}

/// Numeric levels a codec assigns to the symbolic levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelMap {
    /// Level used for [`CompressionLevel::Default`]
    pub default: i32,
    /// Level used for [`CompressionLevel::Fast`]
    pub fast: i32,
    /// Level used for [`CompressionLevel::Normal`]
    pub normal: i32,
    /// Level used for [`CompressionLevel::Best`]
    pub best: i32,
    /// Range explicit levels are clamped into
    pub range: (i32, i32),
}

impl LevelMap {
    /// Resolve a level request to the codec's numeric level
    pub fn resolve(&self, level: CompressionLevel) -> i32 {
        match level {
            CompressionLevel::Default => self.default,
            CompressionLevel::Fast => self.fast,
            CompressionLevel::Normal => self.normal,
            CompressionLevel::Best => self.best,
            CompressionLevel::Custom(n) => n.clamp(self.range.0, self.range.1),
        }
    }

    /// Explicit level range as an inclusive range
    pub fn range(&self) -> RangeInclusive<i32> {
        self.range.0..=self.range.1
    }
}

/// A stateless block codec.
pub trait Codec: Send + Sync {
    /// Which codec this is
    fn kind(&self) -> CodecKind;

    /// Symbolic level mapping and explicit level range
    fn levels(&self) -> LevelMap;

    /// Compress one block at the given level
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, ReduceError>;

    /// Decompress one block
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError>;

    /// Smallest input this codec is worth running on
    fn min_input_size(&self) -> usize {
        0
    }

    /// Gate used by the selection tournament
    fn may_compress(&self, data: &[u8]) -> bool {
        data.len() >= self.min_input_size()
    }

    /// Deprecated codecs decode existing blocks but are never selected
    fn is_deprecated(&self) -> bool {
        false
    }
}

/// Passthrough codec
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::None
    }

    fn levels(&self) -> LevelMap {
        LevelMap {
            default: 0,
            fast: 0,
            normal: 0,
            best: 0,
            range: (0, 0),
        }
    }

    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>, ReduceError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        Ok(data.to_vec())
    }
}

/// zlib via flate2
pub struct ZlibCodec;

impl Codec for ZlibCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zlib
    }

    fn levels(&self) -> LevelMap {
        LevelMap {
            default: 6,
            fast: 1,
            normal: 6,
            best: 9,
            range: (0, 9),
        }
    }

    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, ReduceError> {
        let level = self.levels().resolve(level) as u32;
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::new(level),
        );
        encoder
            .write_all(data)
            .map_err(|e| ReduceError::compress("zlib", e))?;
        encoder.finish().map_err(|e| ReduceError::compress("zlib", e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| ReduceError::decompress("zlib", e))?;
        Ok(out)
    }

    fn min_input_size(&self) -> usize {
        32
    }
}

/// LZ4 block format. lz4_flex has a single speed setting, so every level maps to 0.
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Lz4
    }

    fn levels(&self) -> LevelMap {
        LevelMap {
            default: 0,
            fast: 0,
            normal: 0,
            best: 0,
            range: (0, 0),
        }
    }

    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>, ReduceError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| ReduceError::decompress("lz4", e))
    }

    fn min_input_size(&self) -> usize {
        16
    }
}

/// Zstandard. Explicit levels are clamped to 1..=19.
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zstd
    }

    fn levels(&self) -> LevelMap {
        LevelMap {
            default: 3,
            fast: 1,
            normal: 3,
            best: 19,
            range: (1, 19),
        }
    }

    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, ReduceError> {
        zstd::encode_all(data, self.levels().resolve(level))
            .map_err(|e| ReduceError::compress("zstd", e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        zstd::decode_all(data).map_err(|e| ReduceError::decompress("zstd", e))
    }

    fn min_input_size(&self) -> usize {
        32
    }
}

/// Snappy raw format, kept so blocks written with it stay readable
pub struct SnappyCodec;

impl Codec for SnappyCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Snappy
    }

    fn levels(&self) -> LevelMap {
        LevelMap {
            default: 0,
            fast: 0,
            normal: 0,
            best: 0,
            range: (0, 0),
        }
    }

    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>, ReduceError> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| ReduceError::compress("snappy", e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| ReduceError::decompress("snappy", e))
    }

    fn min_input_size(&self) -> usize {
        32
    }

    fn is_deprecated(&self) -> bool {
        true
    }
}

/// Table of codecs, built once at mount time and shared by reference.
pub struct CodecRegistry {
    codecs: Vec<Box<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// Registry with every built-in codec, in [`CodecKind::ALL`] order
    pub fn new() -> Self {
        Self {
            codecs: vec![
                Box::new(NoneCodec),
                Box::new(ZlibCodec),
                Box::new(Lz4Codec),
                Box::new(ZstdCodec),
                Box::new(SnappyCodec),
            ],
        }
    }

    /// Look up a codec by kind
    pub fn get(&self, kind: CodecKind) -> Result<&dyn Codec, ReduceError> {
        self.codecs
            .iter()
            .find(|c| c.kind() == kind)
            .map(|c| c.as_ref())
            .ok_or_else(|| ReduceError::UnknownCodec(kind.to_string()))
    }

    /// Iterate over all registered codecs in registration order
    pub fn iter(&self) -> impl Iterator<Item = &dyn Codec> {
        self.codecs.iter().map(|c| c.as_ref())
    }

    /// Codecs eligible for new writes: compressing and not deprecated
    pub fn selectable(&self) -> impl Iterator<Item = &dyn Codec> {
        self.iter()
            .filter(|c| c.kind() != CodecKind::None && !c.is_deprecated())
    }

    /// Compress with a specific codec
    pub fn compress(
        &self,
        kind: CodecKind,
        data: &[u8],
        level: CompressionLevel,
    ) -> Result<Vec<u8>, ReduceError> {
        self.get(kind)?.compress(data, level)
    }

    /// Decompress a stored block using the codec id recorded with it
    pub fn decompress(&self, codec_id: u8, data: &[u8]) -> Result<Vec<u8>, ReduceError> {
        self.get(CodecKind::from_id(codec_id)?)?.decompress(data)
    }
}
