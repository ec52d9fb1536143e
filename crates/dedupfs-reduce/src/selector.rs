//! Per-block compression policy: pick a codec and level for each novel block.

use crate::compression::{CodecKind, CodecRegistry, CompressionLevel};
use crate::error::ReduceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which codecs the selector may use
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionMethod {
    /// Store every block uncompressed
    None,
    /// Always use one codec
    Codec(CodecKind),
    /// Try every selectable codec and keep the smallest output
    #[default]
    Best,
    /// Tournament over a caller-chosen subset, in the given order
    Custom(Vec<CodecKind>),
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMethod::None => f.write_str("none"),
            CompressionMethod::Codec(kind) => write!(f, "{}", kind),
            CompressionMethod::Best => f.write_str("best"),
            CompressionMethod::Custom(kinds) => {
                let names: Vec<&str> = kinds.iter().map(|k| k.name()).collect();
                write!(f, "custom:{}", names.join(","))
            }
        }
    }
}

impl FromStr for CompressionMethod {
    type Err = ReduceError;

    /// Accepts `none`, `best`, a codec name, or `custom:<codec>,<codec>,...`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        match trimmed.as_str() {
            "none" => Ok(CompressionMethod::None),
            "best" => Ok(CompressionMethod::Best),
            other => {
                if let Some(list) = other.strip_prefix("custom:") {
                    let kinds = list
                        .split(',')
                        .filter(|name| !name.trim().is_empty())
                        .map(str::parse::<CodecKind>)
                        .collect::<Result<Vec<_>, _>>()?;
                    if kinds.is_empty() {
                        return Err(ReduceError::InvalidMethod(s.to_string()));
                    }
                    Ok(CompressionMethod::Custom(kinds))
                } else {
                    match other.parse::<CodecKind>()? {
                        CodecKind::None => Ok(CompressionMethod::None),
                        kind => Ok(CompressionMethod::Codec(kind)),
                    }
                }
            }
        }
    }
}

impl TryFrom<String> for CompressionMethod {
    type Error = ReduceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompressionMethod> for String {
    fn from(method: CompressionMethod) -> Self {
        method.to_string()
    }
}

/// Compression policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Codec choice
    pub method: CompressionMethod,
    /// Level passed to the chosen codec
    pub level: CompressionLevel,
    /// Keep compressed output even when it does not shrink the block
    pub forced: bool,
    /// Blocks shorter than this are stored uncompressed unless forced
    pub minimal_size: usize,
    /// Compressed size over input size must stay below this ratio, unless forced
    pub minimal_ratio: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Best,
            level: CompressionLevel::Default,
            forced: false,
            minimal_size: 1024,
            minimal_ratio: 1.0,
        }
    }
}

/// Output of the selector for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    /// Codec actually used, to be persisted with the block
    pub codec: CodecKind,
    /// Stored bytes
    pub data: Vec<u8>,
}

impl Compressed {
    fn stored(data: &[u8]) -> Self {
        Self {
            codec: CodecKind::None,
            data: data.to_vec(),
        }
    }
}

/// Stateless compression policy engine. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct CompressionSelector {
    config: CompressionConfig,
    registry: Arc<CodecRegistry>,
}

impl CompressionSelector {
    /// Create a selector over the given registry
    pub fn new(config: CompressionConfig, registry: Arc<CodecRegistry>) -> Self {
        Self { config, registry }
    }

    /// The active configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// The codec registry used for compression and decompression
    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    /// Choose a codec for one block and compress it.
    ///
    /// Codec failures fall back to storing the block uncompressed; with
    /// `forced` set they are returned to the caller instead.
    pub fn select(&self, data: &[u8]) -> Result<Compressed, ReduceError> {
        if !self.config.forced && data.len() < self.config.minimal_size {
            return Ok(Compressed::stored(data));
        }
        let best = match &self.config.method {
            CompressionMethod::None => return Ok(Compressed::stored(data)),
            CompressionMethod::Codec(kind) => self.single(*kind, data)?,
            CompressionMethod::Best => {
                let kinds: Vec<CodecKind> = self.registry.selectable().map(|c| c.kind()).collect();
                self.tournament(&kinds, data)?
            }
            CompressionMethod::Custom(kinds) => self.tournament(kinds, data)?,
        };
        match best {
            Some(candidate) if self.config.forced || self.worth_keeping(&candidate, data) => {
                Ok(candidate)
            }
            _ => Ok(Compressed::stored(data)),
        }
    }

    /// Compress a batch sequentially on the calling thread
    pub fn select_batch<K>(&self, batch: Vec<(K, bytes::Bytes)>) -> Result<Vec<(K, Compressed)>, ReduceError> {
        batch
            .into_iter()
            .map(|(key, data)| self.select(&data).map(|c| (key, c)))
            .collect()
    }

    fn worth_keeping(&self, candidate: &Compressed, data: &[u8]) -> bool {
        if data.is_empty() || candidate.data.len() >= data.len() {
            return false;
        }
        (candidate.data.len() as f64 / data.len() as f64) < self.config.minimal_ratio
    }

    fn single(&self, kind: CodecKind, data: &[u8]) -> Result<Option<Compressed>, ReduceError> {
        let codec = self.registry.get(kind)?;
        if codec.is_deprecated() {
            warn!(codec = %kind, "deprecated codec configured for writes, storing uncompressed");
            return Ok(None);
        }
        match codec.compress(data, self.config.level) {
            Ok(out) => Ok(Some(Compressed {
                codec: kind,
                data: out,
            })),
            Err(e) if self.config.forced => Err(e),
            Err(e) => {
                warn!(codec = %kind, error = %e, "compression failed, storing block uncompressed");
                Ok(None)
            }
        }
    }

    fn tournament(&self, kinds: &[CodecKind], data: &[u8]) -> Result<Option<Compressed>, ReduceError> {
        let mut best: Option<Compressed> = None;
        let mut last_err = None;
        for kind in kinds {
            let codec = self.registry.get(*kind)?;
            if codec.kind() == CodecKind::None || codec.is_deprecated() || !codec.may_compress(data) {
                continue;
            }
            match codec.compress(data, self.config.level) {
                Ok(out) => {
                    let smaller = best.as_ref().map_or(true, |b| out.len() < b.data.len());
                    if smaller {
                        best = Some(Compressed {
                            codec: *kind,
                            data: out,
                        });
                    }
                }
                Err(e) => {
                    debug!(codec = %kind, error = %e, "codec dropped from tournament");
                    last_err = Some(e);
                }
            }
        }
        match (best, last_err) {
            (None, Some(e)) if self.config.forced => Err(e),
            (best, _) => Ok(best),
        }
    }
}
