use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Compression label carried by every stored payload.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    None,
    Zstd,
    Lz4,
}

impl Algorithm {
    pub fn tag(self) -> u8 {
        match self {
            Algorithm::None => 0,
            Algorithm::Zstd => 1,
            Algorithm::Lz4 => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Algorithm::None),
            1 => Some(Algorithm::Zstd),
            2 => Some(Algorithm::Lz4),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Zstd => "zstd",
            Algorithm::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Algorithm::None),
            "zstd" => Ok(Algorithm::Zstd),
            "lz4" => Ok(Algorithm::Lz4),
            other => Err(CompressionError::UnknownAlgorithm(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("unknown compression algorithm {0:?}")]
    UnknownAlgorithm(String),
    #[error("{0} is not available in this build")]
    Unavailable(Algorithm),
    #[error("{algorithm} codec failed: {reason}")]
    Codec {
        algorithm: Algorithm,
        reason: String,
    },
}

/// A reversible byte transform.
pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

#[cfg(feature = "zstd")]
struct ZstdCodec {
    level: i32,
}

#[cfg(feature = "zstd")]
impl Codec for ZstdCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        use std::io::Write;
        let failed = |e: std::io::Error| CompressionError::Codec {
            algorithm: Algorithm::Zstd,
            reason: e.to_string(),
        };
        let mut encoder = zstd::Encoder::new(Vec::new(), self.level).map_err(failed)?;
        encoder.write_all(data).map_err(failed)?;
        encoder.finish().map_err(failed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        use std::io::Read;
        let failed = |e: std::io::Error| CompressionError::Codec {
            algorithm: Algorithm::Zstd,
            reason: e.to_string(),
        };
        let mut decoder = zstd::Decoder::new(data).map_err(failed)?;
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf).map_err(failed)?;
        Ok(buf)
    }
}

#[cfg(feature = "lz4")]
struct Lz4Codec;

#[cfg(feature = "lz4")]
impl Codec for Lz4Codec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| CompressionError::Codec {
            algorithm: Algorithm::Lz4,
            reason: e.to_string(),
        })
    }
}

/// The codecs this process can use, keyed by algorithm.
///
/// `Default` registers every codec compiled in. Compressing with an algorithm
/// that is missing or fails falls back to storing the bytes as-is under the
/// `None` label.
pub struct CompressionRegistry {
    codecs: BTreeMap<Algorithm, Box<dyn Codec>>,
}

impl CompressionRegistry {
    /// A registry with no codecs at all; everything is stored uncompressed.
    pub fn empty() -> Self {
        Self {
            codecs: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, algorithm: Algorithm, codec: Box<dyn Codec>) {
        self.codecs.insert(algorithm, codec);
    }

    pub fn is_available(&self, algorithm: Algorithm) -> bool {
        algorithm == Algorithm::None || self.codecs.contains_key(&algorithm)
    }

    pub fn available(&self) -> Vec<Algorithm> {
        std::iter::once(Algorithm::None)
            .chain(self.codecs.keys().copied())
            .collect()
    }

    /// Compress with `requested`, returning the algorithm actually applied.
    pub fn compress(&self, data: &[u8], requested: Algorithm) -> (Algorithm, Vec<u8>) {
        if requested == Algorithm::None {
            return (Algorithm::None, data.to_vec());
        }
        let Some(codec) = self.codecs.get(&requested) else {
            tracing::warn!(algorithm = %requested, "compression unavailable, storing uncompressed");
            return (Algorithm::None, data.to_vec());
        };
        match codec.compress(data) {
            Ok(out) => {
                tracing::trace!(algorithm = %requested, raw = data.len(), compressed = out.len(), "payload compressed");
                (requested, out)
            }
            Err(err) => {
                tracing::warn!(algorithm = %requested, %err, "compression failed, storing uncompressed");
                (Algorithm::None, data.to_vec())
            }
        }
    }

    /// Undo `compress`. Unlike compression this cannot fall back: bytes
    /// labelled with a missing codec are unreadable here.
    pub fn decompress(&self, data: &[u8], algorithm: Algorithm) -> Result<Vec<u8>, CompressionError> {
        if algorithm == Algorithm::None {
            return Ok(data.to_vec());
        }
        self.codecs
            .get(&algorithm)
            .ok_or(CompressionError::Unavailable(algorithm))?
            .decompress(data)
    }
}

impl Default for CompressionRegistry {
    #[allow(unused_mut)]
    fn default() -> Self {
        let mut registry = Self::empty();
        #[cfg(feature = "zstd")]
        registry.register(Algorithm::Zstd, Box::new(ZstdCodec { level: 3 }));
        #[cfg(feature = "lz4")]
        registry.register(Algorithm::Lz4, Box::new(Lz4Codec));
        registry
    }
}

impl fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionRegistry")
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Codec for Broken {
        fn compress(&self, _: &[u8]) -> Result<Vec<u8>, CompressionError> {
            Err(CompressionError::Codec {
                algorithm: Algorithm::Zstd,
                reason: "always fails".into(),
            })
        }

        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
            Ok(data.to_vec())
        }
    }

    #[test]
    fn parse_and_tags() {
        assert_eq!("ZSTD".parse::<Algorithm>().unwrap(), Algorithm::Zstd);
        assert!("brotli".parse::<Algorithm>().is_err());
        for alg in [Algorithm::None, Algorithm::Zstd, Algorithm::Lz4] {
            assert_eq!(Algorithm::from_tag(alg.tag()), Some(alg));
        }
        assert_eq!(Algorithm::from_tag(9), None);
    }

    #[test]
    fn missing_codec_falls_back_to_none() {
        let registry = CompressionRegistry::empty();
        let (used, out) = registry.compress(b"hello", Algorithm::Zstd);
        assert_eq!(used, Algorithm::None);
        assert_eq!(out, b"hello");
        assert!(matches!(
            registry.decompress(b"x", Algorithm::Lz4),
            Err(CompressionError::Unavailable(Algorithm::Lz4))
        ));
    }

    #[test]
    fn failing_codec_falls_back_to_none() {
        let mut registry = CompressionRegistry::empty();
        registry.register(Algorithm::Zstd, Box::new(Broken));
        let (used, out) = registry.compress(b"data", Algorithm::Zstd);
        assert_eq!(used, Algorithm::None);
        assert_eq!(out, b"data");
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_shrinks_repetitive_data() {
        let registry = CompressionRegistry::default();
        let data = vec![7u8; 64 * 1024];
        let (used, out) = registry.compress(&data, Algorithm::Zstd);
        assert_eq!(used, Algorithm::Zstd);
        assert!(out.len() < data.len() / 10);
        assert_eq!(registry.decompress(&out, used).unwrap(), data);
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn lz4_roundtrip() {
        let registry = CompressionRegistry::default();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 17) as u8).collect();
        let (used, out) = registry.compress(&data, Algorithm::Lz4);
        assert_eq!(used, Algorithm::Lz4);
        assert_eq!(registry.decompress(&out, used).unwrap(), data);
    }
}
