//! Byte Codecs
//!
//! A [`Codec`] turns a typed value into bytes and back. The disk tier
//! stores whatever the codec produces; the memory tier can borrow a
//! codec for byte-cost estimation.
//!
//! # Example
//!
//! ```
//! use stratacache::codec::{Codec, JsonCodec};
//!
//! let codec = JsonCodec::<Vec<u32>>::new();
//! let bytes = codec.encode(&vec![1, 2, 3]).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), vec![1, 2, 3]);
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encode/decode of a typed value to a byte sequence.
pub trait Codec: Send + Sync + 'static {
    /// The value type this codec understands.
    type Value;

    /// Encode a value to bytes.
    fn encode(&self, value: &Self::Value) -> Result<Bytes>;

    /// Decode bytes back into a value.
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value>;
}

/// A byte-cost estimator derived from a codec: the cost of a value is
/// the length of its one-shot encoding.
pub fn sizer_from_codec<C>(codec: C) -> Arc<dyn Fn(&C::Value) -> Result<u64> + Send + Sync>
where
    C: Codec,
{
    Arc::new(move |value| codec.encode(value).map(|bytes| bytes.len() as u64))
}

// =============================================================================
// JSON Codec
// =============================================================================

/// Structured JSON encoding, the recommended default.
pub struct JsonCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for JsonCodec<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V> Codec for JsonCodec<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = V;

    fn encode(&self, value: &V) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(Error::encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        serde_json::from_slice(bytes).map_err(Error::decode)
    }
}

// =============================================================================
// Binary Codec
// =============================================================================

/// Compact platform-independent binary encoding.
pub struct BincodeCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BincodeCodec<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for BincodeCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for BincodeCodec<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V> Codec for BincodeCodec<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Value = V;

    fn encode(&self, value: &V) -> Result<Bytes> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(Error::encode)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes).map_err(Error::decode)
    }
}

// =============================================================================
// Compressed Codec
// =============================================================================

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// LZ4 block format - fast compression
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Lz4
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Payload framing tags. The leading byte tells decode whether the body
/// is compressed or fell through raw.
const FRAME_RAW: u8 = 0;
const FRAME_LZ4: u8 = 1;

/// Wraps another codec with compression.
///
/// Encode compresses the inner bytes; when compression fails or does
/// not shrink the payload, the raw inner bytes are stored instead, and
/// the frame tag lets decode tell the two apart.
pub struct CompressedCodec<C> {
    inner: C,
    algorithm: CompressionAlgorithm,
    level: i32,
}

impl<C> CompressedCodec<C> {
    /// Wrap `inner` with the default algorithm.
    pub fn new(inner: C) -> Self {
        Self::with_algorithm(inner, CompressionAlgorithm::default())
    }

    pub fn with_algorithm(inner: C, algorithm: CompressionAlgorithm) -> Self {
        Self {
            inner,
            algorithm,
            level: 4,
        }
    }

    /// Set the algorithm-specific compression level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            CompressionAlgorithm::Lz4 => lz4::block::compress(
                bytes,
                Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
                true,
            )
            .map_err(|e| Error::CompressionFailed {
                algorithm: self.algorithm.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            CompressionAlgorithm::Lz4 => {
                lz4::block::decompress(bytes, None).map_err(|e| Error::DecompressionFailed {
                    algorithm: self.algorithm.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl<C: Clone> Clone for CompressedCodec<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            algorithm: self.algorithm,
            level: self.level,
        }
    }
}

impl<C> Codec for CompressedCodec<C>
where
    C: Codec,
{
    type Value = C::Value;

    fn encode(&self, value: &C::Value) -> Result<Bytes> {
        let plain = self.inner.encode(value)?;

        let framed = match self.compress(&plain) {
            Ok(compressed) if compressed.len() < plain.len() => {
                let mut framed = Vec::with_capacity(compressed.len() + 1);
                framed.push(FRAME_LZ4);
                framed.extend_from_slice(&compressed);
                framed
            }
            Ok(_) => frame_raw(&plain),
            Err(e) => {
                tracing::warn!("compression failed, storing uncompressed: {}", e);
                frame_raw(&plain)
            }
        };
        Ok(Bytes::from(framed))
    }

    fn decode(&self, bytes: &[u8]) -> Result<C::Value> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| Error::decode("empty compressed payload"))?;

        match *tag {
            FRAME_RAW => self.inner.decode(body),
            FRAME_LZ4 => {
                let plain = self.decompress(body)?;
                self.inner.decode(&plain)
            }
            other => Err(Error::decode(format!(
                "unknown compression frame tag {other}"
            ))),
        }
    }
}

fn frame_raw(plain: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(plain.len() + 1);
    framed.push(FRAME_RAW);
    framed.extend_from_slice(plain);
    framed
}

// =============================================================================
// Chained Codec
// =============================================================================

/// Byte transform applied around an inner codec.
pub type ByteTransform = Arc<dyn Fn(Bytes) -> Result<Bytes> + Send + Sync>;

/// Applies a pure byte transform after encode and its inverse before
/// decode. Useful for obfuscation, framing, or checksumming layers that
/// do not need a full codec of their own.
pub struct ChainedCodec<C> {
    inner: C,
    up: ByteTransform,
    down: ByteTransform,
}

impl<C> ChainedCodec<C> {
    pub fn new(inner: C, up: ByteTransform, down: ByteTransform) -> Self {
        Self { inner, up, down }
    }
}

impl<C: Clone> Clone for ChainedCodec<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            up: Arc::clone(&self.up),
            down: Arc::clone(&self.down),
        }
    }
}

impl<C> Codec for ChainedCodec<C>
where
    C: Codec,
{
    type Value = C::Value;

    fn encode(&self, value: &C::Value) -> Result<Bytes> {
        let bytes = self.inner.encode(value)?;
        (self.up)(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<C::Value> {
        let bytes = (self.down)(Bytes::copy_from_slice(bytes))?;
        self.inner.decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        scores: Vec<u32>,
    }

    fn sample() -> Sample {
        Sample {
            name: "hit-rates".to_string(),
            scores: vec![90, 80, 70, 70, 70],
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec::<Sample>::new();
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_json_decode_failure() {
        let codec = JsonCodec::<Sample>::new();
        let err = codec.decode(b"not json").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_bincode_roundtrip() {
        let codec = BincodeCodec::<Sample>::new();
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_bincode_is_compact() {
        let json = JsonCodec::<Sample>::new().encode(&sample()).unwrap();
        let binary = BincodeCodec::<Sample>::new().encode(&sample()).unwrap();
        assert!(binary.len() < json.len());
    }

    #[test]
    fn test_compressed_roundtrip() {
        let codec = CompressedCodec::new(JsonCodec::<Vec<String>>::new());
        let value: Vec<String> = (0..100).map(|_| "repetitive payload".to_string()).collect();

        let bytes = codec.encode(&value).unwrap();
        assert_eq!(bytes[0], FRAME_LZ4);

        let plain = JsonCodec::<Vec<String>>::new().encode(&value).unwrap();
        assert!(bytes.len() < plain.len());

        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_compressed_raw_fallthrough() {
        // A payload too small to shrink is stored raw behind the tag byte
        let codec = CompressedCodec::new(JsonCodec::<u8>::new());
        let bytes = codec.encode(&7).unwrap();
        assert_eq!(bytes[0], FRAME_RAW);
        assert_eq!(codec.decode(&bytes).unwrap(), 7);
    }

    #[test]
    fn test_compressed_rejects_unknown_tag() {
        let codec = CompressedCodec::new(JsonCodec::<u8>::new());
        let err = codec.decode(&[0xFF, 0x37]).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));

        let err = codec.decode(&[]).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_chained_codec() {
        let xor: u8 = 0x5A;
        let flip = move |bytes: Bytes| -> Result<Bytes> {
            let flipped: Vec<u8> = bytes.iter().map(|b| b ^ xor).collect();
            Ok(Bytes::from(flipped))
        };
        let codec = ChainedCodec::new(
            JsonCodec::<Sample>::new(),
            Arc::new(flip),
            Arc::new(flip),
        );

        let bytes = codec.encode(&sample()).unwrap();
        // The transform actually ran
        assert!(JsonCodec::<Sample>::new().decode(&bytes).is_err());
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_sizer_from_codec() {
        let sizer = sizer_from_codec(JsonCodec::<Sample>::new());
        let expected = JsonCodec::<Sample>::new().encode(&sample()).unwrap().len() as u64;
        assert_eq!(sizer(&sample()).unwrap(), expected);
    }
}
