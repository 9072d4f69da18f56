//! Payload codec.
//!
//! Values are serialized to JSON bytes before they reach any tier. Payloads
//! sent to a remote tier are framed with a one-byte header and optionally
//! zstd-compressed; decoding reverses the frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Frame tag: payload stored as-is.
const FRAME_RAW: u8 = 0;

/// Frame tag: payload is zstd-compressed.
const FRAME_ZSTD: u8 = 1;

/// Serialize a value to JSON bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Deserialize JSON bytes into a value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))
}

/// Codec settings.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// zstd-compress framed payloads.
    pub compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Skip compression below this payload size.
    pub min_compress_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: false,
            zstd_level: 3,
            min_compress_bytes: 256,
        }
    }
}

/// Frames payloads for storage in a remote tier.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn compression_enabled(&self) -> bool {
        self.config.compression
    }

    /// Wrap a payload into a frame, compressing when enabled and worthwhile.
    pub fn seal(&self, payload: &[u8]) -> Result<Bytes> {
        if self.config.compression && payload.len() >= self.config.min_compress_bytes {
            let compressed = zstd::encode_all(payload, self.config.zstd_level)
                .map_err(|e| CacheError::Serialization(format!("zstd: {e}")))?;
            if compressed.len() < payload.len() {
                return Ok(Self::frame(FRAME_ZSTD, &compressed));
            }
        }
        Ok(Self::frame(FRAME_RAW, payload))
    }

    /// Unwrap a frame produced by [`Codec::seal`].
    ///
    /// Frames are self-describing, so a codec with compression disabled can
    /// still read compressed frames.
    pub fn open(&self, frame: &[u8]) -> Result<Bytes> {
        match frame.split_first() {
            Some((&FRAME_RAW, body)) => Ok(Bytes::copy_from_slice(body)),
            Some((&FRAME_ZSTD, body)) => zstd::decode_all(body)
                .map(Bytes::from)
                .map_err(|e| CacheError::Deserialization(format!("zstd: {e}"))),
            Some((tag, _)) => Err(CacheError::Deserialization(format!(
                "unknown frame tag {tag}"
            ))),
            None => Err(CacheError::Deserialization("empty frame".into())),
        }
    }

    fn frame(tag: u8, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.put_u8(tag);
        buf.put_slice(body);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_frame_shrinks_repetitive_payload() {
        let codec = Codec::new(CodecConfig {
            compression: true,
            ..Default::default()
        });
        let data = vec![42u8; 4096];

        let sealed = codec.seal(&data).unwrap();
        assert_eq!(sealed[0], FRAME_ZSTD);
        assert!(sealed.len() < data.len());
        assert_eq!(codec.open(&sealed).unwrap(), Bytes::from(data));
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let codec = Codec::new(CodecConfig {
            compression: true,
            ..Default::default()
        });
        let sealed = codec.seal(b"tiny").unwrap();
        assert_eq!(sealed[0], FRAME_RAW);
        assert_eq!(&sealed[1..], b"tiny");
    }

    #[test]
    fn test_corrupt_frame_is_deserialization_error() {
        let codec = Codec::default();
        assert!(matches!(
            codec.open(&[9, 1, 2]),
            Err(CacheError::Deserialization(_))
        ));
        assert!(matches!(codec.open(&[]), Err(CacheError::Deserialization(_))));
        assert!(matches!(
            codec.open(&[FRAME_ZSTD, 0xde, 0xad]),
            Err(CacheError::Deserialization(_))
        ));
    }

    #[test]
    fn test_json_decode_type_mismatch() {
        let bytes = encode(&"text").unwrap();
        assert!(matches!(
            decode::<u32>(&bytes),
            Err(CacheError::Deserialization(_))
        ));
        assert_eq!(decode::<String>(&bytes).unwrap(), "text");
    }
}
