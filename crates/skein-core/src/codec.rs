//! Pluggable per-message serialization.
//!
//! The framework is codec-agnostic: a [`Codec`] is chosen per method.
//! Two codecs ship here: [`BincodeCodec`] for serde types and
//! [`ProstCodec`] for protobuf messages.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;

/// Encode/decode failure. Details stay local; the dispatcher maps these to
/// `INTERNAL` (server) or `UNKNOWN` (client) without leaking the reason.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {reason}")]
    Encode { reason: String },

    #[error("decode failed: {reason}")]
    Decode { reason: String },
}

/// Per-message serializer. Selected per service method.
pub trait Codec<M>: Send + Sync {
    fn encode(&self, message: &M) -> Result<Bytes, CodecError>;
    fn decode(&self, frame: Bytes) -> Result<M, CodecError>;
}

/// Bincode codec for any serde-serializable message type.
pub struct BincodeCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> BincodeCodec<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for BincodeCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for BincodeCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> Codec<M> for BincodeCodec<M>
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode(&self, message: &M) -> Result<Bytes, CodecError> {
        bincode::serialize(message)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                reason: e.to_string(),
            })
    }

    fn decode(&self, frame: Bytes) -> Result<M, CodecError> {
        bincode::deserialize(&frame).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
    }
}

/// Protobuf codec for prost message types.
pub struct ProstCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> ProstCodec<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for ProstCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for ProstCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> Codec<M> for ProstCodec<M>
where
    M: prost::Message + Default + 'static,
{
    fn encode(&self, message: &M) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn decode(&self, frame: Bytes) -> Result<M, CodecError> {
        M::decode(frame).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        id: String,
        seq: u64,
    }

    #[test]
    fn test_bincode_roundtrip() {
        let codec = BincodeCodec::<Payload>::new();
        let msg = Payload {
            id: "test".to_string(),
            seq: 7,
        };
        let frame = codec.encode(&msg).unwrap();
        let back = codec.decode(frame).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_bincode_decode_garbage_fails() {
        let codec = BincodeCodec::<Payload>::new();
        let err = codec.decode(Bytes::from_static(&[0xff, 0xff])).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }
}
