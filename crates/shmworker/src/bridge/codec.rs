//! JSON codec for mailbox payloads.
//!
//! A mailbox region is zero padded past the last write, so decoding strips
//! trailing NUL bytes before handing the text to serde_json.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("mailbox is empty")]
    Empty,
}

/// Serializes `T` to JSON bytes and back.
pub struct JsonCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: Serialize> JsonCodec<T> {
    pub fn encode(&self, item: &T) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(item).map_err(CodecError::Encode)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding payload");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large payload being encoded"
            );
        }
        Ok(json)
    }
}

impl<T: DeserializeOwned> JsonCodec<T> {
    pub fn decode(&self, src: &[u8]) -> Result<T, CodecError> {
        let payload = trim_padding(src);
        if payload.is_empty() {
            return Err(CodecError::Empty);
        }
        serde_json::from_slice(payload).map_err(CodecError::Decode)
    }
}

/// Strip the trailing NUL padding left in a mailbox region.
pub fn trim_padding(src: &[u8]) -> &[u8] {
    let end = src.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &src[..end]
}
