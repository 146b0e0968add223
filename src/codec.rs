//! JSON codec seam between stored result bodies and typed values.
//!
//! Result bodies travel through the ledger as JSON strings. An
//! [`OutputCodec`] validates a stored body against a concrete type before it
//! reaches a waiting caller; [`OutputValue`] keeps the decoded value
//! type-erased so handles for different actions can share one map.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

/// Errors produced while encoding inputs or decoding stored result bodies.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode result body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A decoded, schema-validated result value.
///
/// Produced by an [`OutputCodec`]; callers that know the concrete output
/// type recover it with [`OutputValue::into_typed`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputValue(serde_json::Value);

impl OutputValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Deserialize the validated value into a concrete type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        serde_json::from_value(self.0).map_err(CodecError::Decode)
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Decoder for one action type's stored result body.
pub trait OutputCodec: Send + Sync {
    /// Validate and decode a stored result body.
    fn decode(&self, body: &str) -> Result<OutputValue, CodecError>;
}

/// [`OutputCodec`] that validates bodies by round-tripping through `T`.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> OutputCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn decode(&self, body: &str) -> Result<OutputValue, CodecError> {
        let typed: T = serde_json::from_str(body).map_err(CodecError::Decode)?;
        let value = serde_json::to_value(typed).map_err(CodecError::Encode)?;
        Ok(OutputValue(value))
    }
}

/// Encode a value as a JSON wire body.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(CodecError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        value: i64,
    }

    #[test]
    fn json_codec_decodes_valid_body() {
        let codec = JsonCodec::<Payload>::new();
        let out = codec.decode(r#"{"value":42}"#).unwrap();
        assert_eq!(out.as_json(), &serde_json::json!({"value": 42}));
        assert_eq!(out.into_typed::<Payload>().unwrap(), Payload { value: 42 });
    }

    #[test]
    fn json_codec_rejects_mismatched_body() {
        let codec = JsonCodec::<Payload>::new();
        let err = codec.decode(r#"{"value":"not a number"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn encode_round_trips() {
        let body = encode(&Payload { value: 7 }).unwrap();
        assert_eq!(body, r#"{"value":7}"#);
    }
}
