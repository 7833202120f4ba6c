//! JSON text-frame codec for websocket messages.
//!
//! Every frame exchanged over a notification connection, in either direction,
//! carries exactly one UTF-8 JSON document. Outbound payloads are arbitrary
//! [`Serialize`] values chosen by the caller; inbound payloads are decoded into
//! untyped [`serde_json::Value`]s and handed to the application.
//!
//! # Example
//!
//! ```rust
//! use beerapi_server::codec::{decode, encode};
//! use serde_json::json;
//!
//! let frame = encode(&json!({"action": "beer_comment"})).unwrap();
//! assert_eq!(decode(frame.as_bytes()).unwrap(), json!({"action": "beer_comment"}));
//!
//! assert!(decode(b"not json").is_err());
//! ```

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while encoding or decoding a frame payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The outbound value could not be represented as JSON.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The inbound frame was not valid UTF-8 JSON.
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CodecError {
    /// Returns `true` for malformed inbound input.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Serializes `value` to UTF-8 JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] when the serializer rejects the value, for
/// instance a map whose keys do not serialize as strings.
pub fn encode<T>(value: &T) -> Result<String, CodecError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_string(value).map_err(CodecError::Encode)
}

/// Parses a UTF-8 JSON frame payload.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for invalid UTF-8, malformed JSON, or
/// trailing garbage after the document.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
