//! Serialization and deserialization for the `ChatLink` wire protocol.
//!
//! Frames on the persistent connection are UTF-8 JSON text: inbound frames
//! decode to [`ChatMessage`] records, outbound frames encode an
//! [`OutboundPayload`]. The history endpoint returns a JSON array of the
//! same message records.

use crate::message::{ChatMessage, OutboundPayload};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The payload parsed as JSON but does not have the expected shape.
    #[error("invalid shape: {0}")]
    InvalidShape(String),
}

/// Decodes one inbound text frame into a [`ChatMessage`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame is not valid JSON or
/// is missing required fields.
pub fn decode_frame(frame: &str) -> Result<ChatMessage, CodecError> {
    serde_json::from_str(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes an [`OutboundPayload`] as a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the payload cannot be serialized.
pub fn encode_outbound(payload: &OutboundPayload) -> Result<String, CodecError> {
    serde_json::to_string(payload).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a history response body into an ordered list of messages.
///
/// The server contract is a top-level JSON array of message records; any
/// other top-level shape (object, string, number) is an invalid response.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the body is not JSON, or
/// `CodecError::InvalidShape` if the top level is not an array or a
/// record inside it is malformed.
pub fn decode_history(body: &str) -> Result<Vec<ChatMessage>, CodecError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let serde_json::Value::Array(items) = value else {
        return Err(CodecError::InvalidShape(format!(
            "expected a JSON array of messages, got {}",
            json_type_name(&value)
        )));
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| CodecError::InvalidShape(e.to_string()))
        })
        .collect()
}

/// Human-readable name for a JSON value's type, for error messages.
const fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
