//! Wire format message types for the `ChatLink` protocol.
//!
//! All types in this module represent the on-the-wire format for records
//! exchanged with the chat server: inbound message records pushed over the
//! persistent connection (and returned by the history endpoint), and the
//! outbound payload sent when the user submits a message. Everything is
//! serialized as JSON text.

use serde::{Deserialize, Serialize};

/// Maximum allowed message text size in bytes (64 KB).
pub const MAX_TEXT_SIZE: usize = 64 * 1024;

/// Unique identifier for a message, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// Creates a `MessageId` from a raw server-assigned value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a user (a message sender or the remote conversation party).
///
/// A conversation is keyed by the remote participant's `UserId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Parses a user identifier, rejecting malformed input.
    ///
    /// An identifier is well-formed iff it is non-empty and every
    /// character is ASCII alphanumeric, `-`, or `_`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidUserId`] otherwise.
    pub fn parse(id: &str) -> Result<Self, ValidationError> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidUserId(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    /// Returns the string representation of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A message record as delivered by the server.
///
/// The same shape is used for history records and for live frames pushed
/// over the persistent connection. At least one of `text` and `image` is
/// populated on anything the server actually delivers; decode does not
/// enforce this so that the engine never rejects history the server chose
/// to store. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned unique identifier.
    pub id: MessageId,
    /// Who sent this message.
    pub sender_id: UserId,
    /// Plain text body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Image reference (URL or data reference), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// When the server recorded the message.
    pub timestamp: Timestamp,
}

/// Outbound payload submitted over the persistent connection.
///
/// The server assigns the identifier and timestamp and broadcasts the
/// finished record back; the client never fabricates either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPayload {
    /// Message text (may be empty when an image is attached).
    pub text: String,
    /// Image reference, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Error returned when an outbound payload or identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Payload has neither text nor an image reference.
    #[error("message has no text and no image")]
    Empty,
    /// Message text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// User identifier is empty or contains forbidden characters.
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
}

impl OutboundPayload {
    /// Validates this payload for sending.
    ///
    /// A payload is sendable iff its trimmed text is non-empty or an image
    /// reference is present, and the text is within [`MAX_TEXT_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] or [`ValidationError::TooLarge`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.trim().is_empty() && self.image.is_none() {
            return Err(ValidationError::Empty);
        }
        if self.text.len() > MAX_TEXT_SIZE {
            return Err(ValidationError::TooLarge {
                size: self.text.len(),
                max: MAX_TEXT_SIZE,
            });
        }
        Ok(())
    }
}
