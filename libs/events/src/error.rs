//! Error types for decoding fleet messages.

use thiserror::Error;

/// Errors that can occur when decoding fleet messages.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The health response did not carry a `status` field.
    #[error("health response is missing the status field")]
    MissingStatus,

    /// The payload is not a JSON object or is otherwise malformed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::InvalidPayload(err.to_string())
    }
}
