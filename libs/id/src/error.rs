use thiserror::Error;

/// Why a string is not a valid ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("'{0}' is not a prefixed ID")]
    Malformed(String),

    #[error("expected a '{expected}' ID, got prefix '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ULID in '{input}': {reason}")]
    InvalidUlid { input: String, reason: String },
}
