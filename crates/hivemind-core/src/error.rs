//! Error types shared across the hivemind crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while normalizing operation payloads.
///
/// Note that most malformed payloads are *not* errors: the indexers
/// drop them silently. This type covers conditions a caller may want
/// to surface, such as a payload that is not JSON at all.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload field has an invalid shape or value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "following",
            reason: "neither a string nor a list".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("following"));
        assert!(msg.contains("neither a string nor a list"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
