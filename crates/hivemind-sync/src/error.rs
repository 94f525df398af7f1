//! Error types for the sync engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the store.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Payload normalization error.
    #[error("payload error: {0}")]
    Core(#[from] hivemind_core::Error),

    /// A scheduled finalization task failed. Fatal for the enclosing
    /// finalization pass.
    #[error("task '{name}' failed: {source}")]
    TaskFailed {
        /// The scheduled task's name.
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// A scheduled task panicked or was cancelled before completing.
    #[error("task '{name}' did not complete: {reason}")]
    TaskJoin {
        /// The scheduled task's name.
        name: String,
        reason: String,
    },

    /// An expected index or table is missing from the schema at
    /// startup. The process must not continue with an incomplete
    /// index inventory.
    #[error("startup invariant violated: {0}")]
    StartupInvariant(String),

    /// The engine was driven through an invalid state transition.
    #[error("invalid sync state: {0}")]
    State(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failed_display_names_the_task() {
        let err = Error::TaskFailed {
            name: "follow_count".to_string(),
            source: Box::new(Error::State("boom".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("follow_count"));
        assert!(msg.contains("failed"));
    }

    #[test]
    fn test_startup_invariant_display() {
        let err = Error::StartupInvariant("indexes not located: [x]".to_string());
        assert!(err.to_string().contains("indexes not located"));
    }
}
