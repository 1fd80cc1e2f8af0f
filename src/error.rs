//! Error taxonomy shared by every component
//!
//! Structural and configuration errors surface immediately. Only
//! `TransientIo` is ever retried (see `library::retry`), and a retry budget
//! that runs out becomes `RetriesExhausted`.

use thiserror::Error;

/// Errors raised by adapters, containers, selectors, libraries and transforms
#[derive(Debug, Error)]
pub enum ExpertError {
    /// Unknown modifier/selector name, duplicate registration, bad config value
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Expert/base-model architecture mismatch, tensor shape mismatch
    #[error("incompatible {what}: expected {expected}, got {actual}")]
    Incompatible {
        what: String,
        expected: String,
        actual: String,
    },

    /// Missing expert, task, auxiliary data or prototypes
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation invalid in the current state (forward before attach, merge twice, duplicate add)
    #[error("invalid state: {0}")]
    State(String),

    /// Routing weights that are neither a valid index nor a valid distribution
    #[error("invalid routing: {0}")]
    InvalidRouting(String),

    /// An adapter was asked to wrap a layer it cannot transform
    #[error("unsupported layer kind '{kind}' at '{path}' for {adapter} adapter")]
    UnsupportedLayerKind {
        path: String,
        kind: String,
        adapter: String,
    },

    /// A remote store call failed in a way worth retrying
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// The retry budget for a remote call ran out
    #[error("remote operation '{op}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("weight encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl ExpertError {
    pub fn config(msg: impl Into<String>) -> Self {
        ExpertError::Configuration(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        ExpertError::State(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ExpertError::NotFound(msg.into())
    }

    /// Shape/attribute mismatch with the expected and actual values spelled out
    pub fn incompatible(
        what: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        ExpertError::Incompatible {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether a retry policy may re-run the failed operation
    pub fn is_transient(&self) -> bool {
        matches!(self, ExpertError::TransientIo(_))
    }
}

pub type Result<T> = std::result::Result<T, ExpertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incompatible_message_names_both_sides() {
        let err = ExpertError::incompatible("in_features of 'h.0.q'", 8, 16);
        let msg = err.to_string();
        assert!(msg.contains("expected 8"));
        assert!(msg.contains("got 16"));
    }

    #[test]
    fn test_only_transient_io_is_retryable() {
        assert!(ExpertError::TransientIo("reset".into()).is_transient());
        assert!(!ExpertError::not_found("x").is_transient());
        assert!(!ExpertError::config("x").is_transient());
    }
}
