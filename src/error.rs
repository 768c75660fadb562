//! Public error taxonomy.
//!
//! Every fallible operation on the manager resolves to one of four kinds so
//! the enclosing service can decide on a status code without inspecting
//! messages: `NotFound` maps to 404, everything else to 5xx.
//!
//! The type is `Clone` because a single producer's result is delivered to
//! every waiter attached to its single-flight key.

use thiserror::Error;

/// Errors surfaced by artifact operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The version string failed to parse as a semantic version.
    #[error("invalid version {input:?}: {reason}")]
    InvalidVersion { input: String, reason: String },

    /// Unknown version, registry 404, or a missing file inside a cache entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Registry connectivity failure or an HTTP error other than 404.
    #[error("registry transport error: {0}")]
    Transport(String),

    /// Filesystem failure, malformed remote data, or a producer bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_version(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidVersion {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error should surface as a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn io(context: &str, err: &std::io::Error) -> Self {
        Self::Internal(format!("{context}: {err}"))
    }
}
