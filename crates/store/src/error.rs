//! Error types for the store crate.

use thiserror::Error;

use crate::types::{GroupVersionKind, ObjectKey};

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Store error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Object does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: String, key: String },

    /// Object already exists on create.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: String, key: String },

    /// Optimistic concurrency check failed.
    #[error("conflict writing '{key}': expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Object failed validation.
    #[error("invalid object: {reason}")]
    Invalid { reason: String },

    /// Typed conversion failed.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Watch channel closed.
    #[error("watch channel closed")]
    ChannelClosed,

    /// The watcher fell behind and missed events; re-list to catch up.
    #[error("watch on {kind} lagged, {skipped} events dropped")]
    Lagged { kind: String, skipped: u64 },
}

impl Error {
    /// Create a not found error.
    pub fn not_found(kind: &GroupVersionKind, key: &ObjectKey) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            key: key.to_string(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: &GroupVersionKind, key: &ObjectKey) -> Self {
        Self::AlreadyExists {
            kind: kind.to_string(),
            key: key.to_string(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(key: &ObjectKey, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            key: key.to_string(),
            expected,
            actual,
        }
    }

    /// Create an invalid object error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Whether the object was missing.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a watch missed events.
    pub const fn is_lagged(&self) -> bool {
        matches!(self, Self::Lagged { .. })
    }

    /// Whether a stale write was rejected.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found(
            &GroupVersionKind::new("", "v1", "Secret"),
            &ObjectKey::new("db", "creds"),
        );
        assert!(err.is_not_found());
        assert!(err.to_string().contains("db/creds"));
    }

    #[test]
    fn test_conflict() {
        let err = Error::conflict(&ObjectKey::new("db", "db1"), 3, 4);
        assert!(err.is_conflict());
        assert!(err.to_string().contains("expected version 3"));
    }
}
