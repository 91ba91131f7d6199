//! Error types for the reconciler crate.

use std::fmt;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug)]
pub enum Error {
    /// Store operation failed.
    Store(fleet_store::Error),
    /// A check failed and the failure was propagated to the scheduler.
    CheckFailed { check: String, message: String },
    /// Key was never stored in the request locals.
    LocalNotFound { key: String },
    /// Key is stored in the locals with a different type.
    LocalTypeMismatch { key: String },
    /// A dependency call failed.
    Dependency { operation: String, reason: String },
    /// A dependency call did not finish in time.
    Timeout { operation: String, timeout_ms: u64 },
    /// Reconciliation failed for another reason.
    ReconcileFailed { reason: String },
    /// Invalid configuration.
    InvalidConfig { reason: String },
    /// Loading configuration failed.
    Config(fleet_core::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::CheckFailed { check, message } => {
                write!(f, "check '{check}' failed: {message}")
            }
            Self::LocalNotFound { key } => write!(f, "'{key}' not in locals"),
            Self::LocalTypeMismatch { key } => {
                write!(f, "local '{key}' holds a value of another type")
            }
            Self::Dependency { operation, reason } => {
                write!(f, "dependency call '{operation}' failed: {reason}")
            }
            Self::Timeout {
                operation,
                timeout_ms,
            } => write!(f, "dependency call '{operation}' timed out after {timeout_ms}ms"),
            Self::ReconcileFailed { reason } => write!(f, "reconciliation failed: {reason}"),
            Self::InvalidConfig { reason } => write!(f, "invalid configuration: {reason}"),
            Self::Config(err) => write!(f, "configuration error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<fleet_store::Error> for Error {
    fn from(err: fleet_store::Error) -> Self {
        Self::Store(err)
    }
}

impl From<fleet_core::Error> for Error {
    fn from(err: fleet_core::Error) -> Self {
        Self::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(fleet_store::Error::from(err))
    }
}

impl Error {
    /// Create a check failed error.
    pub fn check_failed(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CheckFailed {
            check: check.into(),
            message: message.into(),
        }
    }

    /// Create a local not found error.
    pub fn local_not_found(key: impl Into<String>) -> Self {
        Self::LocalNotFound { key: key.into() }
    }

    /// Create a dependency error.
    pub fn dependency(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dependency {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a reconcile failed error.
    pub fn reconcile_failed(reason: impl Into<String>) -> Self {
        Self::ReconcileFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether this is a stale write rejected by the store.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_conflict())
    }

    /// Whether the object was missing in the store.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_not_found())
    }
}
