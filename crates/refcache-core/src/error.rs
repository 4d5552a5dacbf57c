//! Error types for refcache core
//!
//! The refresh pipeline classifies failures as:
//! - Transient fetch failures (retried with backoff)
//! - Permanent fetch failures (fail the refresh immediately)
//! - Storage failures (never retried, cached data untouched)
//! - Not found (unknown reference or no artifact yet)

use crate::reference::{ErrorKind, RefStatus};
use refcache_artifact::ArtifactError;
use std::path::PathBuf;

/// Main refcache error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("refresh failed: {0}")]
    Execute(#[from] ExecuteError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("trigger rejected: {0}")]
    Trigger(#[from] TriggerError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Check if retrying the same operation could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Execute(e) => e.kind() == ErrorKind::Transient,
            Self::Snapshot(SnapshotError::NotYetAvailable(_)) => true,
            _ => false,
        }
    }
}

/// Failure reported by a [`crate::Fetcher`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Timeouts, connection resets, rate limits, upstream 5xx
    #[error("transient: {0}")]
    Transient(String),

    /// Bad descriptor, auth failure, validation failure
    #[error("permanent: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Terminal outcome of a failed [`crate::FetchExecutor::execute`]
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// Fetch gave up (permanent error, or transient retries exhausted)
    #[error("{error} after {attempts} attempt(s)")]
    Fetch { error: FetchError, attempts: u32 },

    /// Artifact could not be stored; never retried
    #[error("storage: {0}")]
    Storage(#[from] ArtifactError),

    /// Shutdown interrupted the job before anything was written
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl ExecuteError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch { error, .. } => error.kind(),
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fetch { attempts, .. } | Self::Cancelled { attempts } => *attempts,
            Self::Storage(_) => 1,
        }
    }
}

/// Reference store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("reference not found: {0}")]
    NotFound(String),

    #[error("reference already exists: {0}")]
    AlreadyExists(String),

    #[error("illegal status transition for {reference}: {from:?} -> {to:?}")]
    IllegalTransition {
        reference: String,
        from: RefStatus,
        to: RefStatus,
    },

    #[error("store file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("seed file {path}: {message}")]
    Seed { path: PathBuf, message: String },

    /// Persisting to disk failed, or the reference name is unusable
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl StoreError {
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Read-path failures
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// No reference with this name exists
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    /// Reference exists but has never been refreshed successfully
    #[error("no artifact available yet for {0}")]
    NotYetAvailable(String),

    #[error(transparent)]
    Storage(#[from] ArtifactError),
}

/// Reasons a refresh trigger is refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// The refresh could not be recorded in the reference store
    #[error("could not record refresh: {0}")]
    Store(String),
}

/// Configuration loading and validation failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Result alias for refcache operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_fetch_failures_are_retryable() {
        assert!(FetchError::transient("timeout").is_retryable());
        assert!(!FetchError::permanent("401").is_retryable());

        let exhausted = Error::from(ExecuteError::Fetch {
            error: FetchError::transient("timeout"),
            attempts: 5,
        });
        assert!(exhausted.is_retryable());

        let cancelled = Error::from(ExecuteError::Cancelled { attempts: 1 });
        assert!(!cancelled.is_retryable());
    }

    #[test]
    fn execute_error_kinds() {
        let e = ExecuteError::Fetch {
            error: FetchError::permanent("bad url"),
            attempts: 1,
        };
        assert_eq!(e.kind(), ErrorKind::Permanent);
        assert_eq!(e.attempts(), 1);
        assert_eq!(e.to_string(), "permanent: bad url after 1 attempt(s)");
    }
}
