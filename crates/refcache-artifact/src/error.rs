//! Artifact storage errors

use crate::checksum::Checksum;
use crate::version::VersionId;
use std::path::{Path, PathBuf};

/// Errors raised by [`crate::ArtifactCache`] and the data root layout
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// No such version for this reference (never written, or pruned)
    #[error("artifact not found: {reference}@{version}")]
    NotFound { reference: String, version: VersionId },

    /// Reference name cannot be used as a path component
    #[error("invalid reference name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Filesystem failure
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata file could not be encoded or decoded
    #[error("metadata error at {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Payload on disk no longer matches its recorded checksum
    #[error("checksum mismatch for {reference}@{version}: expected {expected}, found {actual}")]
    Corrupted {
        reference: String,
        version: VersionId,
        expected: Checksum,
        actual: Checksum,
    },
}

impl ArtifactError {
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Build an [`ArtifactError::Storage`] tagged with the offending path
pub(crate) fn io_error(path: &Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn metadata_error(path: &Path, source: serde_json::Error) -> ArtifactError {
    ArtifactError::Metadata {
        path: path.to_path_buf(),
        source,
    }
}
