//! Read path for the serving layer
//!
//! A snapshot pairs a reference's metadata with the exact artifact version
//! it points at. Readers never wait on refreshes: they read the current
//! pointer, then that immutable version.

use crate::error::SnapshotError;
use crate::reference::Reference;
use crate::store::ReferenceStore;
use chrono::Utc;
use refcache_artifact::{ArtifactCache, ArtifactVersion, Payload};
use serde::Serialize;
use std::sync::Arc;

// A pointer can only move forward, so a few re-reads always converge
const POINTER_READ_ATTEMPTS: usize = 3;

/// Consistent view of one reference
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub reference: Arc<Reference>,
    pub version: ArtifactVersion,
    pub payload: Payload,
    /// Served data is older than one refresh interval
    pub is_overdue: bool,
}

impl Snapshot {
    /// Everything except the payload bytes
    #[must_use]
    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            reference: (*self.reference).clone(),
            version: self.version.clone(),
            is_overdue: self.is_overdue,
        }
    }
}

/// Serializable snapshot description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotMetadata {
    pub reference: Reference,
    pub version: ArtifactVersion,
    pub is_overdue: bool,
}

/// Read-only access to references and their current artifacts
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    store: Arc<ReferenceStore>,
    cache: Arc<ArtifactCache>,
}

impl SnapshotReader {
    #[must_use]
    pub fn new(store: Arc<ReferenceStore>, cache: Arc<ArtifactCache>) -> Self {
        Self { store, cache }
    }

    /// Current artifact and metadata of `name`
    ///
    /// A failed reference still returns its last good artifact.
    ///
    /// # Errors
    /// [`SnapshotError::UnknownReference`], [`SnapshotError::NotYetAvailable`]
    /// for a reference that never refreshed successfully, or a storage error
    pub async fn snapshot(&self, name: &str) -> Result<Snapshot, SnapshotError> {
        let mut last_miss = None;

        for _ in 0..POINTER_READ_ATTEMPTS {
            let reference = self
                .store
                .get(name)
                .map_err(|_| SnapshotError::UnknownReference(name.to_string()))?;
            let Some(version_id) = reference.current_version else {
                return Err(SnapshotError::NotYetAvailable(name.to_string()));
            };

            let Some(version) = self.cache.version(name, version_id) else {
                last_miss = Some(version_id);
                continue;
            };
            match self.cache.get(name, version_id).await {
                Ok(payload) => {
                    return Ok(Snapshot {
                        is_overdue: reference.is_overdue(Utc::now()),
                        reference,
                        version,
                        payload,
                    });
                }
                Err(e) if e.is_not_found() => last_miss = Some(version_id),
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(reference = name, version = ?last_miss, "current version missing from artifact cache");
        Err(SnapshotError::Storage(refcache_artifact::ArtifactError::NotFound {
            reference: name.to_string(),
            version: last_miss.unwrap_or(refcache_artifact::VersionId::FIRST),
        }))
    }

    /// Metadata only, for references with or without an artifact
    ///
    /// # Errors
    /// [`SnapshotError::UnknownReference`] for unknown names
    pub fn reference(&self, name: &str) -> Result<Arc<Reference>, SnapshotError> {
        self.store
            .get(name)
            .map_err(|_| SnapshotError::UnknownReference(name.to_string()))
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<Reference>> {
        self.store.list()
    }

    /// Stored versions of `name`, oldest first
    #[must_use]
    pub fn versions(&self, name: &str) -> Vec<ArtifactVersion> {
        self.cache.versions(name)
    }
}
