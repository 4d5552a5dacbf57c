//! Durable reference store
//!
//! Readers take an `Arc` of the whole map and never wait on writers. Writers
//! are serialized: each one copies the map, applies its change, persists the
//! result to `references/references.json`, and only then swaps the new map
//! in. Memory never runs ahead of disk.

use crate::error::StoreError;
use crate::reference::{ErrorInfo, RefStatus, Reference};
use crate::seed::{SeedBundle, SeedEntry};
use crate::transition::is_allowed;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use refcache_artifact::{
    validate_reference_name, write_atomic, ArtifactCache, DataRoot, VersionId, VersionPointer,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the persisted store under `references/`
pub const STORE_FILE: &str = "references.json";

const FORMAT_VERSION: u32 = 1;

type RefMap = BTreeMap<String, Arc<Reference>>;

#[derive(Deserialize)]
struct StoreFile {
    #[allow(dead_code)]
    format: u32,
    references: BTreeMap<String, Reference>,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    format: u32,
    references: BTreeMap<&'a str, &'a Reference>,
}

/// Outcome of merging a [`SeedBundle`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub inserted: Vec<String>,
    pub skipped: usize,
}

/// Name -> [`Reference`] mapping persisted on the data volume
pub struct ReferenceStore {
    root: DataRoot,
    path: PathBuf,
    current: RwLock<Arc<RefMap>>,
    writer: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ReferenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceStore")
            .field("path", &self.path)
            .field("references", &self.len())
            .finish_non_exhaustive()
    }
}

impl ReferenceStore {
    /// Load the store from `root`, creating an empty one if none exists
    ///
    /// References left `Refreshing` by a previous process are released back
    /// to `Stale` (or `Failed` if they carry an error).
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub async fn open(root: DataRoot) -> Result<Self, StoreError> {
        root.ensure()?;
        let path = root.references().join(STORE_FILE);
        let mut map = read_store_file(&path).await?;

        let mut released = 0usize;
        for reference in map.values_mut() {
            if reference.status == RefStatus::Refreshing {
                let mut r = (**reference).clone();
                r.status = resting_status(&r);
                *reference = Arc::new(r);
                released += 1;
            }
        }

        let store = Self {
            root,
            path,
            current: RwLock::new(Arc::new(map)),
            writer: tokio::sync::Mutex::new(()),
        };

        if released > 0 {
            tracing::warn!(released, "released references left refreshing by a previous run");
            let map = store.current.read().clone();
            store.persist(&map).await?;
        }

        tracing::info!(path = %store.path.display(), references = store.len(), "reference store loaded");
        Ok(store)
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one reference
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for unknown names
    pub fn get(&self, name: &str) -> Result<Arc<Reference>, StoreError> {
        self.current
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// All references, ordered by name
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Reference>> {
        self.current.read().values().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.current.read().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Insert every seed entry whose name is not already stored
    ///
    /// Existing entries are never touched, so repeated seeding is a no-op.
    ///
    /// # Errors
    /// Returns an error if the merged store cannot be persisted
    #[tracing::instrument(level = "debug", skip_all, fields(seed = bundle.len()))]
    pub async fn seed(&self, bundle: &SeedBundle) -> Result<SeedReport, StoreError> {
        let now = Utc::now();
        let _guard = self.writer.lock().await;
        let mut next = self.clone_map();
        let mut report = SeedReport::default();

        for (name, entry) in bundle.iter() {
            if next.contains_key(name) {
                report.skipped += 1;
                continue;
            }
            next.insert(name.to_string(), Arc::new(entry.to_reference(name, now)));
            report.inserted.push(name.to_string());
        }

        if !report.inserted.is_empty() {
            self.commit(next).await?;
            tracing::info!(inserted = ?report.inserted, skipped = report.skipped, "seeded references");
        }
        Ok(report)
    }

    /// Register a new reference
    ///
    /// # Errors
    /// [`StoreError::AlreadyExists`] if the name is taken; an artifact error
    /// if the name is not path-safe
    pub async fn register(&self, name: &str, entry: &SeedEntry) -> Result<Arc<Reference>, StoreError> {
        validate_reference_name(name)?;
        let reference = Arc::new(entry.to_reference(name, Utc::now()));
        let _guard = self.writer.lock().await;
        let mut next = self.clone_map();
        if next.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        next.insert(name.to_string(), reference.clone());
        self.commit(next).await?;
        tracing::info!(reference = name, kind = %entry.kind, "registered reference");
        Ok(reference)
    }

    /// Claim a reference for refresh and stamp the attempt time
    ///
    /// # Errors
    /// Unknown name, or the reference is already refreshing
    pub async fn mark_refreshing(&self, name: &str) -> Result<Arc<Reference>, StoreError> {
        let now = Utc::now();
        self.transition(name, RefStatus::Refreshing, |r| {
            r.last_attempt_at = Some(now);
        })
        .await
    }

    /// Point the reference at a newly stored version
    ///
    /// # Errors
    /// Unknown name, or the reference is not refreshing
    pub async fn upsert_on_success(
        &self,
        name: &str,
        version: VersionId,
        at: DateTime<Utc>,
    ) -> Result<Arc<Reference>, StoreError> {
        self.transition(name, RefStatus::Fresh, |r| {
            r.current_version = Some(version);
            r.last_success_at = Some(at);
            r.last_error = None;
        })
        .await
    }

    /// Record a terminal refresh failure; `current_version` is kept
    ///
    /// # Errors
    /// Unknown name, or the reference is not refreshing
    pub async fn mark_failed(&self, name: &str, error: ErrorInfo) -> Result<Arc<Reference>, StoreError> {
        self.transition(name, RefStatus::Failed, |r| {
            r.last_error = Some(error);
        })
        .await
    }

    /// Release a refresh abandoned before completion
    ///
    /// # Errors
    /// Unknown name, or the reference is not refreshing
    pub async fn mark_abandoned(&self, name: &str) -> Result<Arc<Reference>, StoreError> {
        let to = match self.get(name)?.last_error {
            Some(_) => RefStatus::Failed,
            None => RefStatus::Stale,
        };
        self.transition(name, to, |_| {}).await
    }

    /// Repair pointers to versions missing from `cache`
    ///
    /// A dangling pointer falls back to the newest stored version, or to no
    /// version at all, and the reference becomes `Stale`. The timer alone
    /// would wait out the regular interval, so callers refresh the returned
    /// names explicitly ([`crate::Service::start`] does).
    ///
    /// # Errors
    /// Returns an error if the repaired store cannot be persisted
    pub async fn reconcile(&self, cache: &ArtifactCache) -> Result<Vec<String>, StoreError> {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_map();
        let mut repaired = Vec::new();

        for (name, reference) in &mut next {
            let Some(current) = reference.current_version else {
                continue;
            };
            if cache.contains(name, current) {
                continue;
            }
            let fallback = cache.versions(name).last().map(|v| v.version_id);
            tracing::error!(reference = %name, missing = %current, fallback = ?fallback, "current version missing, repairing pointer");
            let mut r = (**reference).clone();
            r.current_version = fallback;
            if fallback.is_none() {
                r.last_success_at = None;
            }
            r.status = RefStatus::Stale;
            r.updated_at = Utc::now();
            *reference = Arc::new(r);
            repaired.push(name.clone());
        }

        if !repaired.is_empty() {
            self.commit(next).await?;
        }
        Ok(repaired)
    }

    async fn transition<F>(&self, name: &str, to: RefStatus, apply: F) -> Result<Arc<Reference>, StoreError>
    where
        F: FnOnce(&mut Reference),
    {
        let _guard = self.writer.lock().await;
        let mut next = self.clone_map();
        let existing = next
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if !is_allowed(existing.status, to) {
            return Err(StoreError::IllegalTransition {
                reference: name.to_string(),
                from: existing.status,
                to,
            });
        }

        let mut updated = (**existing).clone();
        updated.status = to;
        updated.updated_at = Utc::now();
        apply(&mut updated);
        let updated = Arc::new(updated);
        next.insert(name.to_string(), updated.clone());

        self.commit(next).await?;
        tracing::debug!(reference = name, status = ?to, "reference updated");
        Ok(updated)
    }

    fn clone_map(&self) -> RefMap {
        (**self.current.read()).clone()
    }

    // Caller must hold the writer lock
    async fn commit(&self, next: RefMap) -> Result<(), StoreError> {
        let next = Arc::new(next);
        self.persist(&next).await?;
        *self.current.write() = next;
        Ok(())
    }

    async fn persist(&self, map: &RefMap) -> Result<(), StoreError> {
        let file = StoreFileRef {
            format: FORMAT_VERSION,
            references: map.iter().map(|(k, v)| (k.as_str(), v.as_ref())).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.root.tmp(), &self.path, &bytes).await?;
        Ok(())
    }
}

impl VersionPointer for ReferenceStore {
    fn current_version(&self, reference: &str) -> Option<VersionId> {
        self.current
            .read()
            .get(reference)
            .and_then(|r| r.current_version)
    }
}

fn resting_status(reference: &Reference) -> RefStatus {
    if reference.last_error.is_some() {
        RefStatus::Failed
    } else {
        RefStatus::Stale
    }
}

async fn read_store_file(path: &Path) -> Result<RefMap, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RefMap::new()),
        Err(e) => {
            return Err(StoreError::Artifact(refcache_artifact::ArtifactError::Storage {
                path: path.to_path_buf(),
                source: e,
            }))
        }
    };
    let file: StoreFile = serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file
        .references
        .into_iter()
        .map(|(name, reference)| (name, Arc::new(reference)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ErrorKind;
    use refcache_artifact::ArtifactKind;
    use serde_json::json;
    use std::time::Duration;

    fn weather_seed() -> SeedBundle {
        SeedBundle::empty().with_entry(
            "weather",
            SeedEntry::new(
                ArtifactKind::Parquet,
                json!({"type": "http", "url": "https://example.test/weather"}),
                Duration::from_secs(3600),
            ),
        )
    }

    async fn open(dir: &Path) -> ReferenceStore {
        ReferenceStore::open(DataRoot::new(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;

        let first = store.seed(&weather_seed()).await.unwrap();
        assert_eq!(first.inserted, vec!["weather".to_string()]);
        let before = store.get("weather").unwrap();

        let second = store.seed(&weather_seed()).await.unwrap();
        assert!(second.inserted.is_empty());
        assert_eq!(second.skipped, 1);
        assert_eq!(store.get("weather").unwrap(), before);
    }

    #[tokio::test]
    async fn seed_never_overwrites_volume_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.seed(&weather_seed()).await.unwrap();
        store.mark_refreshing("weather").await.unwrap();
        store
            .upsert_on_success("weather", VersionId::FIRST, Utc::now())
            .await
            .unwrap();

        let changed = SeedBundle::empty().with_entry(
            "weather",
            SeedEntry::new(ArtifactKind::Image, json!({}), Duration::from_secs(60)),
        );
        store.seed(&changed).await.unwrap();

        let r = store.get("weather").unwrap();
        assert_eq!(r.kind, ArtifactKind::Parquet);
        assert_eq!(r.current_version, Some(VersionId::FIRST));
    }

    #[tokio::test]
    async fn lifecycle_updates_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path()).await;
            store.seed(&weather_seed()).await.unwrap();
            store.mark_refreshing("weather").await.unwrap();
            store
                .upsert_on_success("weather", VersionId::new(1), Utc::now())
                .await
                .unwrap();
        }

        let store = open(dir.path()).await;
        let r = store.get("weather").unwrap();
        assert_eq!(r.status, RefStatus::Fresh);
        assert_eq!(r.current_version, Some(VersionId::new(1)));
        assert!(r.last_success_at.is_some());
        assert_eq!(store.current_version("weather"), Some(VersionId::new(1)));
    }

    #[tokio::test]
    async fn failure_keeps_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.seed(&weather_seed()).await.unwrap();
        store.mark_refreshing("weather").await.unwrap();
        store
            .upsert_on_success("weather", VersionId::new(1), Utc::now())
            .await
            .unwrap();

        store.mark_refreshing("weather").await.unwrap();
        let error = ErrorInfo::new(ErrorKind::Permanent, "404", 1, Utc::now());
        let r = store.mark_failed("weather", error.clone()).await.unwrap();

        assert_eq!(r.status, RefStatus::Failed);
        assert_eq!(r.current_version, Some(VersionId::new(1)));
        assert_eq!(r.last_error, Some(error));
    }

    #[tokio::test]
    async fn success_clears_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.seed(&weather_seed()).await.unwrap();
        store.mark_refreshing("weather").await.unwrap();
        store
            .mark_failed("weather", ErrorInfo::new(ErrorKind::Transient, "timeout", 5, Utc::now()))
            .await
            .unwrap();
        store.mark_refreshing("weather").await.unwrap();
        let r = store
            .upsert_on_success("weather", VersionId::new(1), Utc::now())
            .await
            .unwrap();
        assert!(r.last_error.is_none());
    }

    #[tokio::test]
    async fn double_refreshing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.seed(&weather_seed()).await.unwrap();
        store.mark_refreshing("weather").await.unwrap();
        let err = store.mark_refreshing("weather").await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        assert!(store.get("nope").unwrap_err().is_not_found());
        assert!(store.mark_refreshing("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn register_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let entry = SeedEntry::new(ArtifactKind::Model, json!({"type": "file", "path": "/m"}), Duration::from_secs(60));
        store.register("model_a", &entry).await.unwrap();
        let err = store.register("model_a", &entry).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert!(store.register("bad/name", &entry).await.is_err());
    }

    #[tokio::test]
    async fn reopen_releases_interrupted_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path()).await;
            store.seed(&weather_seed()).await.unwrap();
            store.mark_refreshing("weather").await.unwrap();
        }
        let store = open(dir.path()).await;
        assert_eq!(store.get("weather").unwrap().status, RefStatus::Stale);
    }

    #[tokio::test]
    async fn abandoned_refresh_returns_to_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.seed(&weather_seed()).await.unwrap();
        store.mark_refreshing("weather").await.unwrap();
        let r = store.mark_abandoned("weather").await.unwrap();
        assert_eq!(r.status, RefStatus::Stale);
        assert!(r.current_version.is_none());
    }

    #[tokio::test]
    async fn reconcile_repairs_dangling_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        let store = open(dir.path()).await;
        let cache = ArtifactCache::open(root, refcache_artifact::CacheConfig::default()).unwrap();
        store.seed(&weather_seed()).await.unwrap();

        let v1 = cache.put("weather", ArtifactKind::Parquet, b"1").await.unwrap();
        store.mark_refreshing("weather").await.unwrap();
        store
            .upsert_on_success("weather", VersionId::new(2), Utc::now())
            .await
            .unwrap();

        let repaired = store.reconcile(&cache).await.unwrap();
        assert_eq!(repaired, vec!["weather".to_string()]);
        let r = store.get("weather").unwrap();
        assert_eq!(r.current_version, Some(v1.version_id));
        assert_eq!(r.status, RefStatus::Stale);

        assert!(store.reconcile(&cache).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_store_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        root.ensure().unwrap();
        std::fs::write(root.references().join(STORE_FILE), "{not json").unwrap();
        let err = ReferenceStore::open(root).await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }
}
