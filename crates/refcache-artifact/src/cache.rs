//! Versioned artifact cache
//!
//! Stores immutable payloads keyed by reference name and [`VersionId`]:
//! - Append-only: a version is written once and never overwritten
//! - Durable: `put` returns only after payload and metadata are on disk
//! - Checked: every read from disk is verified against its checksum
//! - Bounded: `prune` drops versions outside a retention window
//!
//! A version exists iff its `<version>.meta.json` marker exists. The payload
//! is renamed into place before the marker, so a crash between the two
//! leaves an orphan payload that [`ArtifactCache::open`] removes.

use crate::checksum::Checksum;
use crate::durable::{remove_quietly, write_atomic};
use crate::error::{io_error, metadata_error, ArtifactError};
use crate::layout::{validate_reference_name, DataRoot};
use crate::version::{ArtifactKind, ArtifactVersion, VersionId};
use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared, immutable payload bytes
pub type Payload = Arc<[u8]>;

const META_SUFFIX: &str = ".meta.json";

/// Source of truth for which version of a reference is current
///
/// The cache never decides this itself; it asks whoever owns reference
/// metadata. Versions reported here are never pruned.
pub trait VersionPointer: Send + Sync {
    fn current_version(&self, reference: &str) -> Option<VersionId>;
}

/// Tuning for the in-memory hot payload cache
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Upper bound on payload bytes kept in memory
    pub hot_capacity_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity_bytes: 256 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_hot_capacity(mut self, bytes: u64) -> Self {
        self.hot_capacity_bytes = bytes;
        self
    }
}

/// Point-in-time counters for health and admin output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub references: usize,
    pub versions: usize,
    pub stored_bytes: u64,
    pub hot_entries: u64,
}

/// Versioned, checksummed storage for materialized artifacts
pub struct ArtifactCache {
    root: DataRoot,
    index: DashMap<String, BTreeMap<VersionId, ArtifactVersion>>,
    /// Last assigned version per reference
    counters: DashMap<String, Arc<Mutex<VersionId>>>,
    hot: Cache<(String, VersionId), Payload>,
    pointer: RwLock<Option<Arc<dyn VersionPointer>>>,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("root", &self.root)
            .field("references", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    /// Open the cache under `root`, creating the layout if needed
    ///
    /// Existing versions are indexed, orphaned payloads and leftover scratch
    /// files are removed, and version counters resume after the highest
    /// version found.
    ///
    /// # Errors
    /// Returns an error if the layout cannot be created or scanned
    pub fn open(root: DataRoot, config: CacheConfig) -> Result<Self, ArtifactError> {
        root.ensure()?;
        clear_dir(&root.tmp())?;

        let cache = Self {
            hot: Cache::builder()
                .max_capacity(config.hot_capacity_bytes)
                .weigher(|_key, payload: &Payload| {
                    u32::try_from(payload.len()).unwrap_or(u32::MAX)
                })
                .build(),
            root,
            index: DashMap::new(),
            counters: DashMap::new(),
            pointer: RwLock::new(None),
        };

        for kind in ArtifactKind::ALL {
            cache.scan_kind(kind)?;
        }

        for entry in &cache.index {
            if let Some(last) = entry.value().keys().next_back() {
                cache
                    .counters
                    .insert(entry.key().clone(), Arc::new(Mutex::new(*last)));
            }
        }

        let stats = cache.stats();
        tracing::info!(
            root = %cache.root.root().display(),
            references = stats.references,
            versions = stats.versions,
            "artifact cache opened"
        );
        Ok(cache)
    }

    /// Attach the owner of current-version pointers
    pub fn set_pointer(&self, pointer: Arc<dyn VersionPointer>) {
        *self.pointer.write() = Some(pointer);
    }

    #[inline]
    #[must_use]
    pub fn data_root(&self) -> &DataRoot {
        &self.root
    }

    /// Store a new version of `reference`
    ///
    /// # Errors
    /// Returns an error for an invalid name or any storage failure. Nothing is
    /// indexed unless both payload and metadata were written.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(size = payload.len()))]
    pub async fn put(
        &self,
        reference: &str,
        kind: ArtifactKind,
        payload: &[u8],
    ) -> Result<ArtifactVersion, ArtifactError> {
        validate_reference_name(reference)?;
        let version_id = self.allocate(reference);

        let dir = self.root.reference_dir(kind, reference);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let meta_path = dir.join(format!("{}{META_SUFFIX}", version_id.file_stem()));

        if tokio::fs::try_exists(&meta_path).await.unwrap_or(false) {
            return Err(io_error(
                &meta_path,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "version already stored"),
            ));
        }

        let version = ArtifactVersion {
            reference_name: reference.to_string(),
            version_id,
            kind,
            created_at: Utc::now(),
            size: payload.len() as u64,
            checksum: Checksum::of(payload),
        };
        let payload_path = dir.join(version.payload_file_name());
        let tmp = self.root.tmp();
        write_atomic(&tmp, &payload_path, payload).await?;

        let meta = match serde_json::to_vec_pretty(&version) {
            Ok(meta) => meta,
            Err(e) => {
                remove_quietly(&payload_path).await;
                return Err(metadata_error(&meta_path, e));
            }
        };
        if let Err(e) = write_atomic(&tmp, &meta_path, &meta).await {
            remove_quietly(&payload_path).await;
            return Err(e);
        }

        self.index
            .entry(reference.to_string())
            .or_default()
            .insert(version_id, version.clone());

        tracing::info!(
            reference,
            version = %version_id,
            kind = %kind,
            checksum = %version.checksum.short(),
            "artifact stored"
        );
        Ok(version)
    }

    /// Read the payload of one exact version
    ///
    /// # Errors
    /// [`ArtifactError::NotFound`] if the version was never stored or has been
    /// pruned; [`ArtifactError::Corrupted`] if the bytes fail verification.
    pub async fn get(&self, reference: &str, version: VersionId) -> Result<Payload, ArtifactError> {
        let meta = self
            .version(reference, version)
            .ok_or_else(|| not_found(reference, version))?;

        let key = (reference.to_string(), version);
        if let Some(payload) = self.hot.get(&key).await {
            return Ok(payload);
        }

        let payload = load(&self.payload_path(&meta), &meta).await?;
        // A concurrent prune may have removed the version while we read it
        if self.contains(reference, version) {
            self.hot.insert(key, payload.clone()).await;
        }
        Ok(payload)
    }

    /// Current version according to the attached [`VersionPointer`]
    ///
    /// Without a pointer the newest stored version is reported.
    #[must_use]
    pub fn latest(&self, reference: &str) -> Option<VersionId> {
        match self.pointer.read().as_ref() {
            Some(pointer) => pointer.current_version(reference),
            None => self
                .index
                .get(reference)
                .and_then(|versions| versions.keys().next_back().copied()),
        }
    }

    /// Delete versions outside the newest `retain_count`, never touching the
    /// current version. Returns the removed version ids, oldest first.
    ///
    /// # Errors
    /// Returns [`ArtifactError::InvalidName`] for a bad name. Failed file
    /// removals are logged; the leftovers are swept by the next `open`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn prune(
        &self,
        reference: &str,
        retain_count: usize,
    ) -> Result<Vec<VersionId>, ArtifactError> {
        validate_reference_name(reference)?;
        let current = self.latest(reference);

        let doomed: Vec<ArtifactVersion> = {
            let Some(mut versions) = self.index.get_mut(reference) else {
                return Ok(Vec::new());
            };
            let keep: BTreeSet<VersionId> = versions
                .keys()
                .rev()
                .take(retain_count)
                .copied()
                .chain(current)
                .collect();
            let ids: Vec<VersionId> = versions
                .keys()
                .filter(|v| !keep.contains(v))
                .copied()
                .collect();
            ids.iter().filter_map(|id| versions.remove(id)).collect()
        };

        for version in &doomed {
            self.hot
                .invalidate(&(reference.to_string(), version.version_id))
                .await;
            let dir = self.root.reference_dir(version.kind, reference);
            remove_quietly(&dir.join(format!("{}{META_SUFFIX}", version.version_id.file_stem())))
                .await;
            remove_quietly(&dir.join(version.payload_file_name())).await;
        }

        let removed: Vec<VersionId> = doomed.iter().map(|v| v.version_id).collect();
        if !removed.is_empty() {
            tracing::info!(reference, removed = removed.len(), "pruned artifact versions");
        }
        Ok(removed)
    }

    /// Where the payload of `version` lives under this cache's data root
    #[must_use]
    pub fn payload_path(&self, version: &ArtifactVersion) -> PathBuf {
        self.root
            .reference_dir(version.kind, &version.reference_name)
            .join(version.payload_file_name())
    }

    /// Metadata for one version, if stored
    #[must_use]
    pub fn version(&self, reference: &str, version: VersionId) -> Option<ArtifactVersion> {
        self.index
            .get(reference)
            .and_then(|versions| versions.get(&version).cloned())
    }

    #[must_use]
    pub fn contains(&self, reference: &str, version: VersionId) -> bool {
        self.index
            .get(reference)
            .is_some_and(|versions| versions.contains_key(&version))
    }

    /// Every stored version of `reference`, oldest first
    #[must_use]
    pub fn versions(&self, reference: &str) -> Vec<ArtifactVersion> {
        self.index
            .get(reference)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// True when no artifact of any reference has been stored yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.iter().all(|entry| entry.value().is_empty())
    }

    /// Layout directories exist and are usable
    pub async fn is_ready(&self) -> bool {
        for dir in self.root.required_dirs() {
            match tokio::fs::metadata(&dir).await {
                Ok(meta) if meta.is_dir() => {}
                _ => return false,
            }
        }
        true
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hot_entries: self.hot.entry_count(),
            ..CacheStats::default()
        };
        for entry in &self.index {
            if entry.value().is_empty() {
                continue;
            }
            stats.references += 1;
            stats.versions += entry.value().len();
            stats.stored_bytes += entry.value().values().map(|v| v.size).sum::<u64>();
        }
        stats
    }

    fn allocate(&self, reference: &str) -> VersionId {
        let counter = self
            .counters
            .entry(reference.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VersionId::new(0))))
            .clone();
        let mut last = counter.lock();
        *last = last.next();
        *last
    }

    fn scan_kind(&self, kind: ArtifactKind) -> Result<(), ArtifactError> {
        let kind_dir = self.root.kind_dir(kind);
        for entry in read_dir(&kind_dir)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_dir() || validate_reference_name(name).is_err() {
                tracing::warn!(path = %path.display(), "skipping unexpected entry in artifact directory");
                continue;
            }
            for version in scan_reference_dir(&path, name, kind)? {
                self.index
                    .entry(name.to_string())
                    .or_default()
                    .insert(version.version_id, version);
            }
        }
        Ok(())
    }
}

/// Index one reference directory, deleting payloads without a metadata marker
///
/// Payload paths are resolved against `dir`, never taken from the metadata.
fn scan_reference_dir(
    dir: &Path,
    reference: &str,
    kind: ArtifactKind,
) -> Result<Vec<ArtifactVersion>, ArtifactError> {
    let mut versions = Vec::new();
    let mut committed: HashSet<String> = HashSet::new();
    let mut payloads: Vec<PathBuf> = Vec::new();

    for entry in read_dir(dir)? {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(stem) = file_name.strip_suffix(META_SUFFIX) {
            let bytes = std::fs::read(&path).map_err(|e| io_error(&path, e))?;
            let version: ArtifactVersion =
                serde_json::from_slice(&bytes).map_err(|e| metadata_error(&path, e))?;
            if version.reference_name != reference || version.kind != kind {
                tracing::warn!(path = %path.display(), "metadata does not match its directory, leaving in place");
                committed.insert(stem.to_string());
                continue;
            }
            if dir.join(version.payload_file_name()).is_file() {
                committed.insert(stem.to_string());
                versions.push(version);
            } else {
                tracing::warn!(path = %path.display(), "metadata without payload, discarding");
                let _ = std::fs::remove_file(&path);
            }
        } else {
            payloads.push(path);
        }
    }

    for path in payloads {
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or_default();
        if !committed.contains(stem) {
            tracing::warn!(path = %path.display(), "removing orphaned payload");
            let _ = std::fs::remove_file(&path);
        }
    }

    Ok(versions)
}

async fn load(path: &Path, meta: &ArtifactVersion) -> Result<Payload, ArtifactError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(not_found(&meta.reference_name, meta.version_id));
        }
        Err(e) => return Err(io_error(path, e)),
    };
    if !meta.checksum.matches(&bytes) {
        return Err(ArtifactError::Corrupted {
            reference: meta.reference_name.clone(),
            version: meta.version_id,
            expected: meta.checksum,
            actual: Checksum::of(&bytes),
        });
    }
    Ok(Payload::from(bytes))
}

fn not_found(reference: &str, version: VersionId) -> ArtifactError {
    ArtifactError::NotFound {
        reference: reference.to_string(),
        version,
    }
}

fn read_dir(dir: &Path) -> Result<Vec<std::fs::DirEntry>, ArtifactError> {
    std::fs::read_dir(dir)
        .and_then(|entries| entries.collect::<Result<Vec<_>, _>>())
        .map_err(|e| io_error(dir, e))
}

fn clear_dir(dir: &Path) -> Result<(), ArtifactError> {
    for entry in read_dir(dir)? {
        let path = entry.path();
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        }
    }
    Ok(())
}
