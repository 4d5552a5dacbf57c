//! Build-time default references
//!
//! The seed file is a JSON object mapping reference name to
//! `{source_descriptor, refresh_interval, kind}`. A copy kept on the data
//! volume (`references/seed.json`) takes precedence over the bundled file and
//! is never overwritten.

use crate::error::StoreError;
use crate::reference::{interval, Reference};
use chrono::{DateTime, Utc};
use refcache_artifact::{validate_reference_name, write_atomic, ArtifactKind, DataRoot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the seed copy on the data volume
pub const VOLUME_SEED_FILE: &str = "seed.json";

/// One default reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEntry {
    pub source_descriptor: serde_json::Value,
    #[serde(with = "interval")]
    pub refresh_interval: Duration,
    pub kind: ArtifactKind,
}

impl SeedEntry {
    #[must_use]
    pub fn new(kind: ArtifactKind, source_descriptor: serde_json::Value, refresh_interval: Duration) -> Self {
        Self {
            source_descriptor,
            refresh_interval,
            kind,
        }
    }

    /// A never-refreshed [`Reference`] built from this entry
    #[must_use]
    pub fn to_reference(&self, name: &str, now: DateTime<Utc>) -> Reference {
        Reference::new(
            name,
            self.kind,
            self.source_descriptor.clone(),
            self.refresh_interval,
            now,
        )
    }
}

/// Read-only set of default references
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeedBundle {
    entries: BTreeMap<String, SeedEntry>,
}

impl SeedBundle {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an entry, replacing any previous entry of the same name
    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, entry: SeedEntry) -> Self {
        self.entries.insert(name.into(), entry);
        self
    }

    /// Parse seed JSON, validating every reference name
    ///
    /// # Errors
    /// Returns [`StoreError::Seed`] naming `origin` on malformed input
    pub fn parse(json: &[u8], origin: &Path) -> Result<Self, StoreError> {
        let seed_error = |message: String| StoreError::Seed {
            path: origin.to_path_buf(),
            message,
        };
        let bundle: Self = serde_json::from_slice(json).map_err(|e| seed_error(e.to_string()))?;
        for name in bundle.entries.keys() {
            validate_reference_name(name).map_err(|e| seed_error(e.to_string()))?;
        }
        Ok(bundle)
    }

    /// Load a seed file
    ///
    /// # Errors
    /// Returns [`StoreError::Seed`] if the file is unreadable or malformed
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| StoreError::Seed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&bytes, path)
    }

    /// Pick the seed to merge at startup
    ///
    /// The volume copy wins when present. Otherwise the bundled file, if any,
    /// is first copied onto the volume so later edits there persist.
    ///
    /// # Errors
    /// Returns an error if the chosen file is malformed or the copy fails
    pub async fn resolve(bundled: Option<&Path>, root: &DataRoot) -> Result<Self, StoreError> {
        let volume_copy = volume_seed_path(root);
        if tokio::fs::try_exists(&volume_copy).await.unwrap_or(false) {
            tracing::info!(path = %volume_copy.display(), "using seed from data volume");
            return Self::load(&volume_copy).await;
        }

        let Some(bundled) = bundled.filter(|p| p.is_file()) else {
            tracing::warn!("no seed file found; starting without default references");
            return Ok(Self::empty());
        };

        let bytes = tokio::fs::read(bundled).await.map_err(|e| StoreError::Seed {
            path: bundled.to_path_buf(),
            message: e.to_string(),
        })?;
        let bundle = Self::parse(&bytes, bundled)?;
        write_atomic(&root.tmp(), &volume_copy, &bytes).await?;
        tracing::info!(
            from = %bundled.display(),
            to = %volume_copy.display(),
            references = bundle.len(),
            "copied bundled seed onto data volume"
        );
        Ok(bundle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SeedEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SeedEntry> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[must_use]
pub fn volume_seed_path(root: &DataRoot) -> PathBuf {
    root.references().join(VOLUME_SEED_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"{
        "weather": {
            "source_descriptor": {"type": "http", "url": "https://example.test/weather"},
            "refresh_interval": 3600,
            "kind": "parquet"
        },
        "BTCUSDT_1h": {
            "source_descriptor": {"type": "file", "path": "/srv/btc.parquet"},
            "refresh_interval": "1h",
            "kind": "parquet"
        }
    }"#;

    #[test]
    fn parses_seed_json() {
        let bundle = SeedBundle::parse(SEED.as_bytes(), Path::new("seed.json")).unwrap();
        assert_eq!(bundle.len(), 2);
        let weather = bundle.get("weather").unwrap();
        assert_eq!(weather.refresh_interval, Duration::from_secs(3600));
        assert_eq!(weather.kind, ArtifactKind::Parquet);
        assert_eq!(
            bundle.get("BTCUSDT_1h").unwrap().refresh_interval,
            weather.refresh_interval
        );
    }

    #[test]
    fn bundled_seed_parses() {
        let bundle = SeedBundle::parse(include_bytes!("../../../references.json"), Path::new("references.json")).unwrap();
        assert_eq!(bundle.len(), 3);
        let radar = bundle.get("radar").unwrap();
        assert_eq!(radar.kind, ArtifactKind::Image);
        assert_eq!(radar.refresh_interval, Duration::from_secs(900));
    }

    #[test]
    fn rejects_unsafe_names() {
        let json = r#"{"../etc": {"source_descriptor": {}, "refresh_interval": 60, "kind": "image"}}"#;
        let err = SeedBundle::parse(json.as_bytes(), Path::new("seed.json")).unwrap_err();
        assert!(matches!(err, StoreError::Seed { .. }));
    }

    #[test]
    fn rejects_missing_fields() {
        let json = r#"{"weather": {"refresh_interval": 60}}"#;
        assert!(SeedBundle::parse(json.as_bytes(), Path::new("seed.json")).is_err());
    }

    #[tokio::test]
    async fn resolve_copies_bundled_seed_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path().join("data"));
        root.ensure().unwrap();
        let bundled = dir.path().join("references.json");
        std::fs::write(&bundled, SEED).unwrap();

        let first = SeedBundle::resolve(Some(&bundled), &root).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(volume_seed_path(&root).is_file());

        // edits on the volume win over the bundled file
        std::fs::write(volume_seed_path(&root), "{}").unwrap();
        let second = SeedBundle::resolve(Some(&bundled), &root).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn resolve_without_any_seed_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        root.ensure().unwrap();
        let bundle = SeedBundle::resolve(Some(&dir.path().join("nope.json")), &root)
            .await
            .unwrap();
        assert!(bundle.is_empty());
    }
}
