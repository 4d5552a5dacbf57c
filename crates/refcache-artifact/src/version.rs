//! Artifact identity
//!
//! - [`ArtifactKind`]: what a payload is (parquet table, model blob, image)
//! - [`VersionId`]: monotonically increasing id, scoped per reference
//! - [`ArtifactVersion`]: immutable metadata written alongside each payload

use crate::checksum::Checksum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Kind of materialized output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Parquet,
    Model,
    Image,
}

impl ArtifactKind {
    /// All kinds, in directory scan order
    pub const ALL: [ArtifactKind; 3] = [Self::Parquet, Self::Model, Self::Image];

    /// Data root subdirectory holding this kind
    #[inline]
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
            Self::Model => "models",
            Self::Image => "images",
        }
    }

    /// File extension for payload files
    #[inline]
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
            Self::Model => "bin",
            Self::Image => "png",
        }
    }

    /// MIME type served for raw payload reads
    #[inline]
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Parquet => "application/vnd.apache.parquet",
            Self::Model => "application/octet-stream",
            Self::Image => "image/png",
        }
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parquet => "parquet",
            Self::Model => "model",
            Self::Image => "image",
        })
    }
}

impl FromStr for ArtifactKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parquet" => Ok(Self::Parquet),
            "model" | "models" => Ok(Self::Model),
            "image" | "images" => Ok(Self::Image),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown artifact kind: {0}")]
pub struct UnknownKind(pub String);

/// Per-reference version number; the first stored version is 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(u64);

impl VersionId {
    pub const FIRST: VersionId = VersionId(1);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Zero-padded stem used for on-disk file names so they sort lexically
    #[inline]
    #[must_use]
    pub fn file_stem(self) -> String {
        format!("{:020}", self.0)
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VersionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches('v').parse().map(Self)
    }
}

/// Immutable record of one stored payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub reference_name: String,
    pub version_id: VersionId,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub checksum: Checksum,
}

impl ArtifactVersion {
    /// Payload file name inside the reference directory
    ///
    /// Derived from id and kind, so metadata stays valid when the data root
    /// is mounted somewhere else.
    #[must_use]
    pub fn payload_file_name(&self) -> String {
        format!("{}.{}", self.version_id.file_stem(), self.kind.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_dirs_match_data_root_layout() {
        let dirs: Vec<_> = ArtifactKind::ALL.iter().map(|k| k.dir_name()).collect();
        assert_eq!(dirs, ["parquet", "models", "images"]);
    }

    #[test]
    fn kind_parses_loosely() {
        assert_eq!("Parquet".parse::<ArtifactKind>().unwrap(), ArtifactKind::Parquet);
        assert_eq!("models".parse::<ArtifactKind>().unwrap(), ArtifactKind::Model);
        assert!("csv".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn kind_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&ArtifactKind::Image).unwrap(), "\"image\"");
    }

    #[test]
    fn version_file_stems_sort_numerically() {
        let a = VersionId::new(9).file_stem();
        let b = VersionId::new(10).file_stem();
        assert!(a < b);
        assert_eq!(b.parse::<VersionId>().unwrap(), VersionId::new(10));
    }

    #[test]
    fn metadata_with_legacy_absolute_path_still_parses() {
        let json = r#"{
            "reference_name": "weather",
            "version_id": 3,
            "kind": "parquet",
            "payload_location": "/old/mount/parquet/weather/00000000000000000003.parquet",
            "created_at": "2026-01-01T00:00:00Z",
            "size": 4,
            "checksum": "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        }"#;
        let version: ArtifactVersion = serde_json::from_str(json).unwrap();
        assert_eq!(version.payload_file_name(), "00000000000000000003.parquet");
    }

    #[test]
    fn version_display_and_parse() {
        let v = VersionId::FIRST.next();
        assert_eq!(v.to_string(), "v2");
        assert_eq!("v2".parse::<VersionId>().unwrap(), v);
    }
}
