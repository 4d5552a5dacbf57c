//! Persistent data root layout
//!
//! ```text
//! <root>/
//!   references/   reference store and seed copy
//!   parquet/      columnar artifacts, one directory per reference
//!   models/       model blobs
//!   images/       rendered images
//!   cache/        ephemeral scratch (temp writes land in cache/tmp)
//!   logs/         operational logs
//! ```

use crate::error::{io_error, ArtifactError};
use crate::version::ArtifactKind;
use std::path::{Path, PathBuf};

const MAX_NAME_LEN: usize = 128;

/// Paths under a persistent data root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    #[must_use]
    pub fn references(&self) -> PathBuf {
        self.root.join("references")
    }

    #[inline]
    #[must_use]
    pub fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    #[inline]
    #[must_use]
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    #[inline]
    #[must_use]
    pub fn tmp(&self) -> PathBuf {
        self.cache().join("tmp")
    }

    #[inline]
    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Directory holding every version of one reference's artifacts
    #[must_use]
    pub fn reference_dir(&self, kind: ArtifactKind, reference: &str) -> PathBuf {
        self.kind_dir(kind).join(reference)
    }

    /// Every directory that must exist for the service to run
    #[must_use]
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.references()];
        dirs.extend(ArtifactKind::ALL.iter().map(|k| self.kind_dir(*k)));
        dirs.extend([self.cache(), self.tmp(), self.logs()]);
        dirs
    }

    /// Create the layout. Existing directories are left untouched.
    ///
    /// # Errors
    /// Returns [`ArtifactError::Storage`] if a directory cannot be created
    pub fn ensure(&self) -> Result<(), ArtifactError> {
        for dir in self.required_dirs() {
            std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }
        Ok(())
    }

    /// True when every required directory exists
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.required_dirs().iter().all(|d| d.is_dir())
    }
}

/// Check that a reference name is safe to use as a single path component
///
/// # Errors
/// Returns [`ArtifactError::InvalidName`] describing the first violation
pub fn validate_reference_name(name: &str) -> Result<(), ArtifactError> {
    let invalid = |reason: &str| ArtifactError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 128 bytes"));
    }
    if name.starts_with('.') {
        return Err(invalid("starts with '.'"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    {
        return Err(invalid("only [A-Za-z0-9._-] allowed"));
    }
    Ok(())
}
