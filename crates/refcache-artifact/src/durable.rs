//! Crash-safe file writes
//!
//! Bytes land in a scratch file under the data root's `cache/tmp`, are
//! `fsync`ed, and only then renamed over the destination. A reader either
//! sees the previous file or the complete new one.

use crate::error::{io_error, ArtifactError};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

/// Durably replace `dest` with `bytes`
///
/// `tmp_dir` must live on the same filesystem as `dest` so the final rename
/// is atomic.
///
/// # Errors
/// Returns [`ArtifactError::Storage`] on any I/O failure. The scratch file is
/// removed before returning an error.
pub async fn write_atomic(tmp_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let file_name = dest
        .file_name()
        .map_or_else(|| "payload".into(), |n| n.to_string_lossy().into_owned());
    let tmp = tmp_dir.join(format!("{file_name}.{}.part", Ulid::new()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        file.write_all(bytes).await.map_err(|e| io_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| io_error(dest, e))
    }
    .await;

    if result.is_err() {
        remove_quietly(&tmp).await;
        return result;
    }

    if let Some(parent) = dest.parent() {
        sync_dir(parent).await;
    }
    Ok(())
}

/// Remove a file, ignoring "not found" and logging anything else
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

// Persists the rename itself. Not every platform can open a directory for
// syncing, so failures are ignored.
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let dest = dir.path().join("references.json");

        write_atomic(&tmp, &dest, b"first").await.unwrap();
        write_atomic(&tmp, &dest, b"second").await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(&tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn write_atomic_cleans_up_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let dest = dir.path().join("missing-dir").join("file");

        let err = write_atomic(&tmp, &dest, b"x").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Storage { .. }));
        assert_eq!(std::fs::read_dir(&tmp).unwrap().count(), 0);
    }
}
