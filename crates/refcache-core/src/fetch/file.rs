use super::{FetchedArtifact, Fetcher};
use crate::error::FetchError;
use crate::reference::Reference;
use async_trait::async_trait;
use std::io::ErrorKind;

/// Reads `source_descriptor.path` from local disk
///
/// Used for artifacts produced by other components on the same host. A
/// missing file is transient since its producer may not have run yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

#[async_trait]
impl Fetcher for FileFetcher {
    fn source_type(&self) -> &str {
        "file"
    }

    async fn fetch(&self, reference: &Reference) -> Result<FetchedArtifact, FetchError> {
        let path = reference
            .source_descriptor
            .get("path")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| FetchError::permanent("file source needs a \"path\""))?;

        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
                FetchError::permanent(format!("{path}: {e}"))
            }
            _ => FetchError::transient(format!("{path}: {e}")),
        })?;

        Ok(FetchedArtifact {
            kind: reference.kind,
            bytes,
        })
    }
}
