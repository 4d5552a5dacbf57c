//! Health reporting
//!
//! The service is healthy only when the reference store can be persisted and
//! the artifact layout is in place.

use crate::store::ReferenceStore;
use refcache_artifact::ArtifactCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health status for a component or the whole service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but something needs attention (e.g. failed references)
    Degraded,
    Unhealthy,
}

/// Result of checking one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            ..Self::healthy(component)
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            ..Self::healthy(component)
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Aggregate of all component checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Worst status wins
    #[must_use]
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, |acc, s| match (acc, s) {
                (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
                (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
                _ => HealthStatus::Healthy,
            });
        Self {
            status,
            version: crate::VERSION.to_string(),
            checks,
        }
    }

    /// Able to serve reads and accept refreshes
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

/// Check the reference store: loaded and its directory writable
pub async fn check_store(store: &ReferenceStore) -> HealthCheck {
    let writable = match store.path().parent() {
        Some(dir) => tokio::fs::metadata(dir)
            .await
            .is_ok_and(|m| m.is_dir() && !m.permissions().readonly()),
        None => false,
    };

    if !writable {
        return HealthCheck::unhealthy("reference_store", "store directory missing or read-only");
    }

    let references = store.list();
    let failed = references
        .iter()
        .filter(|r| r.status == crate::reference::RefStatus::Failed)
        .count();
    let check = if failed > 0 {
        HealthCheck::degraded("reference_store", format!("{failed} reference(s) failed their last refresh"))
    } else {
        HealthCheck::healthy("reference_store")
    };
    check
        .with_metadata("references", references.len().into())
        .with_metadata("failed", failed.into())
}

/// Check the artifact cache: layout initialized
pub async fn check_cache(cache: &ArtifactCache) -> HealthCheck {
    if !cache.is_ready().await {
        return HealthCheck::unhealthy("artifact_cache", "data root layout is incomplete");
    }
    let stats = cache.stats();
    HealthCheck::healthy("artifact_cache")
        .with_metadata("versions", stats.versions.into())
        .with_metadata("stored_bytes", stats.stored_bytes.into())
}
