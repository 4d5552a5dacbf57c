//! Operator notifications
//!
//! The chat bot subscribes here; its command handling lives outside this
//! crate. The default [`LogNotifier`] writes notifications to the log.

use crate::reference::ErrorInfo;
use async_trait::async_trait;
use refcache_artifact::VersionId;
use serde::Serialize;

/// Events worth telling an operator about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// No artifacts on the data root; downloading everything
    FirstStart { references: usize },
    /// The initial download finished
    InitialLoadComplete { refreshed: usize, failed: usize },
    /// A refresh gave up; the previous artifact is still served
    RefreshFailed { reference: String, error: ErrorInfo },
    /// A previously failed reference refreshed successfully
    Recovered { reference: String, version: VersionId },
}

impl Notification {
    /// Human-readable text, with a dashboard link when one is configured
    #[must_use]
    pub fn message(&self, dashboard_url: Option<&str>) -> String {
        let text = match self {
            Self::FirstStart { references } => {
                format!("First start: no local data, downloading {references} reference(s)")
            }
            Self::InitialLoadComplete { refreshed, failed } => {
                format!("Initial download complete: {refreshed} refreshed, {failed} failed")
            }
            Self::RefreshFailed { reference, error } => format!(
                "Refresh of {reference} failed after {} attempt(s): {}",
                error.attempts, error.message
            ),
            Self::Recovered { reference, version } => {
                format!("{reference} recovered at {version}")
            }
        };
        match dashboard_url {
            Some(url) => format!("{text}\n{url}"),
            None => text,
        }
    }
}

/// Receives [`Notification`]s; delivery failures are the notifier's problem
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the tracing log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    dashboard_url: Option<String>,
}

impl LogNotifier {
    #[must_use]
    pub fn new(dashboard_url: Option<String>) -> Self {
        Self { dashboard_url }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        let message = notification.message(self.dashboard_url.as_deref());
        match notification {
            Notification::RefreshFailed { .. } => tracing::warn!(target: "refcache::notify", "{message}"),
            _ => tracing::info!(target: "refcache::notify", "{message}"),
        }
    }
}
