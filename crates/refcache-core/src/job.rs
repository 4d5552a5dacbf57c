//! Refresh jobs and the shutdown signal they observe

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use ulid::Ulid;

/// What started a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Scheduler tick found the reference due
    Timer,
    /// Explicit request through the API or CLI
    OnDemand,
    /// Initial download on a data root without artifacts
    Startup,
    /// Current version was missing from disk when the service opened
    Repair,
}

/// A queued or running refresh of one reference
///
/// Exists only between acceptance of a trigger and the end of the job.
#[derive(Debug)]
pub struct RefreshJob {
    pub job_id: Ulid,
    pub reference_name: String,
    pub triggered_at: DateTime<Utc>,
    pub trigger: Trigger,
    attempt_count: AtomicU32,
}

impl RefreshJob {
    #[must_use]
    pub fn new(reference_name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            job_id: Ulid::new(),
            reference_name: reference_name.into(),
            triggered_at: Utc::now(),
            trigger,
            attempt_count: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::Acquire)
    }

    /// Count a new fetch attempt, returning its 1-based number
    pub fn record_attempt(&self) -> u32 {
        self.attempt_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.job_id.to_string(),
            reference_name: self.reference_name.clone(),
            triggered_at: self.triggered_at,
            trigger: self.trigger,
            attempt_count: self.attempt_count(),
        }
    }
}

/// Serializable snapshot of a [`RefreshJob`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub reference_name: String,
    pub triggered_at: DateTime<Utc>,
    pub trigger: Trigger,
    pub attempt_count: u32,
}

/// Sending half of the shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    #[must_use]
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// A signal that never fires
    #[must_use]
    pub fn never() -> Self {
        Self(watch::channel(false).1)
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // Sender gone without triggering
                std::future::pending::<()>().await;
            }
        }
    }
}
