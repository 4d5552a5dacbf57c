//! Refresh scheduling
//!
//! - Timer ticks and on-demand requests become [`RefreshJob`]s
//! - At most one job per reference: later triggers are coalesced
//! - A fixed number of permits bounds concurrent jobs; waiters queue FIFO
//! - Outcomes are recorded in the [`ReferenceStore`]; failures never move
//!   `current_version`
//! - Shutdown drains jobs for a grace period, then abandons the rest

use crate::cadence::Cadence;
use crate::error::{ExecuteError, StoreError, TriggerError};
use crate::fetch::FetchExecutor;
use crate::job::{JobView, RefreshJob, ShutdownSignal, ShutdownTrigger, Trigger};
use crate::notify::{Notification, Notifier};
use crate::reference::{ErrorInfo, RefStatus};
use crate::store::ReferenceStore;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

/// Scheduler tuning
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum refresh jobs running at once
    pub worker_pool_size: usize,
    /// Artifact versions kept per reference after a successful refresh
    pub retain_count: usize,
    pub cadence: Cadence,
    /// Minimum wait before the timer retries a failed reference
    pub failed_retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            retain_count: 3,
            cadence: Cadence::default(),
            failed_retry_interval: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers;
        self
    }

    #[must_use]
    pub fn with_retain_count(mut self, retain: usize) -> Self {
        self.retain_count = retain;
        self
    }

    #[must_use]
    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    #[must_use]
    pub fn with_failed_retry_interval(mut self, interval: Duration) -> Self {
        self.failed_retry_interval = interval;
        self
    }
}

/// Result of a refresh trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A new job was queued
    Accepted { job_id: String },
    /// A job for this reference is already queued or running
    Coalesced,
}

/// References a tick tried to refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub triggered: Vec<String>,
    pub coalesced: Vec<String>,
}

/// Outcome of the first-start download wave
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InitialLoadReport {
    pub refreshed: usize,
    pub failed: usize,
}

/// What happened to in-flight work at shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Jobs that reached a success or failure outcome during the grace period
    pub completed: usize,
    /// Jobs let go without an outcome: still queued, or cancelled in backoff
    pub released: usize,
    /// References whose jobs were aborted when the grace period ran out
    pub abandoned: Vec<String>,
}

/// Drives periodic and on-demand refreshes
pub struct Scheduler {
    store: Arc<ReferenceStore>,
    executor: Arc<FetchExecutor>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    inflight: DashMap<String, Arc<RefreshJob>>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    job_finished: Notify,
    finished_jobs: AtomicUsize,
    released_jobs: AtomicUsize,
    shutdown: ShutdownTrigger,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("in_flight", &self.inflight.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(
        store: Arc<ReferenceStore>,
        executor: Arc<FetchExecutor>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            notifier,
            permits: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            config,
            inflight: DashMap::new(),
            tasks: Mutex::new(JoinSet::new()),
            job_finished: Notify::new(),
            finished_jobs: AtomicUsize::new(0),
            released_jobs: AtomicUsize::new(0),
            shutdown: ShutdownTrigger::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    /// Signal observed by every job and by [`Self::run`]
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    #[must_use]
    pub fn is_refreshing(&self, name: &str) -> bool {
        self.inflight.contains_key(name)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Jobs queued or running, oldest first
    #[must_use]
    pub fn jobs(&self) -> Vec<JobView> {
        let mut jobs: Vec<JobView> = self.inflight.iter().map(|e| e.value().view()).collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    /// Jobs that have reached a terminal state since start
    #[must_use]
    pub fn finished_jobs(&self) -> usize {
        self.finished_jobs.load(Ordering::Acquire)
    }

    /// Finished jobs that ended without running to an outcome
    #[must_use]
    pub fn released_jobs(&self) -> usize {
        self.released_jobs.load(Ordering::Acquire)
    }

    /// Request a refresh of `name`
    ///
    /// # Errors
    /// [`TriggerError::UnknownReference`] for unknown names,
    /// [`TriggerError::ShuttingDown`] once shutdown has begun
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn trigger(self: &Arc<Self>, name: &str, trigger: Trigger) -> Result<TriggerOutcome, TriggerError> {
        if self.shutdown.is_triggered() {
            return Err(TriggerError::ShuttingDown);
        }
        if !self.store.contains(name) {
            return Err(TriggerError::UnknownReference(name.to_string()));
        }

        let job = match self.inflight.entry(name.to_string()) {
            Entry::Occupied(_) => {
                tracing::debug!(reference = name, "refresh already in flight, coalesced");
                return Ok(TriggerOutcome::Coalesced);
            }
            Entry::Vacant(slot) => {
                let job = Arc::new(RefreshJob::new(name, trigger));
                slot.insert(Arc::clone(&job));
                job
            }
        };

        if let Err(e) = self.store.mark_refreshing(name).await {
            self.inflight.remove(name);
            return match e {
                StoreError::NotFound(_) => Err(TriggerError::UnknownReference(name.to_string())),
                StoreError::IllegalTransition { .. } => Ok(TriggerOutcome::Coalesced),
                other => Err(TriggerError::Store(other.to_string())),
            };
        }

        let job_id = job.job_id.to_string();
        tracing::info!(reference = name, job = %job_id, trigger = ?trigger, "refresh queued");

        let this = Arc::clone(self);
        {
            let mut tasks = self.tasks.lock();
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move { this.run_job(job).await });
        }

        Ok(TriggerOutcome::Accepted { job_id })
    }

    /// Trigger every reference that is due at `now`
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        for reference in self.store.list() {
            if !reference.is_due(now, self.config.failed_retry_interval) {
                continue;
            }
            match self.trigger(&reference.name, Trigger::Timer).await {
                Ok(TriggerOutcome::Accepted { .. }) => report.triggered.push(reference.name.clone()),
                Ok(TriggerOutcome::Coalesced) => report.coalesced.push(reference.name.clone()),
                Err(TriggerError::ShuttingDown) => break,
                Err(e) => tracing::warn!(reference = %reference.name, error = %e, "timer trigger failed"),
            }
        }
        if !report.triggered.is_empty() {
            tracing::info!(triggered = ?report.triggered, "scheduler tick");
        }
        report
    }

    /// First-start download: if no artifact exists yet, refresh every
    /// reference and wait for the wave to finish
    ///
    /// Returns `None` when artifacts already exist, nothing is registered,
    /// or shutdown interrupts the wait.
    pub async fn initial_load(self: &Arc<Self>) -> Option<InitialLoadReport> {
        let names = self.begin_initial_load().await?;
        self.await_initial_load(&names).await
    }

    /// Start the first-start wave without waiting for it
    ///
    /// Returns the references it covers, or `None` if this is not a first
    /// start.
    pub async fn begin_initial_load(self: &Arc<Self>) -> Option<Vec<String>> {
        if !self.executor.cache().is_empty() || self.store.is_empty() {
            return None;
        }

        let names: Vec<String> = self.store.list().iter().map(|r| r.name.clone()).collect();
        self.notifier
            .notify(Notification::FirstStart {
                references: names.len(),
            })
            .await;

        for name in &names {
            if let Err(e) = self.trigger(name, Trigger::Startup).await {
                tracing::warn!(reference = %name, error = %e, "initial download not started");
            }
        }
        Some(names)
    }

    /// Wait until none of `names` is in flight, then report and notify
    pub async fn await_initial_load(&self, names: &[String]) -> Option<InitialLoadReport> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let finished = self.job_finished.notified();
            if !names.iter().any(|n| self.inflight.contains_key(n)) {
                break;
            }
            tokio::select! {
                () = finished => {}
                () = shutdown.wait() => return None,
            }
        }

        let mut report = InitialLoadReport::default();
        for name in names {
            match self.store.get(name).map(|r| r.status) {
                Ok(RefStatus::Fresh) => report.refreshed += 1,
                _ => report.failed += 1,
            }
        }
        self.notifier
            .notify(Notification::InitialLoadComplete {
                refreshed: report.refreshed,
                failed: report.failed,
            })
            .await;
        Some(report)
    }

    /// Tick on the configured cadence until shutdown
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(cadence = ?self.config.cadence, workers = self.config.worker_pool_size, "scheduler started");
        loop {
            self.tick(Utc::now()).await;
            let delay = self.config.cadence.delay_until_next(Utc::now());
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.wait() => break,
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// Stop accepting work, wait up to `grace` for jobs, abandon the rest
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let finished_before = self.finished_jobs();
        let released_before = self.released_jobs();
        self.shutdown.trigger();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(remaining = tasks.len(), "shutdown grace period elapsed, aborting jobs");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let abandoned: Vec<String> = self.inflight.iter().map(|e| e.key().clone()).collect();
        for name in &abandoned {
            self.inflight.remove(name);
            if let Err(e) = self.store.mark_abandoned(name).await {
                tracing::warn!(reference = %name, error = %e, "could not release abandoned reference");
            }
        }

        let released = self.released_jobs() - released_before;
        let report = ShutdownReport {
            completed: self.finished_jobs() - finished_before - released,
            released,
            abandoned,
        };
        tracing::info!(
            completed = report.completed,
            released = report.released,
            abandoned = ?report.abandoned,
            "scheduler shut down"
        );
        report
    }

    async fn run_job(self: Arc<Self>, job: Arc<RefreshJob>) {
        let name = job.reference_name.clone();
        let mut shutdown = self.shutdown.subscribe();

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            () = shutdown.wait() => None,
        };

        let ran = match permit {
            Some(_permit) => self.refresh(&job, &shutdown).await,
            None => {
                self.release(&name).await;
                false
            }
        };

        self.inflight.remove(&name);
        if !ran {
            self.released_jobs.fetch_add(1, Ordering::AcqRel);
        }
        self.finished_jobs.fetch_add(1, Ordering::AcqRel);
        self.job_finished.notify_waiters();
    }

    /// Returns false when shutdown cancelled the job before an outcome
    async fn refresh(&self, job: &RefreshJob, shutdown: &ShutdownSignal) -> bool {
        let name = job.reference_name.as_str();
        let reference = match self.store.get(name) {
            Ok(reference) => reference,
            Err(e) => {
                tracing::warn!(reference = name, error = %e, "reference vanished before refresh");
                return true;
            }
        };
        let was_failing = reference.last_error.is_some();

        let failure = match self.executor.execute(&reference, job, shutdown).await {
            Ok(version) => {
                match self
                    .store
                    .upsert_on_success(name, version.version_id, Utc::now())
                    .await
                {
                    Ok(_) => {
                        if let Err(e) = self
                            .executor
                            .cache()
                            .prune(name, self.config.retain_count)
                            .await
                        {
                            tracing::warn!(reference = name, error = %e, "prune failed");
                        }
                        if was_failing {
                            self.notifier
                                .notify(Notification::Recovered {
                                    reference: name.to_string(),
                                    version: version.version_id,
                                })
                                .await;
                        }
                        return true;
                    }
                    // Version is stored but unreferenced; the next prune drops it
                    Err(e) => ErrorInfo::new(
                        crate::reference::ErrorKind::Storage,
                        format!("could not record new version: {e}"),
                        job.attempt_count(),
                        Utc::now(),
                    ),
                }
            }
            Err(ExecuteError::Cancelled { attempts }) => {
                tracing::info!(reference = name, attempts, "refresh cancelled by shutdown");
                self.release(name).await;
                return false;
            }
            Err(e) => ErrorInfo::new(e.kind(), e.to_string(), e.attempts(), Utc::now()),
        };

        tracing::warn!(reference = name, kind = ?failure.kind, error = %failure.message, "refresh failed");
        if let Err(e) = self.store.mark_failed(name, failure.clone()).await {
            tracing::error!(reference = name, error = %e, "could not record refresh failure");
            return true;
        }
        self.notifier
            .notify(Notification::RefreshFailed {
                reference: name.to_string(),
                error: failure,
            })
            .await;
        true
    }

    async fn release(&self, name: &str) {
        if let Err(e) = self.store.mark_abandoned(name).await {
            tracing::warn!(reference = name, error = %e, "could not release reference");
        }
    }
}
