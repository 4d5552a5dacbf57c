//! Assembled refcache service
//!
//! Opening a service brings the data volume into a usable state before any
//! work is scheduled:
//! - data root directories exist
//! - reference store loaded, seed merged in
//! - artifact cache indexed, dangling pointers repaired
//! - executor and scheduler built over the shared store and cache

use crate::config::ServiceConfig;
use crate::error::{ConfigError, Result};
use crate::fetch::{FetchExecutor, FetcherRegistry};
use crate::health::{check_cache, check_store, HealthCheck, HealthReport};
use crate::job::Trigger;
use crate::notify::{LogNotifier, Notifier};
use crate::scheduler::{Scheduler, ShutdownReport};
use crate::seed::SeedBundle;
use crate::snapshot::SnapshotReader;
use crate::store::ReferenceStore;
use refcache_artifact::{ArtifactCache, VersionPointer};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Store, cache, scheduler and reader sharing one data root
#[derive(Debug, Clone)]
pub struct Service {
    config: Arc<ServiceConfig>,
    store: Arc<ReferenceStore>,
    cache: Arc<ArtifactCache>,
    scheduler: Arc<Scheduler>,
    reader: SnapshotReader,
    /// References whose pointer was repaired on open
    repaired: Arc<[String]>,
}

impl Service {
    /// Open with the built-in fetchers and a log-only notifier
    ///
    /// # Errors
    /// Returns an error for invalid configuration or an unusable data root
    pub async fn open(config: ServiceConfig) -> Result<Self> {
        let fetchers = FetcherRegistry::with_defaults(config.fetch_timeout).map_err(|e| ConfigError::Invalid {
            field: "fetch_timeout",
            message: e.to_string(),
        })?;
        let notifier = Arc::new(LogNotifier::new(config.dashboard_url.clone()));
        Self::open_with(config, fetchers, notifier).await
    }

    /// Open with caller-supplied fetchers and notifier
    ///
    /// # Errors
    /// Returns an error for invalid configuration or an unusable data root
    #[tracing::instrument(level = "info", skip_all, fields(data_root = %config.data_root.display()))]
    pub async fn open_with(
        config: ServiceConfig,
        fetchers: FetcherRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let root = config.data_root();
        root.ensure()?;

        let store = Arc::new(ReferenceStore::open(root.clone()).await?);
        let bundle = SeedBundle::resolve(config.seed_file.as_deref(), &root).await?;
        store.seed(&bundle).await?;

        let cache = Arc::new(ArtifactCache::open(root, config.cache_config())?);
        cache.set_pointer(Arc::clone(&store) as Arc<dyn VersionPointer>);
        let repaired = store.reconcile(&cache).await?;
        if !repaired.is_empty() {
            tracing::warn!(?repaired, "repaired references pointing at missing artifacts");
        }

        let executor = Arc::new(FetchExecutor::new(Arc::clone(&cache), fetchers, config.retry));
        let scheduler = Scheduler::new(Arc::clone(&store), executor, notifier, config.scheduler_config());
        let reader = SnapshotReader::new(Arc::clone(&store), Arc::clone(&cache));

        tracing::info!(references = store.len(), versions = cache.stats().versions, "service opened");
        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            scheduler,
            reader,
            repaired: repaired.into(),
        })
    }

    /// Run the first-start download if needed, then hand the scheduler loop
    /// to a background task
    ///
    /// Returns once the first-start wave has finished. The timer loop is
    /// already running by then, so overdue references are not held up.
    /// Without a first-start wave, references repaired on open are
    /// refreshed right away.
    pub async fn start(&self) -> JoinHandle<()> {
        let wave = self.scheduler.begin_initial_load().await;
        let handle = tokio::spawn(Arc::clone(&self.scheduler).run());
        match wave {
            Some(names) => {
                if let Some(report) = self.scheduler.await_initial_load(&names).await {
                    tracing::info!(refreshed = report.refreshed, failed = report.failed, "initial download finished");
                }
            }
            None => {
                for name in self.repaired.iter() {
                    if let Err(e) = self.scheduler.trigger(name, Trigger::Repair).await {
                        tracing::warn!(reference = %name, error = %e, "could not refresh repaired reference");
                    }
                }
            }
        }
        handle
    }

    /// Component health, worst status wins
    pub async fn health(&self) -> HealthReport {
        let scheduler = if self.scheduler.shutdown_signal().is_triggered() {
            HealthCheck::unhealthy("scheduler", "shutting down")
        } else {
            HealthCheck::healthy("scheduler").with_metadata("in_flight", self.scheduler.in_flight().into())
        };
        HealthReport::from_checks(vec![
            check_store(&self.store).await,
            check_cache(&self.cache).await,
            scheduler,
        ])
    }

    /// Stop the scheduler, waiting `shutdown_grace` for running jobs
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.scheduler.shutdown(self.config.shutdown_grace).await;
        tracing::info!(completed = report.completed, released = report.released, abandoned = report.abandoned.len(), "service stopped");
        report
    }

    /// Names whose current version was missing from disk on open
    #[inline]
    #[must_use]
    pub fn repaired(&self) -> &[String] {
        &self.repaired
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    #[must_use]
    pub fn reader(&self) -> &SnapshotReader {
        &self.reader
    }
}
