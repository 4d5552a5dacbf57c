//! Fetching reference data and materializing it into the artifact cache
//!
//! - [`Fetcher`]: pulls raw bytes for one source type
//! - [`FetcherRegistry`]: maps a descriptor's `type` to its fetcher
//! - [`FetchExecutor`]: runs one refresh with retries and stores the result

mod file;
mod http;

pub use file::FileFetcher;
pub use http::HttpFetcher;

use crate::error::{ExecuteError, FetchError};
use crate::job::{RefreshJob, ShutdownSignal};
use crate::reference::Reference;
use crate::retry::{RetryDecision, RetryPolicy};
use async_trait::async_trait;
use refcache_artifact::{ArtifactCache, ArtifactKind, ArtifactVersion};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Complete payload produced by a fetcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub kind: ArtifactKind,
    pub bytes: Vec<u8>,
}

/// Pulls data for references whose descriptor names this fetcher's type
///
/// Implementations must return the whole payload or an error. Classify
/// failures carefully: only [`FetchError::Transient`] is retried.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Value of `source_descriptor.type` handled by this fetcher
    fn source_type(&self) -> &str;

    async fn fetch(&self, reference: &Reference) -> Result<FetchedArtifact, FetchError>;
}

/// Fetchers keyed by source type
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.fetchers.keys().collect();
        types.sort();
        f.debug_struct("FetcherRegistry").field("types", &types).finish()
    }
}

impl FetcherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `http` and `file` fetchers
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn with_defaults(http_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self::new()
            .with(Arc::new(HttpFetcher::new(http_timeout)?))
            .with(Arc::new(FileFetcher)))
    }

    /// Add a fetcher, replacing any previous one for the same type
    #[must_use]
    pub fn with(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.insert(fetcher.source_type().to_string(), fetcher);
        self
    }

    #[must_use]
    pub fn get(&self, source_type: &str) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(source_type).cloned()
    }
}

/// Runs one refresh: fetch with retries, then store the new version
///
/// Never touches the reference store; recording the outcome is the
/// scheduler's job.
#[derive(Debug)]
pub struct FetchExecutor {
    cache: Arc<ArtifactCache>,
    fetchers: FetcherRegistry,
    retry: RetryPolicy,
}

impl FetchExecutor {
    #[must_use]
    pub fn new(cache: Arc<ArtifactCache>, fetchers: FetcherRegistry, retry: RetryPolicy) -> Self {
        Self {
            cache,
            fetchers,
            retry,
        }
    }

    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    #[inline]
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch `reference` and store the result as a new artifact version
    ///
    /// Backoff sleeps end early when `shutdown` fires; an attempt already in
    /// progress is allowed to finish.
    ///
    /// # Errors
    /// [`ExecuteError::Fetch`] when the fetch gives up,
    /// [`ExecuteError::Storage`] when the payload cannot be stored,
    /// [`ExecuteError::Cancelled`] when shutdown interrupts a backoff.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(reference = %reference.name, job = %job.job_id, trigger = ?job.trigger)
    )]
    pub async fn execute(
        &self,
        reference: &Reference,
        job: &RefreshJob,
        shutdown: &ShutdownSignal,
    ) -> Result<ArtifactVersion, ExecuteError> {
        let Some(fetcher) = self.fetchers.get(reference.source_type()) else {
            return Err(ExecuteError::Fetch {
                error: FetchError::permanent(format!(
                    "no fetcher for source type {:?}",
                    reference.source_type()
                )),
                attempts: 0,
            });
        };
        let mut shutdown = shutdown.clone();

        loop {
            if shutdown.is_triggered() {
                return Err(ExecuteError::Cancelled {
                    attempts: job.attempt_count(),
                });
            }

            let attempt = job.record_attempt();
            let result = fetcher
                .fetch(reference)
                .await
                .and_then(|artifact| validate(reference, artifact));

            let error = match result {
                Ok(artifact) => {
                    let version = self
                        .cache
                        .put(&reference.name, artifact.kind, &artifact.bytes)
                        .await?;
                    tracing::info!(attempt, version = %version.version_id, size = version.size, "refresh stored");
                    return Ok(version);
                }
                Err(error) => error,
            };

            match self.retry.next(attempt, error.kind()) {
                RetryDecision::GiveUp => {
                    tracing::warn!(attempt, error = %error, "fetch gave up");
                    return Err(ExecuteError::Fetch {
                        error,
                        attempts: attempt,
                    });
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(attempt, error = %error, delay = ?delay, "fetch failed, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.wait() => {
                            return Err(ExecuteError::Cancelled { attempts: attempt });
                        }
                    }
                }
            }
        }
    }
}

fn validate(reference: &Reference, artifact: FetchedArtifact) -> Result<FetchedArtifact, FetchError> {
    if artifact.kind != reference.kind {
        return Err(FetchError::permanent(format!(
            "fetched {} but reference declares {}",
            artifact.kind, reference.kind
        )));
    }
    if artifact.bytes.is_empty() {
        return Err(FetchError::permanent("empty payload"));
    }
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ShutdownTrigger, Trigger};
    use crate::reference::ErrorKind;
    use chrono::Utc;
    use parking_lot::Mutex;
    use refcache_artifact::{CacheConfig, DataRoot};
    use serde_json::json;
    use std::collections::VecDeque;

    struct Scripted {
        outcomes: Mutex<VecDeque<Result<FetchedArtifact, FetchError>>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<FetchedArtifact, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl Fetcher for Scripted {
        fn source_type(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self, _reference: &Reference) -> Result<FetchedArtifact, FetchError> {
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::permanent("script exhausted")))
        }
    }

    fn ok(bytes: &[u8]) -> Result<FetchedArtifact, FetchError> {
        Ok(FetchedArtifact {
            kind: ArtifactKind::Parquet,
            bytes: bytes.to_vec(),
        })
    }

    fn reference(source_type: &str) -> Reference {
        Reference::new(
            "weather",
            ArtifactKind::Parquet,
            json!({"type": source_type}),
            Duration::from_secs(3600),
            Utc::now(),
        )
    }

    fn executor(dir: &std::path::Path, fetcher: Arc<dyn Fetcher>, retry: RetryPolicy) -> FetchExecutor {
        let cache = ArtifactCache::open(DataRoot::new(dir), CacheConfig::default()).unwrap();
        FetchExecutor::new(Arc::new(cache), FetcherRegistry::new().with(fetcher), retry)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Scripted::new(vec![
            Err(FetchError::transient("timeout")),
            Err(FetchError::transient("503")),
            ok(b"rows"),
        ]);
        let exec = executor(dir.path(), fetcher, fast_retry());
        let job = RefreshJob::new("weather", Trigger::OnDemand);

        let version = exec
            .execute(&reference("scripted"), &job, &ShutdownSignal::never())
            .await
            .unwrap();
        assert_eq!(job.attempt_count(), 3);
        assert_eq!(&*exec.cache().get("weather", version.version_id).await.unwrap(), b"rows");
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Scripted::new(vec![Err(FetchError::permanent("401")), ok(b"never")]);
        let exec = executor(dir.path(), fetcher, fast_retry());
        let job = RefreshJob::new("weather", Trigger::Timer);

        let err = exec
            .execute(&reference("scripted"), &job, &ShutdownSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.attempts(), 1);
        assert!(exec.cache().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Scripted::new(vec![
            Err(FetchError::transient("a")),
            Err(FetchError::transient("b")),
            Err(FetchError::transient("c")),
        ]);
        let exec = executor(dir.path(), fetcher, fast_retry());
        let job = RefreshJob::new("weather", Trigger::Timer);

        let err = exec
            .execute(&reference("scripted"), &job, &ShutdownSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.attempts(), 3);
        assert!(exec.cache().is_empty());
    }

    #[tokio::test]
    async fn kind_mismatch_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Scripted::new(vec![Ok(FetchedArtifact {
            kind: ArtifactKind::Image,
            bytes: b"png".to_vec(),
        })]);
        let exec = executor(dir.path(), fetcher, fast_retry());
        let job = RefreshJob::new("weather", Trigger::Timer);

        let err = exec
            .execute(&reference("scripted"), &job, &ShutdownSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn unknown_source_type_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), Scripted::new(vec![]), fast_retry());
        let job = RefreshJob::new("weather", Trigger::Timer);

        let err = exec
            .execute(&reference("ftp"), &job, &ShutdownSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.attempts(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Scripted::new(vec![Err(FetchError::transient("timeout")), ok(b"late")]);
        let slow_retry = RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_secs(30), Duration::from_secs(30));
        let exec = executor(dir.path(), fetcher, slow_retry);
        let job = RefreshJob::new("weather", Trigger::Timer);
        let trigger = ShutdownTrigger::new();
        let signal = trigger.subscribe();

        let reference = reference("scripted");
        let run = exec.execute(&reference, &job, &signal);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        };
        let (result, ()) = tokio::join!(run, stop);

        assert!(matches!(result, Err(ExecuteError::Cancelled { attempts: 1 })));
        assert!(exec.cache().is_empty());
    }
}
