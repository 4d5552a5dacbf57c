//! Testing utilities for refcache workspace
//!
//! Fetchers with controllable behavior, a recording notifier, and fixtures
//! for data roots and seeds.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use refcache_artifact::ArtifactKind;
use refcache_core::{
    FetchError, FetchedArtifact, Fetcher, FetcherRegistry, Notification, Notifier, Reference,
    RetryPolicy, SeedBundle, SeedEntry, Service, ServiceConfig,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Source type served by [`ScriptedFetcher`]
pub const SCRIPTED: &str = "scripted";
/// Source type served by [`GatedFetcher`]
pub const GATED: &str = "gated";

/// Payload a fetcher produces for the `call`-th fetch of `reference`
#[must_use]
pub fn payload_for(reference: &Reference, call: usize) -> FetchedArtifact {
    FetchedArtifact {
        kind: reference.kind,
        bytes: format!("{}#{call}", reference.name).into_bytes(),
    }
}

/// Replays queued outcomes per reference; succeeds once a queue is empty
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<FetchedArtifact, FetchError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every fetch sleeps `delay` before answering
    #[must_use]
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Queue one outcome for the next fetch of `reference`
    pub fn push(&self, reference: &str, outcome: Result<FetchedArtifact, FetchError>) {
        self.scripts
            .lock()
            .entry(reference.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn fail_transient(&self, reference: &str, times: usize) {
        for _ in 0..times {
            self.push(reference, Err(FetchError::transient("upstream timeout")));
        }
    }

    pub fn fail_permanent(&self, reference: &str) {
        self.push(reference, Err(FetchError::permanent("401 unauthorized")));
    }

    #[must_use]
    pub fn calls(&self, reference: &str) -> usize {
        self.calls.lock().get(reference).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn source_type(&self) -> &str {
        SCRIPTED
    }

    async fn fetch(&self, reference: &Reference) -> Result<FetchedArtifact, FetchError> {
        let call = {
            let mut calls = self.calls.lock();
            let n = calls.entry(reference.name.clone()).or_default();
            *n += 1;
            *n
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .get_mut(&reference.name)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(payload_for(reference, call)))
    }
}

/// Holds every fetch until the test opens the gate
pub struct GatedFetcher {
    gate: Semaphore,
    started: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    started_notify: Notify,
    order: Mutex<Vec<String>>,
}

impl GatedFetcher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            started_notify: Notify::new(),
            order: Mutex::new(Vec::new()),
        })
    }

    /// Let `n` held fetches complete
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Wait until at least `n` fetches have started
    pub async fn wait_started(&self, n: usize) {
        loop {
            let notified = self.started_notify.notified();
            if self.started() >= n {
                return;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Reference names in the order their fetches started
    #[must_use]
    pub fn start_order(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    /// Highest number of fetches observed running at once
    #[must_use]
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for GatedFetcher {
    fn source_type(&self) -> &str {
        GATED
    }

    async fn fetch(&self, reference: &Reference) -> Result<FetchedArtifact, FetchError> {
        self.order.lock().push(reference.name.clone());
        let call = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        self.started_notify.notify_waiters();

        let permit = self.gate.acquire().await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        match permit {
            Ok(permit) => {
                permit.forget();
                Ok(payload_for(reference, call))
            }
            Err(_) => Err(FetchError::transient("gate closed")),
        }
    }
}

/// Keeps every notification for later assertions
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    #[must_use]
    pub fn count(&self, pred: impl Fn(&Notification) -> bool) -> usize {
        self.seen.lock().iter().filter(|n| pred(n)).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

pub fn seed_entry(source_type: &str, kind: ArtifactKind, interval: Duration) -> SeedEntry {
    SeedEntry::new(kind, json!({ "type": source_type }), interval)
}

/// One hourly parquet reference named `weather`
pub fn weather_seed(source_type: &str) -> SeedBundle {
    SeedBundle::empty().with_entry(
        "weather",
        seed_entry(source_type, ArtifactKind::Parquet, Duration::from_secs(3600)),
    )
}

/// Parquet, model and image references sharing one source type
pub fn mixed_seed(source_type: &str) -> SeedBundle {
    weather_seed(source_type)
        .with_entry(
            "forecast-model",
            seed_entry(source_type, ArtifactKind::Model, Duration::from_secs(86_400)),
        )
        .with_entry(
            "radar",
            seed_entry(source_type, ArtifactKind::Image, Duration::from_secs(900)),
        )
}

/// Write `bundle` as a seed file at `path`
pub fn write_seed(path: &Path, bundle: &SeedBundle) {
    let json = serde_json::to_vec_pretty(bundle).expect("seed serializes");
    std::fs::write(path, json).expect("seed file written");
}

/// Config rooted at `root` with no bundled seed and millisecond retries
pub fn test_config(root: &Path) -> ServiceConfig {
    ServiceConfig {
        data_root: root.to_path_buf(),
        seed_file: None,
        retry: fast_retry(),
        shutdown_grace: Duration::from_secs(5),
        ..ServiceConfig::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(3)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

/// Open a service whose only fetcher is `fetcher`
pub async fn open_service(config: ServiceConfig, fetcher: Arc<dyn Fetcher>, notifier: Arc<dyn Notifier>) -> Service {
    Service::open_with(config, FetcherRegistry::new().with(fetcher), notifier)
        .await
        .expect("service opens")
}

/// Open a service over `dir` with `bundle` seeded from a bundled file
pub async fn open_seeded(
    dir: &Path,
    bundle: &SeedBundle,
    fetcher: Arc<dyn Fetcher>,
    notifier: Arc<dyn Notifier>,
) -> Service {
    let seed = dir.join("bundled-references.json");
    write_seed(&seed, bundle);
    let config = ServiceConfig {
        seed_file: Some(seed),
        ..test_config(&dir.join("data"))
    };
    open_service(config, fetcher, notifier).await
}

/// Temporary directory removed on drop
pub fn temp_root() -> tempfile::TempDir {
    tempfile::tempdir().expect("temp dir")
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Wait for every queued or running refresh to finish
pub async fn wait_idle(service: &Service) {
    let scheduler = service.scheduler();
    assert!(
        eventually(Duration::from_secs(10), || scheduler.in_flight() == 0).await,
        "refreshes still in flight: {:?}",
        scheduler.jobs()
    );
}

/// Trigger an on-demand refresh of `name` and wait for it to finish
pub async fn refresh_now(service: &Service, name: &str) -> refcache_core::TriggerOutcome {
    let outcome = service
        .scheduler()
        .trigger(name, refcache_core::Trigger::OnDemand)
        .await
        .expect("trigger accepted");
    wait_idle(service).await;
    outcome
}
