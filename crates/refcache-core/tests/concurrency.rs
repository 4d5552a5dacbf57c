//! Coalescing, worker bounds, reads racing refreshes, shutdown

use futures::future::join_all;
use refcache_artifact::{ArtifactKind, Checksum, VersionId};
use refcache_core::{RefStatus, SeedBundle, ServiceConfig, Trigger, TriggerError, TriggerOutcome};
use refcache_test_utils::{
    mixed_seed, open_service, refresh_now, seed_entry, temp_root, test_config, wait_idle, weather_seed,
    GatedFetcher, RecordingNotifier, ScriptedFetcher, GATED, SCRIPTED,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn concurrent_triggers_coalesce_into_one_job() {
    let dir = temp_root();
    let fetcher = GatedFetcher::new();
    let service = open_service(test_config(dir.path()), fetcher.clone(), RecordingNotifier::new()).await;
    service.store().seed(&weather_seed(GATED)).await.unwrap();
    let scheduler = Arc::clone(service.scheduler());

    let outcomes = join_all((0..16).map(|_| {
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.trigger("weather", Trigger::OnDemand).await }
    }))
    .await;

    let accepted = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(TriggerOutcome::Accepted { .. })))
        .count();
    let coalesced = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(TriggerOutcome::Coalesced)))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(coalesced, 15);
    assert_eq!(scheduler.in_flight(), 1);

    fetcher.wait_started(1).await;
    fetcher.release(1);
    wait_idle(&service).await;

    assert_eq!(fetcher.started(), 1);
    assert_eq!(service.cache().versions("weather").len(), 1);
}

#[tokio::test]
async fn trigger_while_refreshing_is_coalesced() {
    let dir = temp_root();
    let fetcher = GatedFetcher::new();
    let service = open_service(test_config(dir.path()), fetcher.clone(), RecordingNotifier::new()).await;
    service.store().seed(&weather_seed(GATED)).await.unwrap();
    let scheduler = service.scheduler();

    scheduler.trigger("weather", Trigger::Timer).await.unwrap();
    fetcher.wait_started(1).await;
    assert_eq!(service.store().get("weather").unwrap().status, RefStatus::Refreshing);

    let outcome = scheduler.trigger("weather", Trigger::OnDemand).await.unwrap();
    assert_eq!(outcome, TriggerOutcome::Coalesced);
    assert_eq!(scheduler.jobs().len(), 1);

    fetcher.release(1);
    wait_idle(&service).await;
    assert_eq!(fetcher.started(), 1);
    assert_eq!(service.store().get("weather").unwrap().status, RefStatus::Fresh);
}

#[tokio::test]
async fn worker_pool_bounds_parallel_fetches() {
    let dir = temp_root();
    let fetcher = GatedFetcher::new();
    let config = ServiceConfig {
        worker_pool_size: 2,
        ..test_config(dir.path())
    };
    let service = open_service(config, fetcher.clone(), RecordingNotifier::new()).await;
    service.store().seed(&mixed_seed(GATED)).await.unwrap();

    for name in ["weather", "forecast-model", "radar"] {
        service.scheduler().trigger(name, Trigger::OnDemand).await.unwrap();
    }
    fetcher.wait_started(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fetcher.started(), 2);
    assert_eq!(service.scheduler().in_flight(), 3);

    fetcher.release(3);
    wait_idle(&service).await;
    assert_eq!(fetcher.started(), 3);
    assert_eq!(fetcher.max_running(), 2);
    for reference in service.store().list() {
        assert_eq!(reference.status, RefStatus::Fresh, "{}", reference.name);
    }
}

#[tokio::test]
async fn saturated_pool_runs_waiting_jobs_in_trigger_order() {
    let dir = temp_root();
    let fetcher = GatedFetcher::new();
    let config = ServiceConfig {
        worker_pool_size: 1,
        ..test_config(dir.path())
    };
    let service = open_service(config, fetcher.clone(), RecordingNotifier::new()).await;
    let names = ["blocker", "a", "b", "c", "d", "e"];
    let bundle = names.iter().fold(SeedBundle::empty(), |bundle, name| {
        bundle.with_entry(*name, seed_entry(GATED, ArtifactKind::Image, Duration::from_secs(3600)))
    });
    service.store().seed(&bundle).await.unwrap();

    let scheduler = service.scheduler();
    scheduler.trigger("blocker", Trigger::OnDemand).await.unwrap();
    fetcher.wait_started(1).await;
    for name in &names[1..] {
        scheduler.trigger(name, Trigger::OnDemand).await.unwrap();
        // let the job reach the pool queue before the next trigger
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fetcher.started(), 1);

    fetcher.release(names.len());
    wait_idle(&service).await;
    assert_eq!(fetcher.start_order(), names.map(String::from).to_vec());
    assert_eq!(fetcher.max_running(), 1);
}

#[tokio::test]
async fn reads_during_slow_refresh_see_whole_versions() {
    let dir = temp_root();
    let fetcher = ScriptedFetcher::slow(Duration::from_millis(100));
    let service = open_service(test_config(dir.path()), fetcher, RecordingNotifier::new()).await;
    service.store().seed(&weather_seed(SCRIPTED)).await.unwrap();
    refresh_now(&service, "weather").await;

    service
        .scheduler()
        .trigger("weather", Trigger::OnDemand)
        .await
        .unwrap();

    let readers = (0..4).map(|_| {
        let reader = service.reader().clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let deadline = tokio::time::Instant::now() + Duration::from_millis(250);
            while tokio::time::Instant::now() < deadline {
                let snap = reader.snapshot("weather").await.unwrap();
                assert_eq!(Checksum::of(&snap.payload), snap.version.checksum);
                let expected = format!("weather#{}", snap.version.version_id.get());
                assert_eq!(&*snap.payload, expected.as_bytes());
                seen.push(snap.version.version_id);
                tokio::task::yield_now().await;
            }
            seen
        })
    });

    let mut versions: Vec<VersionId> = Vec::new();
    for handle in readers {
        versions.extend(handle.await.unwrap());
    }
    wait_idle(&service).await;

    assert!(versions.contains(&VersionId::new(1)));
    assert!(versions.iter().all(|v| v.get() <= 2));
    assert_eq!(
        service.store().get("weather").unwrap().current_version,
        Some(VersionId::new(2))
    );
}

#[tokio::test]
async fn shutdown_abandons_jobs_past_grace() {
    let dir = temp_root();
    let fetcher = GatedFetcher::new();
    let config = ServiceConfig {
        shutdown_grace: Duration::from_millis(50),
        ..test_config(dir.path())
    };
    let service = open_service(config, fetcher.clone(), RecordingNotifier::new()).await;
    service.store().seed(&weather_seed(GATED)).await.unwrap();

    service.scheduler().trigger("weather", Trigger::OnDemand).await.unwrap();
    fetcher.wait_started(1).await;

    let report = service.shutdown().await;
    assert_eq!(report.abandoned, vec!["weather".to_string()]);

    let reference = service.store().get("weather").unwrap();
    assert_eq!(reference.status, RefStatus::Stale);
    assert_eq!(reference.current_version, None);
    assert!(service.cache().is_empty());

    let err = service
        .scheduler()
        .trigger("weather", Trigger::OnDemand)
        .await
        .unwrap_err();
    assert_eq!(err, TriggerError::ShuttingDown);
}

#[tokio::test]
async fn shutdown_waits_for_running_fetch_within_grace() {
    let dir = temp_root();
    let fetcher = GatedFetcher::new();
    let config = ServiceConfig {
        worker_pool_size: 1,
        ..test_config(dir.path())
    };
    let service = open_service(config, fetcher.clone(), RecordingNotifier::new()).await;
    service.store().seed(&mixed_seed(GATED)).await.unwrap();

    service.scheduler().trigger("radar", Trigger::OnDemand).await.unwrap();
    fetcher.wait_started(1).await;
    // queued behind the single worker
    service.scheduler().trigger("weather", Trigger::OnDemand).await.unwrap();

    let shutdown = {
        let service = service.clone();
        tokio::spawn(async move { service.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    fetcher.release(1);
    let report = shutdown.await.unwrap();

    assert!(report.abandoned.is_empty());
    assert_eq!(report.completed, 1);
    assert_eq!(report.released, 1);
    assert_eq!(fetcher.started(), 1);
    assert_eq!(service.store().get("radar").unwrap().status, RefStatus::Fresh);

    let queued = service.store().get("weather").unwrap();
    assert_eq!(queued.status, RefStatus::Stale);
    assert_eq!(queued.current_version, None);
}
