//! First start, seeding and restart behavior

use refcache_core::{Notification, RefStatus, SeedBundle};
use refcache_test_utils::{
    mixed_seed, open_seeded, seed_entry, temp_root, weather_seed, write_seed, RecordingNotifier,
    ScriptedFetcher, SCRIPTED,
};
use std::time::Duration;

#[tokio::test]
async fn first_start_downloads_everything() {
    let dir = temp_root();
    let fetcher = ScriptedFetcher::new();
    let notifier = RecordingNotifier::new();
    let service = open_seeded(dir.path(), &mixed_seed(SCRIPTED), fetcher.clone(), notifier.clone()).await;

    let run = service.start().await;

    for reference in service.store().list() {
        assert_eq!(reference.status, RefStatus::Fresh, "{}", reference.name);
        assert_eq!(fetcher.calls(&reference.name), 1);
    }
    let seen = notifier.notifications();
    assert_eq!(seen.first(), Some(&Notification::FirstStart { references: 3 }));
    assert!(seen.contains(&Notification::InitialLoadComplete {
        refreshed: 3,
        failed: 0
    }));

    service.shutdown().await;
    run.await.unwrap();
}

#[tokio::test]
async fn first_start_reports_failures() {
    let dir = temp_root();
    let fetcher = ScriptedFetcher::new();
    fetcher.fail_permanent("radar");
    let notifier = RecordingNotifier::new();
    let service = open_seeded(dir.path(), &mixed_seed(SCRIPTED), fetcher, notifier.clone()).await;

    let run = service.start().await;

    assert_eq!(service.store().get("radar").unwrap().status, RefStatus::Failed);
    assert!(notifier.notifications().contains(&Notification::InitialLoadComplete {
        refreshed: 2,
        failed: 1
    }));

    service.shutdown().await;
    run.await.unwrap();
}

#[tokio::test]
async fn restart_with_data_skips_initial_download() {
    let dir = temp_root();
    {
        let service = open_seeded(
            dir.path(),
            &weather_seed(SCRIPTED),
            ScriptedFetcher::new(),
            RecordingNotifier::new(),
        )
        .await;
        let run = service.start().await;
        service.shutdown().await;
        run.await.unwrap();
    }

    let fetcher = ScriptedFetcher::new();
    let notifier = RecordingNotifier::new();
    let service = open_seeded(dir.path(), &weather_seed(SCRIPTED), fetcher.clone(), notifier.clone()).await;
    let run = service.start().await;
    service.shutdown().await;
    run.await.unwrap();

    assert_eq!(
        notifier.count(|n| matches!(n, Notification::FirstStart { .. })),
        0
    );
    // fresh within its hourly interval, so the first tick leaves it alone
    assert_eq!(fetcher.calls("weather"), 0);
}

#[tokio::test]
async fn seeding_twice_changes_nothing() {
    let dir = temp_root();
    let service = open_seeded(
        dir.path(),
        &weather_seed(SCRIPTED),
        ScriptedFetcher::new(),
        RecordingNotifier::new(),
    )
    .await;
    let before = service.store().list();

    let report = service.store().seed(&weather_seed(SCRIPTED)).await.unwrap();
    assert!(report.inserted.is_empty());
    assert_eq!(report.skipped, 1);
    assert_eq!(service.store().list(), before);
}

#[tokio::test]
async fn volume_seed_wins_over_bundled_seed() {
    let dir = temp_root();
    drop(
        open_seeded(
            dir.path(),
            &weather_seed(SCRIPTED),
            ScriptedFetcher::new(),
            RecordingNotifier::new(),
        )
        .await,
    );

    // operator edits the volume copy
    let volume_seed = dir.path().join("data").join("references").join("seed.json");
    let edited = SeedBundle::load(&volume_seed).await.unwrap().with_entry(
        "radar",
        seed_entry(SCRIPTED, refcache_artifact::ArtifactKind::Image, Duration::from_secs(900)),
    );
    write_seed(&volume_seed, &edited);

    // a newer image ships a different bundled seed
    let service = open_seeded(
        dir.path(),
        &mixed_seed(SCRIPTED),
        ScriptedFetcher::new(),
        RecordingNotifier::new(),
    )
    .await;

    let names: Vec<String> = service.store().list().iter().map(|r| r.name.clone()).collect();
    assert_eq!(names, vec!["radar".to_string(), "weather".to_string()]);
}
