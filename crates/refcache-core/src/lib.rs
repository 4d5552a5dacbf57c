//! refcache core
//!
//! Keeps a set of named external datasets fresh on a persistent volume and
//! serves the last good copy of each:
//! - Tracks references and their refresh status durably
//! - Refreshes them on a cadence or on demand, with bounded concurrency
//! - Retries transient fetch failures with jittered backoff
//! - Publishes new artifact versions atomically and prunes old ones
//! - Serves consistent snapshots while refreshes run
//!
//! # Example
//!
//! ```rust,ignore
//! use refcache_core::{Service, ServiceConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Service::open(ServiceConfig::load(None)?).await?;
//! let scheduler = service.start().await;
//!
//! let snapshot = service.reader().snapshot("weather").await?;
//! println!("{} bytes, version {}", snapshot.payload.len(), snapshot.version.version_id);
//!
//! service.shutdown().await;
//! scheduler.await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod cadence;
pub mod config;
pub mod error;
pub mod fetch;
pub mod health;
pub mod job;
pub mod notify;
pub mod reference;
pub mod retry;
pub mod scheduler;
pub mod seed;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod transition;

pub use cadence::{next_hourly_tick, Cadence, MIN_TICK_DELAY};
pub use config::{HttpConfig, LogConfig, LogFormat, ServiceConfig};
pub use error::{
    ConfigError, Error, ExecuteError, FetchError, Result, SnapshotError, StoreError, TriggerError,
};
pub use fetch::{FetchExecutor, FetchedArtifact, Fetcher, FetcherRegistry, FileFetcher, HttpFetcher};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use job::{JobView, RefreshJob, ShutdownSignal, ShutdownTrigger, Trigger};
pub use notify::{LogNotifier, Notification, Notifier};
pub use reference::{parse_interval, ErrorInfo, ErrorKind, RefStatus, Reference};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{
    InitialLoadReport, Scheduler, SchedulerConfig, ShutdownReport, TickReport, TriggerOutcome,
};
pub use seed::{SeedBundle, SeedEntry};
pub use service::Service;
pub use snapshot::{Snapshot, SnapshotMetadata, SnapshotReader};
pub use store::{ReferenceStore, SeedReport};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with refcache
    pub use crate::{
        FetchExecutor, Fetcher, RefStatus, Reference, ReferenceStore, Scheduler, SeedBundle,
        SeedEntry, Service, ServiceConfig, Snapshot, SnapshotReader, Trigger, TriggerOutcome,
    };
    pub use refcache_artifact::{ArtifactCache, ArtifactKind, DataRoot, VersionId};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
