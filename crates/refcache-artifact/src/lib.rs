//! refcache artifact storage
//!
//! Versioned, checksummed storage for materialized reference data.
//!
//! # Core Concepts
//!
//! - [`ArtifactCache`]: append-only payload store keyed by reference + version
//! - [`ArtifactVersion`]: immutable metadata recorded with every payload
//! - [`VersionId`]: per-reference monotonically increasing version number
//! - [`DataRoot`]: layout of the persistent data volume
//! - [`Checksum`]: Blake3 digest verified on every disk read
//!
//! # Example
//!
//! ```rust,ignore
//! use refcache_artifact::{ArtifactCache, ArtifactKind, CacheConfig, DataRoot};
//!
//! let cache = ArtifactCache::open(DataRoot::new("/data"), CacheConfig::default())?;
//! let version = cache.put("weather", ArtifactKind::Parquet, &bytes).await?;
//! let payload = cache.get("weather", version.version_id).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod cache;
mod checksum;
mod durable;
mod error;
mod layout;
mod version;

pub use cache::{ArtifactCache, CacheConfig, CacheStats, Payload, VersionPointer};
pub use checksum::{Checksum, ChecksumError};
pub use durable::{remove_quietly, write_atomic};
pub use error::ArtifactError;
pub use layout::{validate_reference_name, DataRoot};
pub use version::{ArtifactKind, ArtifactVersion, UnknownKind, VersionId};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
