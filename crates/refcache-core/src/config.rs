//! Service configuration
//!
//! Loaded from an optional TOML file, then overridden by `REFCACHE_*`
//! environment variables, then validated.

use crate::cadence::Cadence;
use crate::error::ConfigError;
use crate::reference::{interval, parse_interval};
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use refcache_artifact::{CacheConfig, DataRoot};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Console log encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Also write logs to `<data_root>/logs/refcache.log`
    pub file: bool,
    /// Default filter when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            file: true,
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Everything needed to run the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub data_root: PathBuf,
    /// Bundled default references, copied onto the volume on first start
    pub seed_file: Option<PathBuf>,
    pub worker_pool_size: usize,
    pub retain_count: usize,
    pub schedule: Cadence,
    #[serde(with = "interval")]
    pub failed_retry_interval: Duration,
    #[serde(with = "interval")]
    pub fetch_timeout: Duration,
    #[serde(with = "interval")]
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
    /// In-memory payload cache size
    pub hot_cache_bytes: u64,
    /// Linked from operator notifications
    pub dashboard_url: Option<String>,
    pub http: HttpConfig,
    pub log: LogConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            data_root: PathBuf::from("/data"),
            seed_file: Some(PathBuf::from("references.json")),
            worker_pool_size: scheduler.worker_pool_size,
            retain_count: scheduler.retain_count,
            schedule: scheduler.cadence,
            failed_retry_interval: scheduler.failed_retry_interval,
            fetch_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            hot_cache_bytes: CacheConfig::default().hot_capacity_bytes,
            dashboard_url: None,
            http: HttpConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from `path` (defaults when `None`), apply the process
    /// environment, and validate
    ///
    /// # Errors
    /// Returns an error for unreadable or malformed files and invalid values
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `REFCACHE_*` variables looked up through `var`
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for unparsable values
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("REFCACHE_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = var("REFCACHE_SEED_FILE") {
            self.seed_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("REFCACHE_BIND") {
            self.http.bind = v.parse().map_err(|e| invalid("http.bind", format!("{v:?}: {e}")))?;
        }
        if let Some(v) = var("REFCACHE_WORKERS") {
            self.worker_pool_size = v
                .parse()
                .map_err(|e| invalid("worker_pool_size", format!("{v:?}: {e}")))?;
        }
        if let Some(v) = var("REFCACHE_RETAIN") {
            self.retain_count = v
                .parse()
                .map_err(|e| invalid("retain_count", format!("{v:?}: {e}")))?;
        }
        if let Some(v) = var("REFCACHE_SHUTDOWN_GRACE") {
            self.shutdown_grace = parse_interval(&v).map_err(|e| invalid("shutdown_grace", e))?;
        }
        if let Some(v) = var("REFCACHE_DASHBOARD_URL") {
            self.dashboard_url = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = var("REFCACHE_LOG_FORMAT") {
            self.log.format = match v.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                _ => return Err(invalid("log.format", format!("{v:?}: expected text or json"))),
            };
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(invalid("worker_pool_size", "must be at least 1"));
        }
        if self.retain_count == 0 {
            return Err(invalid("retain_count", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter", "must be between 0 and 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        if let Cadence::Hourly { minute, .. } = self.schedule {
            if minute >= 60 {
                return Err(invalid("schedule.minute", format!("{minute} is not a minute of the hour")));
            }
        }
        if self.data_root.as_os_str().is_empty() {
            return Err(invalid("data_root", "must not be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn data_root(&self) -> DataRoot {
        DataRoot::new(&self.data_root)
    }

    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_pool_size: self.worker_pool_size,
            retain_count: self.retain_count,
            cadence: self.schedule,
            failed_retry_interval: self.failed_retry_interval,
        }
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default().with_hot_capacity(self.hot_cache_bytes)
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
data_root = "/srv/refcache"
seed_file = "/app/references.json"
worker_pool_size = 2
retain_count = 5
failed_retry_interval = "10m"
fetch_timeout = 20
shutdown_grace = "15s"
dashboard_url = "http://dashboard:8050"

[schedule]
mode = "hourly"
minute = 2

[retry]
max_attempts = 4
base_delay_ms = 500

[http]
bind = "127.0.0.1:9000"

[log]
format = "json"
"#;

    #[test]
    fn parses_full_file() {
        let config: ServiceConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.data_root, PathBuf::from("/srv/refcache"));
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.schedule, Cadence::hourly(2));
        assert_eq!(config.failed_retry_interval, Duration::from_secs(600));
        assert_eq!(config.fetch_timeout, Duration::from_secs(20));
        assert_eq!(config.retry.max_attempts, 4);
        // unspecified retry fields keep defaults
        assert_eq!(config.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
        assert_eq!(config.http.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.log.format, LogFormat::Json);
        config.validate().unwrap();
    }

    #[test]
    fn shipped_config_is_valid() {
        let config: ServiceConfig = toml::from_str(include_str!("../../../refcache.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.schedule, Cadence::default());
        assert_eq!(config.failed_retry_interval, Duration::from_secs(300));
    }

    #[test]
    fn empty_file_is_default() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ServiceConfig>("wrokers = 3").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REFCACHE_DATA_ROOT", "/tmp/data"),
            ("REFCACHE_WORKERS", "8"),
            ("REFCACHE_BIND", "0.0.0.0:7000"),
            ("REFCACHE_SEED_FILE", ""),
        ]);
        let mut config = ServiceConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.data_root, PathBuf::from("/tmp/data"));
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.http.bind.port(), 7000);
        assert_eq!(config.seed_file, None);
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env(|k| (k == "REFCACHE_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "worker_pool_size", .. }));
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut config = ServiceConfig {
            worker_pool_size: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());

        config.worker_pool_size = 1;
        config.schedule = Cadence::hourly(60);
        assert!(config.validate().is_err());

        config.schedule = Cadence::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refcache.toml");
        std::fs::write(&path, "retain_count = 7\n").unwrap();
        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.retain_count, 7);
        assert!(matches!(
            ServiceConfig::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
