//! Logging setup
//!
//! Console output in text or JSON, plus JSON lines appended to
//! `<data_root>/logs/refcache.log`. `RUST_LOG` overrides the configured
//! filter.

use anyhow::Context;
use refcache_artifact::DataRoot;
use refcache_core::{LogConfig, LogFormat};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log file name under the data root's `logs/`
pub const LOG_FILE: &str = "refcache.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber
///
/// Returns the log file path when file logging is enabled.
///
/// # Errors
/// Fails if the log file cannot be opened or a subscriber is already set
pub fn init(config: &LogConfig, root: &DataRoot) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .with_context(|| format!("invalid log filter {:?}", config.filter))?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.format)];

    let log_path = if config.file {
        let path = root.logs().join(LOG_FILE);
        std::fs::create_dir_all(root.logs())
            .with_context(|| format!("creating {}", root.logs().display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
        Some(path)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(log_path)
}

/// Console-only logging for short CLI commands
pub fn init_cli() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .boxed(),
    }
}
