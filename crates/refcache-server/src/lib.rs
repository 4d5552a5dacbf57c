//! refcache server
//!
//! Runs a [`refcache_core::Service`] behind an HTTP API:
//! - [`api`]: warp routes for reads, refresh triggers, registration, health
//! - [`client`]: HTTP client for CLI commands against a running service
//! - [`telemetry`]: tracing subscriber with console and file output
//! - [`serve`]: open the service, bind HTTP, run until a shutdown signal

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod api;
pub mod client;
pub mod telemetry;

use anyhow::Context;
use refcache_core::{Service, ServiceConfig};
use std::future::Future;
use std::net::SocketAddr;

pub use api::routes;
pub use client::ApiClient;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the service until `shutdown` resolves
///
/// The HTTP API is bound before the first-start download, so `/health`
/// answers while the initial data is still arriving.
///
/// # Errors
/// Fails if the service cannot be opened or the address cannot be bound
pub async fn serve<F>(config: ServiceConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = config.http.bind;
    let service = Service::open(config).await.context("opening service")?;

    let (stop_http, http_stopped) = tokio::sync::oneshot::channel::<()>();
    let (addr, server) = warp::serve(routes(service.clone()))
        .try_bind_with_graceful_shutdown(bind, async {
            let _ = http_stopped.await;
        })
        .with_context(|| format!("binding {bind}"))?;
    let http = tokio::spawn(server);
    log_listening(addr);

    let starter = {
        let service = service.clone();
        tokio::spawn(async move { service.start().await })
    };

    shutdown.await;
    tracing::info!("shutdown requested");

    let report = service.shutdown().await;
    if !report.abandoned.is_empty() {
        tracing::warn!(abandoned = ?report.abandoned, "refreshes abandoned at shutdown");
    }
    match starter.await {
        Ok(run_loop) => run_loop.await.context("scheduler loop panicked")?,
        Err(e) => return Err(e).context("startup task panicked"),
    }

    let _ = stop_http.send(());
    http.await.context("HTTP server panicked")?;
    tracing::info!("refcache stopped");
    Ok(())
}

fn log_listening(addr: SocketAddr) {
    tracing::info!(%addr, version = VERSION, "HTTP API listening");
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
