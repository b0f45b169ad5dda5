//! HTTP management API
//!
//! Exposes the registry over HTTP so proxies can be created, inspected and
//! removed at runtime.

pub mod handlers;

use crate::registry::Registry;
use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build the API router around a shared registry
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/healthcheck", get(handlers::health_check))
        .route(
            "/proxies",
            get(handlers::list_proxies).post(handlers::create_proxy),
        )
        .route(
            "/proxies/:port",
            get(handlers::get_proxy).delete(handlers::delete_proxy),
        )
        .with_state(registry)
}

/// Bind `addr` and serve the API until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind management API on {}", addr))?;
    serve_on(listener, registry, shutdown).await
}

/// Serve the API on an already bound listener until `shutdown` fires
pub async fn serve_on(
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Management API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Management API server failed")?;
    info!("Management API stopped");
    Ok(())
}
