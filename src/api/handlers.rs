//! Request handlers for the management API

use crate::config::ProxyConfig;
use crate::error::UdpxError;
use crate::registry::Registry;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use tracing::{debug, warn};

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn error_response(err: UdpxError) -> (StatusCode, String) {
    match err {
        UdpxError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        UdpxError::AlreadyBound(port) => (
            StatusCode::CONFLICT,
            format!("some proxy might already be listening on port {}", port),
        ),
        UdpxError::NotFound(_) => (StatusCode::NOT_FOUND, "proxy not found".to_string()),
        other => (StatusCode::BAD_GATEWAY, other.to_string()),
    }
}

/// Path segments that are not a port name no proxy
fn parse_port(raw: &str) -> ApiResult<u16> {
    raw.parse()
        .map_err(|_| (StatusCode::NOT_FOUND, "proxy not found".to_string()))
}

/// Liveness check
pub async fn health_check() -> &'static str {
    "WORKING"
}

/// Validate, register and start a proxy
pub async fn create_proxy(
    State(registry): State<Arc<Registry>>,
    Json(config): Json<ProxyConfig>,
) -> ApiResult<(StatusCode, Json<ProxyConfig>)> {
    config
        .validate()
        .map_err(|msg| error_response(UdpxError::Validation(msg)))?;

    match registry.register(config).await {
        Ok(stored) => Ok((StatusCode::CREATED, Json(stored))),
        Err(e) => {
            warn!("Create proxy failed: {}", e);
            Err(error_response(e))
        }
    }
}

/// Every registered proxy, ordered by bind port
pub async fn list_proxies(State(registry): State<Arc<Registry>>) -> Json<Vec<ProxyConfig>> {
    Json(registry.list_configs().await)
}

/// Stored configuration of one proxy
pub async fn get_proxy(
    State(registry): State<Arc<Registry>>,
    Path(bind_port): Path<String>,
) -> ApiResult<Json<ProxyConfig>> {
    let bind_port = parse_port(&bind_port)?;
    registry
        .get_config(bind_port)
        .await
        .map(Json)
        .ok_or_else(|| error_response(UdpxError::NotFound(bind_port)))
}

/// Stop and remove one proxy
pub async fn delete_proxy(
    State(registry): State<Arc<Registry>>,
    Path(bind_port): Path<String>,
) -> ApiResult<&'static str> {
    let bind_port = parse_port(&bind_port)?;
    registry
        .unregister(bind_port)
        .await
        .map_err(error_response)?;
    debug!("Deleted proxy on port {} via API", bind_port);
    Ok("OK")
}
