//! Gateway/control and noVNC/desktop passthrough routes (§4.5, §6). Both
//! resolve a local tunnel port via C2 and hand off to C5 for the actual
//! relay; the difference between the two routes is only which tunnel they
//! resolve against.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::HeaderMap;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::access;
use crate::api::auth::CallerSession;
use crate::error::AppError;
use crate::proxy;
use crate::state::AppState;

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

pub async fn control(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((id, suffix)): Path<(u64, String)>,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Result<Response, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let port = state.tunnels.get_gateway_local_port(id).await;
    relay_to_port(&state, port, &suffix, ws, request).await
}

pub async fn desktop(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((id, _display, suffix)): Path<(u64, String, String)>,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Result<Response, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let port = state.tunnels.get_vnc_local_port(id).await;
    relay_to_port(&state, port, &suffix, ws, request).await
}

async fn relay_to_port(
    state: &Arc<AppState>,
    port: u16,
    suffix: &str,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Result<Response, AppError> {
    let headers = request.headers().clone();

    if let Some(ws) = ws {
        if is_websocket_upgrade(&headers) {
            return proxy::websocket_proxy(ws, port, suffix.to_string(), requested_protocols(&headers)).await;
        }
    }

    let method = request.method().clone();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;

    proxy::http_proxy(state.http_client.clone(), method, port, suffix, &headers, body).await
}
