//! Creation/runtime log routes and the SSH allow-list + key rotation routes
//! (§6). Handler shape follows the teacher's `Path`/`State`/`Json` extractor
//! style in `api/servers.rs`.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::access;
use crate::api::auth::CallerSession;
use crate::error::AppError;
use crate::keys::InstanceTarget;
use crate::models::LogType;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_type")]
    log_type: String,
    #[serde(default = "default_tail")]
    tail: usize,
    #[serde(default)]
    follow: bool,
}

fn default_log_type() -> String {
    "openclaw".into()
}
fn default_tail() -> usize {
    200
}

pub async fn creation_logs(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> Result<Response, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let instance = state
        .store
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))?;

    Ok(crate::streaming::stream_creation_logs(state.orchestrator.clone(), instance.name, instance.status).await)
}

pub async fn runtime_logs(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let instance = state
        .store
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))?;

    let log_type: LogType = query
        .log_type
        .parse()
        .map_err(|_| AppError::Validation(format!("unknown log type '{}'", query.log_type)))?;

    let configured = match log_type {
        LogType::Openclaw => instance.log_paths.openclaw.clone(),
        LogType::Browser => instance.log_paths.browser.clone(),
        LogType::System => instance.log_paths.system.clone(),
    };
    let log_path = configured
        .ok_or_else(|| AppError::Validation(format!("no {log_type:?} log path configured")))?;

    crate::streaming::stream_instance_logs(
        state.pool.clone(),
        id,
        log_path,
        log_type,
        query.tail,
        query.follow,
        state.cancel.child_token(),
    )
    .await
}

#[derive(Serialize)]
pub struct AllowedIpsResponse {
    allowed_source_ips: Vec<String>,
}

pub async fn get_allowed_ips(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> Result<Json<AllowedIpsResponse>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let instance = state
        .store
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))?;
    Ok(Json(AllowedIpsResponse {
        allowed_source_ips: instance.allowed_source_ips,
    }))
}

#[derive(Deserialize)]
pub struct SetAllowedIpsRequest {
    allowed_source_ips: Vec<String>,
}

pub async fn set_allowed_ips(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Json(body): Json<SetAllowedIpsRequest>,
) -> Result<Json<AllowedIpsResponse>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;

    crate::ssh::allowlist::parse_allowed_ips(&body.allowed_source_ips.join(","))
        .map_err(AppError::Validation)?;

    if !state.store.set_allowed_ips(id, body.allowed_source_ips.clone()).await {
        return Err(AppError::NotFound(format!("instance {id} not found")));
    }

    Ok(Json(AllowedIpsResponse {
        allowed_source_ips: body.allowed_source_ips,
    }))
}

#[derive(Serialize)]
pub struct RotateKeyResponse {
    full_success: bool,
    new_fingerprint: String,
    outcomes: Vec<RotateOutcomeDto>,
}

#[derive(Serialize)]
pub struct RotateOutcomeDto {
    instance_id: u64,
    success: bool,
    message: String,
}

pub async fn rotate_ssh_key(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> Result<Json<RotateKeyResponse>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let instance = state
        .store
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))?;

    let target = InstanceTarget {
        instance_id: instance.id,
        instance_name: instance.name,
        host: instance.ssh_host,
        port: instance.ssh_port,
        username: instance.ssh_username,
    };

    let result = state
        .key_manager
        .rotate_global_keypair(
            &[target],
            state.orchestrator.as_ref(),
            &state.pool,
            state.trust_store.clone(),
        )
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

    Ok(Json(RotateKeyResponse {
        full_success: result.full_success,
        new_fingerprint: result.new_fingerprint,
        outcomes: result
            .outcomes
            .into_iter()
            .map(|o| RotateOutcomeDto {
                instance_id: o.instance_id,
                success: o.success,
                message: o.message,
            })
            .collect(),
    }))
}
