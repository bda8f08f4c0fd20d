//! File browse/read/download/create/mkdir/upload routes (§6). All file
//! operations run as shell commands over the pooled SSH client (C1) inside
//! the agent container; there is no separate SFTP subsystem in scope.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Multipart, Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::access;
use crate::api::auth::CallerSession;
use crate::error::AppError;
use crate::ssh::client;
use crate::state::AppState;

const EXEC_TIMEOUT: Duration = Duration::from_secs(20);

/// Wraps `s` in single quotes, escaping embedded quotes, so it is safe to
/// splice into a shell command as one argument.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Deserialize)]
pub struct PathQuery {
    path: String,
}

#[derive(Serialize)]
pub struct DirEntryDto {
    name: String,
    is_dir: bool,
    size: u64,
}

async fn get_handle(
    state: &Arc<AppState>,
    instance_id: u64,
) -> Result<Arc<russh::client::Handle<crate::ssh::ClientHandler>>, AppError> {
    Ok(state.pool.get_client(instance_id).await?)
}

pub async fn browse(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<DirEntryDto>>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let handle = get_handle(&state, id).await?;

    // `f` = type (d/-/...), `s` = size in bytes, name last, tab-separated.
    let cmd = format!(
        "find {} -mindepth 1 -maxdepth 1 -printf '%y\\t%s\\t%f\\n'",
        shell_quote(&query.path)
    );
    let out = client::exec(&handle, &cmd, EXEC_TIMEOUT)
        .await
        .map_err(crate::ssh::SshError::from)?;

    let listing = String::from_utf8_lossy(&out);
    let entries = listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let kind = parts.next()?;
            let size: u64 = parts.next()?.parse().ok()?;
            let name = parts.next()?.to_string();
            Some(DirEntryDto {
                name,
                is_dir: kind == "d",
                size,
            })
        })
        .collect();

    Ok(Json(entries))
}

#[derive(Serialize)]
pub struct FileContentDto {
    path: String,
    content: String,
}

pub async fn read_file(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Query(query): Query<PathQuery>,
) -> Result<Json<FileContentDto>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let handle = get_handle(&state, id).await?;

    let cmd = format!("cat {}", shell_quote(&query.path));
    let out = client::exec(&handle, &cmd, EXEC_TIMEOUT)
        .await
        .map_err(crate::ssh::SshError::from)?;

    Ok(Json(FileContentDto {
        path: query.path,
        content: String::from_utf8_lossy(&out).into_owned(),
    }))
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let handle = get_handle(&state, id).await?;

    let cmd = format!("cat {}", shell_quote(&query.path));
    let out = client::exec(&handle, &cmd, EXEC_TIMEOUT)
        .await
        .map_err(crate::ssh::SshError::from)?;

    Ok(([("content-type", "application/octet-stream")], out).into_response())
}

#[derive(Deserialize)]
pub struct CreateFileRequest {
    path: String,
    content: String,
}

pub async fn create_file(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Json(body): Json<CreateFileRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let handle = get_handle(&state, id).await?;

    let encoded = BASE64.encode(body.content.as_bytes());
    let cmd = format!(
        "echo {} | base64 -d > {}",
        shell_quote(&encoded),
        shell_quote(&body.path)
    );
    client::exec(&handle, &cmd, EXEC_TIMEOUT)
        .await
        .map_err(crate::ssh::SshError::from)?;

    Ok(Json(serde_json::json!({ "path": body.path })))
}

#[derive(Deserialize)]
pub struct MkdirRequest {
    path: String,
}

pub async fn mkdir(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Json(body): Json<MkdirRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let handle = get_handle(&state, id).await?;

    let cmd = format!("mkdir -p {}", shell_quote(&body.path));
    client::exec(&handle, &cmd, EXEC_TIMEOUT)
        .await
        .map_err(crate::ssh::SshError::from)?;

    Ok(Json(serde_json::json!({ "path": body.path })))
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Query(query): Query<PathQuery>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let handle = get_handle(&state, id).await?;

    let mut bytes: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?
    {
        if field.name() == Some("file") {
            bytes = Some(field.bytes().await.map_err(|e| AppError::Validation(e.to_string()))?);
            break;
        }
    }
    let bytes = bytes.ok_or_else(|| AppError::Validation("missing 'file' field".into()))?;

    let encoded = BASE64.encode(&bytes);
    let cmd = format!(
        "echo {} | base64 -d > {}",
        shell_quote(&encoded),
        shell_quote(&query.path)
    );
    client::exec(&handle, &cmd, EXEC_TIMEOUT)
        .await
        .map_err(crate::ssh::SshError::from)?;

    Ok(Json(serde_json::json!({ "path": query.path, "bytes": bytes.len() })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
        assert_eq!(shell_quote("/tmp/plain"), "'/tmp/plain'");
    }
}
