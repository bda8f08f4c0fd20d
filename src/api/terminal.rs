//! Terminal WebSocket + session list/close routes (§6). Wire protocol:
//! binary frames are raw PTY bytes; text frames from the client are JSON
//! control messages (input/resize/ping), mirrored by `session_info`/`pong`
//! from the server.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::access;
use crate::api::auth::CallerSession;
use crate::error::{ws_close, AppError};
use crate::state::AppState;

const DEFAULT_SHELL: &str = "/bin/bash -l";

#[derive(Deserialize)]
pub struct AttachQuery {
    session_id: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientControl {
    Input { data: String },
    Resize { cols: u32, rows: u32 },
    Ping,
}

pub async fn attach(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
    Query(query): Query<AttachQuery>,
) -> Result<Response, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;

    let session = match query.session_id {
        Some(sid) => state
            .terminals
            .get_session(sid)
            .await
            .ok_or(crate::terminal::TerminalError::NotFound)?,
        None => state.terminals.create_session(id, DEFAULT_SHELL).await?,
    };

    Ok(ws.on_upgrade(move |socket| run_terminal(socket, session)))
}

async fn run_terminal(mut socket: WebSocket, session: Arc<crate::terminal::TerminalSession>) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let scrollback = match session.attach(out_tx).await {
        Ok(snapshot) => snapshot,
        Err(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: ws_close::CONFLICT,
                    reason: "a writer is already attached".into(),
                })))
                .await;
            return;
        }
    };

    let info = json!({ "type": "session_info", "session_id": session.id.to_string() });
    if socket.send(Message::Text(info.to_string())).await.is_err() {
        session.detach().await;
        return;
    }
    if !scrollback.is_empty() && socket.send(Message::Binary(scrollback)).await.is_err() {
        session.detach().await;
        return;
    }

    loop {
        tokio::select! {
            _ = session.done() => break,
            outbound = out_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        if socket.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        if session.write_input(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientControl>(&text) {
                            Ok(ClientControl::Input { data }) => {
                                let _ = session.write_input(data.into_bytes()).await;
                            }
                            Ok(ClientControl::Resize { cols, rows }) => {
                                let _ = session.resize(cols, rows);
                            }
                            Ok(ClientControl::Ping) => {
                                let pong = json!({ "type": "pong" });
                                if socket.send(Message::Text(pong.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => continue,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    session.detach().await;
}

#[derive(Serialize)]
pub struct SessionDto {
    session_id: Uuid,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<SessionDto>>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    let sessions = state
        .terminals
        .list_sessions(id)
        .await
        .into_iter()
        .map(|session_id| SessionDto { session_id })
        .collect();
    Ok(Json(sessions))
}

pub async fn close_session(
    State(state): State<Arc<AppState>>,
    CallerSession(caller): CallerSession,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((id, sid)): Path<(u64, Uuid)>,
) -> Result<Json<serde_json::Value>, AppError> {
    access::check_access(&state.store, &caller, id, remote.ip()).await?;
    state.terminals.close_session(sid).await;
    Ok(Json(json!({ "closed": sid.to_string() })))
}
