//! C5: HTTP/WebSocket proxy. Resolves a tunnel's local port via C2 and
//! relays operator requests into the agent container. Grounded on the
//! teacher's axum handler conventions for the HTTP side; the WebSocket
//! relay pump mirrors the bidirectional-task shape used in `tunnel.rs`
//! (itself grounded on oxideterm's `forwarding/local.rs`).

use axum::body::Bytes;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ws_close, AppError};

/// Header allow-list forwarded in both directions (§6).
const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "content-type",
    "content-length",
    "range",
    "if-none-match",
    "if-modified-since",
    "cache-control",
    "etag",
    "last-modified",
    "content-encoding",
];

const WS_READ_LIMIT: usize = 4 * 1024 * 1024;

fn filtered_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in ALLOWED_HEADERS {
        if let Some(value) = src.get(*name) {
            if let Ok(header_name) = HeaderName::try_from(*name) {
                out.insert(header_name, value.clone());
            }
        }
    }
    out
}

/// `HTTPProxy(request, target_local_port, path_suffix)` (§4.5). 502s with an
/// identifiable message if no live tunnel exists at `target_local_port`.
pub async fn http_proxy(
    client: Arc<reqwest::Client>,
    method: Method,
    target_local_port: u16,
    path_suffix: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if target_local_port == 0 {
        return Err(AppError::Unavailable(
            "no live tunnel for this instance/service".into(),
        ));
    }

    let url = format!("http://127.0.0.1:{target_local_port}/{path_suffix}");
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let mut builder = client.request(reqwest_method, &url).body(body.to_vec());
    for name in ALLOWED_HEADERS {
        if let Some(value) = headers.get(*name) {
            builder = builder.header(*name, value.as_bytes());
        }
    }

    let upstream = builder.send().await.map_err(|e| {
        AppError::Upstream(format!("proxying to 127.0.0.1:{target_local_port}: {e}"))
    })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let response_headers = filtered_headers_from_reqwest(upstream.headers());
    let body = upstream
        .bytes()
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    let mut response = (status, body).into_response();
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn filtered_headers_from_reqwest(src: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in ALLOWED_HEADERS {
        if let Some(value) = src.get(*name) {
            if let (Ok(header_name), Ok(header_value)) = (
                HeaderName::try_from(*name),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out.insert(header_name, header_value);
            }
        }
    }
    out
}

/// `WebSocketProxy(request, target_local_port, path_suffix)` (§4.5). Dials
/// the upstream before upgrading the client connection so a dead tunnel
/// surfaces as a normal 502 rather than an upgraded-then-dropped socket.
pub async fn websocket_proxy(
    ws: WebSocketUpgrade,
    target_local_port: u16,
    path_suffix: String,
    requested_protocols: Vec<String>,
) -> Result<Response, AppError> {
    if target_local_port == 0 {
        return Err(AppError::Unavailable(
            "no live tunnel for this instance/service".into(),
        ));
    }

    let url = format!("ws://127.0.0.1:{target_local_port}/{path_suffix}");
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| AppError::Upstream(e.to_string()))?;
    if !requested_protocols.is_empty() {
        let joined = requested_protocols.join(", ");
        request.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_str(&joined).map_err(|e| AppError::Validation(e.to_string()))?,
        );
    }

    let (upstream, _resp) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| AppError::Upstream(format!("dialing {url}: {e}")))?;

    Ok(ws
        .max_message_size(WS_READ_LIMIT)
        .on_upgrade(move |socket| relay(socket, upstream)))
}

async fn relay(
    client_socket: WebSocket,
    upstream_socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let cancel = CancellationToken::new();
    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_socket.split();

    let client_to_upstream = {
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = client_rx.next() => {
                        match msg {
                            Some(Ok(AxumMessage::Binary(data))) => {
                                if upstream_tx.send(WsMessage::Binary(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(AxumMessage::Text(text))) => {
                                if upstream_tx.send(WsMessage::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(AxumMessage::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("client websocket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            cancel.cancel();
        }
    };

    let upstream_to_client = {
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = upstream_rx.next() => {
                        match msg {
                            Some(Ok(WsMessage::Binary(data))) => {
                                if client_tx.send(AxumMessage::Binary(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Text(text))) => {
                                if client_tx.send(AxumMessage::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("upstream websocket error: {e}");
                                let _ = client_tx
                                    .send(AxumMessage::Close(Some(axum::extract::ws::CloseFrame {
                                        code: ws_close::UPSTREAM,
                                        reason: "upstream dial failed".into(),
                                    })))
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }
            cancel.cancel();
        }
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_excludes_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-secret", HeaderValue::from_static("leak-me-not"));
        let filtered = filtered_headers(&headers);
        assert!(filtered.contains_key("content-type"));
        assert!(!filtered.contains_key("connection"));
        assert!(!filtered.contains_key("x-secret"));
    }
}
