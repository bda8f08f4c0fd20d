//! Error taxonomy (§7). Internal components return typed errors for control
//! flow; `AppError` is the single surface that crosses the HTTP boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorEnvelope {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Authorization(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        (status, axum::Json(ErrorEnvelope { detail })).into_response()
    }
}

impl From<crate::ssh::SshError> for AppError {
    fn from(err: crate::ssh::SshError) -> Self {
        use crate::ssh::SshError as S;
        match err {
            S::NotFound(id) => AppError::NotFound(format!("no SSH connection for instance {id}")),
            S::MaxConnections => AppError::Unavailable("maximum connections reached".into()),
            S::Validation(msg) => AppError::Validation(msg),
            S::RateLimited { retry_after_secs } => AppError::Unavailable(format!(
                "rate limited, retry after {retry_after_secs}s"
            )),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

impl From<crate::tunnel::TunnelError> for AppError {
    fn from(err: crate::tunnel::TunnelError) -> Self {
        use crate::tunnel::TunnelError as T;
        match err {
            T::NoClient(id) => AppError::Unavailable(format!("no live tunnel for instance {id}")),
            T::Bind(msg) => AppError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<crate::terminal::TerminalError> for AppError {
    fn from(err: crate::terminal::TerminalError) -> Self {
        use crate::terminal::TerminalError as T;
        match err {
            T::NotFound => AppError::NotFound("terminal session not found".into()),
            T::AlreadyAttached => AppError::Validation("a writer is already attached".into()),
            T::InputTooLarge => AppError::Validation("input exceeds maximum message size".into()),
            T::InvalidResize => AppError::Validation("resize dimensions out of range".into()),
            T::NoClient(id) => AppError::Unavailable(format!("no SSH client for instance {id}")),
            T::Ssh(e) => AppError::from(e),
            T::Russh(e) => AppError::Upstream(e.to_string()),
        }
    }
}

/// WebSocket close codes in the 4000 range (§7 propagation policy).
pub mod ws_close {
    pub const NOT_FOUND: u16 = 4004;
    pub const AUTH: u16 = 4401;
    pub const INTERNAL: u16 = 4500;
    pub const UPSTREAM: u16 = 4502;
    pub const CONFLICT: u16 = 4409;
}
