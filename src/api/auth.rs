//! Minimal session/caller extraction. Real session management (login,
//! cookies, tokens) is a non-goal (§6); the core only needs a `Caller` to
//! run the two access-gate checks (§4.6), so this reads a pre-authenticated
//! `x-user-id` header the outer system is expected to set after its own
//! auth layer runs.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use async_trait::async_trait;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::Caller;
use crate::state::AppState;

pub struct CallerSession(pub Caller);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CallerSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| AppError::Unauthenticated("missing session".into()))?;

        Ok(CallerSession(state.store.caller(user_id).await))
    }
}
