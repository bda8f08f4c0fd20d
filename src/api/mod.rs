//! Route table (§6). The teacher's retrieved pack declares `mod api;` but
//! ships no `api/mod.rs`/`api.rs` of its own; this file supplies it and
//! assembles every operator-facing route over the shared `AppState`.

pub mod auth;
pub mod files;
pub mod instances;
pub mod passthrough;
pub mod terminal;

use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/instances/:id/creation-logs", get(instances::creation_logs))
        .route("/instances/:id/logs", get(instances::runtime_logs))
        .route("/instances/:id/ssh-allowed-ips", get(instances::get_allowed_ips))
        .route("/instances/:id/ssh-allowed-ips", put(instances::set_allowed_ips))
        .route("/instances/:id/rotate-ssh-key", post(instances::rotate_ssh_key))
        .route("/instances/:id/files/browse", get(files::browse))
        .route("/instances/:id/files/read", get(files::read_file))
        .route("/instances/:id/files/download", get(files::download))
        .route("/instances/:id/files/create", post(files::create_file))
        .route("/instances/:id/files/mkdir", post(files::mkdir))
        .route("/instances/:id/files/upload", post(files::upload))
        .route("/instances/:id/terminal", get(terminal::attach))
        .route("/instances/:id/terminal-sessions", get(terminal::list_sessions))
        .route("/instances/:id/terminal-sessions/:sid", delete(terminal::close_session))
        .route("/instances/:id/control/*suffix", get(passthrough::control).post(passthrough::control).put(passthrough::control).delete(passthrough::control))
        .route("/instances/:id/desktop/:display/*suffix", get(passthrough::desktop).post(passthrough::desktop).put(passthrough::desktop).delete(passthrough::desktop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
