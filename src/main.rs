mod access;
mod api;
mod cli;
mod config;
mod error;
mod keys;
mod models;
mod orchestrator;
mod proxy;
mod ratelimit;
mod ssh;
mod state;
mod store;
mod streaming;
mod terminal;
mod tunnel;

use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, Level};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::orchestrator::NullOrchestrator;
use crate::state::AppState;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => run_server(config).await,
    }
}

async fn run_server(config_path: std::path::PathBuf) -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let config = if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        serde_json::from_str(&content)?
    } else {
        AppConfig::load()?
    };
    let port = config.server_port;

    let orchestrator = Arc::new(NullOrchestrator::new());
    let state = AppState::new(config, orchestrator)?;
    state.spawn_background_loops();

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::router(state))
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("control-plane core listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}