//! `SSHConnection` (§3): one pooled entry owning a live client, its
//! reconnect params, metrics, state tracker and event buffer.

use chrono::{DateTime, Utc};
use russh::client::Handle;
use std::sync::Arc;

use super::client::ClientHandler;
use super::state_machine::StateTracker;

#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub connected_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub healthy: bool,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            connected_at: None,
            last_health_check: None,
            successful_checks: 0,
            failed_checks: 0,
            healthy: false,
        }
    }
}

/// One pool entry. `client` is `None` whenever the instance is not currently
/// connected; `params` survives disconnects so the reconnect loop can redial.
/// `generation` increments on every successful (re)connect — terminal
/// sessions (C3) bind to a generation and become `Done` when it changes,
/// resolving §9's "sessions tied to a single SSH client" assumption.
pub struct SshConnection {
    pub client: Option<Arc<Handle<ClientHandler>>>,
    pub params: Option<ConnectionParams>,
    pub metrics: ConnectionMetrics,
    pub tracker: StateTracker,
    pub reconnecting: bool,
    pub generation: u64,
}

impl SshConnection {
    pub fn new() -> Self {
        Self {
            client: None,
            params: None,
            metrics: ConnectionMetrics::default(),
            tracker: StateTracker::new(),
            reconnecting: false,
            generation: 0,
        }
    }
}

impl Default for SshConnection {
    fn default() -> Self {
        Self::new()
    }
}
