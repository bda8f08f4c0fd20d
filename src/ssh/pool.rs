//! C1: SSH connection pool. Establish, monitor, reconnect, rate-limit and
//! track state of one SSH session per agent (§4.1). The map itself is
//! guarded by an `RwLock` held only for O(1) lookups/inserts (§5); dialing,
//! handshakes and health-check execs all happen outside the lock, mirroring
//! the "synchronous helpers vs async operations" split in the teacher's
//! `ssh.rs` and the reconnect-loop shape of
//! `other_examples/33d7db9d_...connection-manager.rs.rs`.

use russh_keys::key::KeyPair;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::{self, ClientHandler, ConnectParams};
use super::connection::{ConnectionMetrics, ConnectionParams, SshConnection};
use super::error::SshError;
use super::state_machine::{ConnectionEventKind, ConnectionState};
use super::trust_store::TrustStore;
use crate::ratelimit::{AllowResult, RateLimiter};

pub struct PoolConfig {
    pub max_connections: usize,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub reconnect_base_secs: u64,
    pub reconnect_cap_secs: u64,
    pub reconnect_max_attempts: u32,
}

pub struct SshPool {
    config: RwLock<PoolConfig>,
    entries: RwLock<HashMap<u64, SshConnection>>,
    names: RwLock<HashMap<u64, String>>,
    signer: RwLock<Arc<KeyPair>>,
    trust_store: Arc<TrustStore>,
    rate_limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    /// `OnStateChange(callback)` (§4.2 C1 contract). Fired whenever an
    /// instance's tracker completes a transition; C2 subscribes to recreate
    /// tunnels the moment a connection comes back up rather than waiting out
    /// the reconciler's sweep interval.
    state_changes: broadcast::Sender<(u64, ConnectionState)>,
}

impl SshPool {
    pub fn new(
        config: PoolConfig,
        signer: Arc<KeyPair>,
        trust_store: Arc<TrustStore>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        let (state_changes, _) = broadcast::channel(256);
        Arc::new(Self {
            config: RwLock::new(config),
            entries: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            signer: RwLock::new(signer),
            trust_store,
            rate_limiter,
            cancel: CancellationToken::new(),
            state_changes,
        })
    }

    /// `OnStateChange(callback)` (§4.2). Lagged/backlogged subscribers just
    /// miss old transitions, never block a connection; only the current
    /// state is ever authoritative (via `state()`/`get_client()`).
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<(u64, ConnectionState)> {
        self.state_changes.subscribe()
    }

    fn notify_state_change(&self, instance_id: u64, state: ConnectionState) {
        let _ = self.state_changes.send((instance_id, state));
    }

    pub async fn set_max_connections(&self, max: usize) {
        self.config.write().await.max_connections = max;
    }

    /// Used by C7 after key rotation to swap the in-memory signer without
    /// disturbing live connections.
    pub async fn set_signer(&self, signer: Arc<KeyPair>) {
        *self.signer.write().await = signer;
    }

    pub async fn connect(
        self: &Arc<Self>,
        instance_id: u64,
        instance_name: &str,
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<(), SshError> {
        if instance_name.is_empty() || host.is_empty() {
            return Err(SshError::Validation("instance name and host are required".into()));
        }
        if port == 0 {
            return Err(SshError::Validation("port must be in [1, 65535]".into()));
        }

        {
            let entries = self.entries.read().await;
            let is_replacement = entries.contains_key(&instance_id);
            let max = self.config.read().await.max_connections;
            if !is_replacement && entries.len() >= max {
                return Err(SshError::MaxConnections);
            }
        }

        self.names
            .write()
            .await
            .insert(instance_id, instance_name.to_string());

        {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(instance_id).or_insert_with(SshConnection::new);
            entry.tracker.transition(ConnectionState::Connecting, "connect begin");
        }

        let connect_params = ConnectParams {
            host: host.to_string(),
            port,
            username: username.to_string(),
            timeout_secs: self.config.read().await.connect_timeout_secs,
            keepalive_interval_secs: self.config.read().await.keepalive_interval_secs,
        };
        let signer = self.signer.read().await.clone();

        let dial_result = client::connect(&connect_params, signer, self.trust_store.clone()).await;

        let mut entries = self.entries.write().await;
        let entry = entries.entry(instance_id).or_insert_with(SshConnection::new);

        match dial_result {
            Ok(handle) => {
                let old = entry.client.take();
                entry.client = Some(Arc::new(handle));
                entry.params = Some(ConnectionParams {
                    host: host.to_string(),
                    port,
                    username: username.to_string(),
                });
                entry.metrics = ConnectionMetrics {
                    connected_at: Some(chrono::Utc::now()),
                    healthy: true,
                    ..ConnectionMetrics::default()
                };
                entry.generation += 1;
                entry.tracker.transition(ConnectionState::Connected, "handshake ok");
                entry
                    .tracker
                    .record_event(instance_name, ConnectionEventKind::Connected, "connected");
                drop(old); // dropped after the new client is installed
                self.notify_state_change(instance_id, ConnectionState::Connected);
                info!(instance_id, "SSH connected");
                Ok(())
            }
            Err(e) => {
                entry.tracker.transition(ConnectionState::Disconnected, e.to_string());
                self.notify_state_change(instance_id, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub async fn has_client(&self, instance_id: u64) -> bool {
        self.entries
            .read()
            .await
            .get(&instance_id)
            .map(|e| e.client.is_some())
            .unwrap_or(false)
    }

    /// Returns a shared handle to the live client; matches the "fetched
    /// fresh from C1 every accept" requirement in §4.2.
    pub async fn get_client(
        &self,
        instance_id: u64,
    ) -> Result<Arc<russh::client::Handle<ClientHandler>>, SshError> {
        self.entries
            .read()
            .await
            .get(&instance_id)
            .and_then(|e| e.client.clone())
            .ok_or(SshError::NotFound(instance_id))
    }

    pub async fn generation(&self, instance_id: u64) -> u64 {
        self.entries
            .read()
            .await
            .get(&instance_id)
            .map(|e| e.generation)
            .unwrap_or(0)
    }

    pub async fn state(&self, instance_id: u64) -> Option<ConnectionState> {
        self.entries.read().await.get(&instance_id).map(|e| e.tracker.state())
    }

    pub async fn recent_events(&self, instance_id: u64, n: usize) -> Vec<super::state_machine::ConnectionEvent> {
        self.entries
            .read()
            .await
            .get(&instance_id)
            .map(|e| e.tracker.recent_events(n))
            .unwrap_or_default()
    }

    pub async fn close(&self, instance_id: u64) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&instance_id) {
            entry.client = None;
            entry.params = None;
            entry.tracker.transition(ConnectionState::Disconnected, "closed");
        }
        entries.remove(&instance_id);
    }

    pub async fn close_all(&self) {
        let ids: Vec<u64> = self.entries.read().await.keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
        self.cancel.cancel();
    }

    /// §4.1 health-check: SSH-level keepalive (implicit in `exec`'s channel
    /// open) plus `echo ping` on a fresh session, 5s timeout.
    pub async fn health_check(self: &Arc<Self>, instance_id: u64) -> bool {
        let handle = match self.get_client(instance_id).await {
            Ok(h) => h,
            Err(_) => return false,
        };
        let timeout = Duration::from_secs(self.config.read().await.health_check_timeout_secs);
        let ok = client::exec(&handle, "echo ping", timeout).await.is_ok();

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&instance_id) {
            entry.metrics.last_health_check = Some(chrono::Utc::now());
            if ok {
                entry.metrics.successful_checks += 1;
                entry.metrics.healthy = true;
            } else {
                entry.metrics.failed_checks += 1;
                entry.metrics.healthy = false;
            }
        }
        ok
    }

    /// Spawns the single background keepalive loop (§4.1). Call once after
    /// constructing the pool.
    pub fn spawn_keepalive_loop(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = pool.config.read().await.keepalive_interval_secs;
                tokio::select! {
                    _ = pool.cancel.cancelled() => {
                        info!("keepalive loop cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                }

                let ids: Vec<u64> = pool.entries.read().await.keys().copied().collect();
                for id in ids {
                    if !pool.has_client(id).await {
                        continue;
                    }
                    let healthy = pool.health_check(id).await;
                    if !healthy {
                        pool.handle_unhealthy(id).await;
                    }
                }
            }
        });
    }

    async fn handle_unhealthy(self: &Arc<Self>, instance_id: u64) {
        let name = self
            .names
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();

        let (should_reconnect, params) = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&instance_id) else {
                return;
            };
            entry.client = None;
            entry
                .tracker
                .record_event(&name, ConnectionEventKind::HealthFail, "keepalive failed");
            entry.tracker.transition(ConnectionState::Disconnected, "health check failed");
            let already_running = entry.reconnecting;
            if !already_running && entry.params.is_some() {
                entry.reconnecting = true;
            }
            (!already_running && entry.params.is_some(), entry.params.clone())
        };
        self.notify_state_change(instance_id, ConnectionState::Disconnected);

        if should_reconnect {
            if let Some(params) = params {
                self.clone().spawn_reconnect(instance_id, name, params);
            }
        }
    }

    /// §4.1 reconnection: exponential backoff base 1s factor 2 cap 16s,
    /// default max 10 attempts, one task per instance (dedup via the
    /// `reconnecting` flag set in `handle_unhealthy`).
    fn spawn_reconnect(self: Arc<Self>, instance_id: u64, instance_name: String, params: ConnectionParams) {
        tokio::spawn(async move {
            let (base, cap, max_attempts) = {
                let cfg = self.config.read().await;
                (cfg.reconnect_base_secs, cfg.reconnect_cap_secs, cfg.reconnect_max_attempts)
            };

            {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(&instance_id) {
                    entry.tracker.transition(ConnectionState::Reconnecting, "reconnect begin");
                    entry.tracker.record_event(
                        &instance_name,
                        ConnectionEventKind::Reconnecting,
                        "starting reconnection",
                    );
                }
            }
            self.notify_state_change(instance_id, ConnectionState::Reconnecting);

            let mut attempt = 0u32;
            let mut delay = Duration::from_secs(base);
            let outcome = loop {
                attempt += 1;

                match self.rate_limiter.allow(instance_id).await {
                    AllowResult::Denied { retry_after_secs } => {
                        warn!(instance_id, retry_after_secs, "reconnect rate limited");
                        let mut entries = self.entries.write().await;
                        if let Some(entry) = entries.get_mut(&instance_id) {
                            entry.tracker.record_event(
                                &instance_name,
                                ConnectionEventKind::RateLimited,
                                format!("retry after {retry_after_secs}s"),
                            );
                        }
                    }
                    AllowResult::Allowed => {
                        let dial_result = self
                            .connect(instance_id, &instance_name, &params.host, params.port, &params.username)
                            .await;

                        if dial_result.is_ok() {
                            self.rate_limiter.record_success(instance_id).await;
                            let mut entries = self.entries.write().await;
                            if let Some(entry) = entries.get_mut(&instance_id) {
                                entry.tracker.record_event(
                                    &instance_name,
                                    ConnectionEventKind::ReconnectSuccess,
                                    format!("reconnected after {attempt} attempt(s)"),
                                );
                            }
                            break true;
                        }
                        self.rate_limiter.record_failure(instance_id).await;
                    }
                }

                if attempt >= max_attempts {
                    break false;
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => break false,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(Duration::from_secs(cap));
            };

            let failed = {
                let mut entries = self.entries.write().await;
                let Some(entry) = entries.get_mut(&instance_id) else {
                    return;
                };
                entry.reconnecting = false;
                if !outcome {
                    entry.tracker.transition(ConnectionState::Failed, "retries exhausted");
                    entry.tracker.record_event(
                        &instance_name,
                        ConnectionEventKind::ReconnectFailed,
                        format!("exhausted {max_attempts} attempts"),
                    );
                    entry.params = None;
                    entry.metrics = ConnectionMetrics::default();
                    true
                } else {
                    false
                }
            };
            if failed {
                self.notify_state_change(instance_id, ConnectionState::Failed);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitConfig;

    fn test_pool() -> Arc<SshPool> {
        let signer = Arc::new(KeyPair::generate_ed25519().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let trust_store = Arc::new(TrustStore::load(dir.path()));
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        SshPool::new(
            PoolConfig {
                max_connections: 2,
                connect_timeout_secs: 1,
                keepalive_interval_secs: 30,
                health_check_timeout_secs: 1,
                reconnect_base_secs: 1,
                reconnect_cap_secs: 2,
                reconnect_max_attempts: 2,
            },
            signer,
            trust_store,
            rate_limiter,
        )
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_fails_without_panicking() {
        let pool = test_pool();
        let result = pool.connect(1, "agent-1", "127.0.0.1", 1, "agent").await;
        assert!(result.is_err());
        assert!(!pool.has_client(1).await);
    }

    #[tokio::test]
    async fn max_connections_rejects_new_id_beyond_cap() {
        let pool = test_pool();
        // Fill the pool with failed-but-tracked entries up to the cap by
        // connecting to addresses nothing listens on; entries are still
        // created (Disconnected) even though the dial fails, because the
        // entry is inserted before the dial and only removed on close().
        let _ = pool.connect(1, "agent-1", "127.0.0.1", 1, "agent").await;
        let _ = pool.connect(2, "agent-2", "127.0.0.1", 1, "agent").await;
        let third = pool.connect(3, "agent-3", "127.0.0.1", 1, "agent").await;
        assert!(matches!(third, Err(SshError::MaxConnections)));
    }

    #[tokio::test]
    async fn validation_rejects_empty_host() {
        let pool = test_pool();
        let result = pool.connect(1, "agent-1", "", 22, "agent").await;
        assert!(matches!(result, Err(SshError::Validation(_))));
    }

    #[tokio::test]
    async fn close_then_close_is_noop() {
        let pool = test_pool();
        let _ = pool.connect(1, "agent-1", "127.0.0.1", 1, "agent").await;
        pool.close(1).await;
        pool.close(1).await;
        assert!(!pool.has_client(1).await);
    }
}
