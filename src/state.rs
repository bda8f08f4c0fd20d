//! Shared application state (§9 DI note): every component is constructed
//! once at startup and handed around as `State<Arc<AppState>>`, mirroring
//! the teacher's single `AppState` struct threaded through its router.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::keys::KeyManager;
use crate::orchestrator::Orchestrator;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::ssh::trust_store::TrustStore;
use crate::ssh::{PoolConfig, SshPool};
use crate::store::InstanceStore;
use crate::terminal::TerminalManager;
use crate::tunnel::TunnelManager;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<InstanceStore>,
    pub pool: Arc<SshPool>,
    pub tunnels: Arc<TunnelManager>,
    pub terminals: Arc<TerminalManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub key_manager: Arc<KeyManager>,
    pub trust_store: Arc<TrustStore>,
    pub http_client: Arc<reqwest::Client>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Arc<dyn Orchestrator>) -> anyhow::Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let trust_store = Arc::new(TrustStore::load(&config.data_dir));
        let key_manager = Arc::new(KeyManager::new(config.data_dir.clone()));
        let signer = key_manager.load_or_create_signer()?;

        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            window_secs: config.rate_limit_window_secs as i64,
            max_attempts: config.rate_limit_max_attempts as usize,
            failure_threshold: config.rate_limit_failure_threshold,
            block_initial_secs: config.rate_limit_block_initial_secs as i64,
            block_cap_secs: config.rate_limit_block_cap_secs as i64,
        }));

        let pool = SshPool::new(
            PoolConfig {
                max_connections: config.max_ssh_connections,
                connect_timeout_secs: config.ssh_connect_timeout_secs,
                keepalive_interval_secs: config.keepalive_interval_secs,
                health_check_timeout_secs: config.health_check_timeout_secs,
                reconnect_base_secs: config.reconnect_base_secs,
                reconnect_cap_secs: config.reconnect_cap_secs,
                reconnect_max_attempts: config.reconnect_max_attempts,
            },
            signer,
            trust_store.clone(),
            rate_limiter.clone(),
        );

        let tunnels = TunnelManager::new(pool.clone());
        let terminals = TerminalManager::new(pool.clone(), Some(config.terminal_scrollback_bytes));
        let store = InstanceStore::new();

        let http_client = Arc::new(
            reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        );

        Ok(Arc::new(Self {
            config,
            store,
            pool,
            tunnels,
            terminals,
            rate_limiter,
            orchestrator,
            key_manager,
            trust_store,
            http_client,
            cancel,
        }))
    }

    /// Starts the long-lived background loops (C1 keepalive, C2 reconciler
    /// and state watcher). Each exits on `self.cancel` (§5 concurrency model).
    pub fn spawn_background_loops(self: &Arc<Self>) {
        self.pool.clone().spawn_keepalive_loop();
        self.tunnels.clone().spawn_reconciler(
            self.config.tunnel_reconcile_interval_secs,
            self.store.clone(),
        );
        self.tunnels.clone().spawn_state_watcher(self.store.clone());
    }
}
