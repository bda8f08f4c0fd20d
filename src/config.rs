use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub log_level: String,

    /// Directory holding the global ed25519 keypair and the host-key trust store.
    pub data_dir: PathBuf,

    /// C1: ceiling on concurrently pooled SSH connections.
    pub max_ssh_connections: usize,
    /// C1: keepalive tick interval, seconds.
    pub keepalive_interval_secs: u64,
    /// C1: per-dial handshake timeout, seconds.
    pub ssh_connect_timeout_secs: u64,
    /// C1: health-check exec timeout, seconds.
    pub health_check_timeout_secs: u64,
    /// C1: reconnect backoff base, seconds.
    pub reconnect_base_secs: u64,
    /// C1: reconnect backoff cap, seconds.
    pub reconnect_cap_secs: u64,
    /// C1: max reconnect attempts before Failed.
    pub reconnect_max_attempts: u32,

    /// C2: interval of the tunnel reconciler sweep, seconds.
    pub tunnel_reconcile_interval_secs: u64,

    /// C3: scrollback capacity per terminal session, bytes.
    pub terminal_scrollback_bytes: usize,

    /// C8: sliding window width, seconds.
    pub rate_limit_window_secs: u64,
    /// C8: max attempts allowed inside the window.
    pub rate_limit_max_attempts: u32,
    /// C8: consecutive-failure threshold that triggers a block.
    pub rate_limit_failure_threshold: u32,
    /// C8: initial block duration, seconds (doubles per escalation, capped).
    pub rate_limit_block_initial_secs: u64,
    /// C8: cap on escalating block duration, seconds.
    pub rate_limit_block_cap_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_port: 8080,
            log_level: "info".to_string(),
            data_dir: PathBuf::from("./data"),
            max_ssh_connections: 256,
            keepalive_interval_secs: 30,
            ssh_connect_timeout_secs: 10,
            health_check_timeout_secs: 5,
            reconnect_base_secs: 1,
            reconnect_cap_secs: 16,
            reconnect_max_attempts: 10,
            tunnel_reconcile_interval_secs: 15,
            terminal_scrollback_bytes: 256 * 1024,
            rate_limit_window_secs: 60,
            rate_limit_max_attempts: 10,
            rate_limit_failure_threshold: 5,
            rate_limit_block_initial_secs: 30,
            rate_limit_block_cap_secs: 300,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = "config.json";

        if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: AppConfig = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(config_path, content)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::load()
        }
    }
}
