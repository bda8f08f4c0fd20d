//! C2: reverse tunnel manager. Opens `direct-tcpip` channels through C1 for
//! declared service ports and maintains per-instance local listeners (§4.2).
//! Grounded on the accept-loop + bidirectional pump shape of
//! `AnalyseDeCircuit-oxideterm/src-tauri/src/forwarding/local.rs`, adapted to
//! fetch the SSH client fresh from the pool on every accept (per spec) rather
//! than holding one `HandleController` for the tunnel's lifetime.

use russh::ChannelMsg;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{ServiceLabel, GATEWAY_REMOTE_PORT, VNC_REMOTE_PORT};
use crate::ssh::SshPool;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub service: ServiceLabel,
    pub remote_port: u16,
    pub protocol: &'static str,
}

pub struct ActiveTunnel {
    pub config: TunnelConfig,
    local_port: AtomicU16,
    closed: AtomicBool,
}

impl ActiveTunnel {
    pub fn local_port(&self) -> u16 {
        if self.closed.load(Ordering::SeqCst) {
            0
        } else {
            self.local_port.load(Ordering::SeqCst)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("no SSH client for instance {0}")]
    NoClient(u64),
    #[error("bind failed: {0}")]
    Bind(String),
}

pub struct TunnelManager {
    pool: Arc<SshPool>,
    tunnels: RwLock<HashMap<(u64, ServiceLabel), Arc<ActiveTunnel>>>,
}

impl TunnelManager {
    pub fn new(pool: Arc<SshPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            tunnels: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get_tunnels_for_instance(&self, instance_id: u64) -> Vec<Arc<ActiveTunnel>> {
        self.tunnels
            .read()
            .await
            .iter()
            .filter(|((id, _), _)| *id == instance_id)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub async fn get_local_port(&self, instance_id: u64, service: ServiceLabel) -> u16 {
        self.tunnels
            .read()
            .await
            .get(&(instance_id, service))
            .map(|t| t.local_port())
            .unwrap_or(0)
    }

    pub async fn get_vnc_local_port(&self, instance_id: u64) -> u16 {
        self.get_local_port(instance_id, ServiceLabel::Vnc).await
    }

    pub async fn get_gateway_local_port(&self, instance_id: u64) -> u16 {
        self.get_local_port(instance_id, ServiceLabel::Gateway).await
    }

    pub async fn create_tunnel_for_vnc(self: &Arc<Self>, instance_id: u64) -> Result<u16, TunnelError> {
        self.create_reverse_tunnel(instance_id, ServiceLabel::Vnc, VNC_REMOTE_PORT, 0)
            .await
    }

    pub async fn create_tunnel_for_gateway(self: &Arc<Self>, instance_id: u64) -> Result<u16, TunnelError> {
        self.create_reverse_tunnel(instance_id, ServiceLabel::Gateway, GATEWAY_REMOTE_PORT, 0)
            .await
    }

    /// Reuses a live tunnel for `(instance_id, service)`; otherwise binds a
    /// new local listener and spawns its accept loop (§4.2).
    pub async fn create_reverse_tunnel(
        self: &Arc<Self>,
        instance_id: u64,
        service: ServiceLabel,
        remote_port: u16,
        desired_local_port: u16,
    ) -> Result<u16, TunnelError> {
        if let Some(existing) = self.tunnels.read().await.get(&(instance_id, service)) {
            if !existing.is_closed() {
                return Ok(existing.local_port());
            }
        }

        let listener = TcpListener::bind(("127.0.0.1", desired_local_port))
            .await
            .map_err(|e| TunnelError::Bind(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| TunnelError::Bind(e.to_string()))?
            .port();

        let tunnel = Arc::new(ActiveTunnel {
            config: TunnelConfig {
                service,
                remote_port,
                protocol: "tcp",
            },
            local_port: AtomicU16::new(local_port),
            closed: AtomicBool::new(false),
        });

        self.tunnels
            .write()
            .await
            .insert((instance_id, service), tunnel.clone());

        let pool = self.pool.clone();
        let tunnel_for_loop = tunnel.clone();
        tokio::spawn(async move {
            accept_loop(pool, instance_id, remote_port, listener, tunnel_for_loop).await;
        });

        info!(instance_id, local_port, remote_port, "reverse tunnel established");
        Ok(local_port)
    }

    /// Reconciles declared services against live tunnels, creating only the
    /// missing ones; surviving local ports are unchanged (§4.2 Reuse — UI
    /// URLs embed local ports).
    pub async fn start_tunnels_for_instance(
        self: &Arc<Self>,
        instance_id: u64,
        declared: &[(ServiceLabel, u16)],
    ) -> Result<HashMap<ServiceLabel, u16>, TunnelError> {
        let mut result = HashMap::new();
        for (service, remote_port) in declared {
            let port = self
                .create_reverse_tunnel(instance_id, *service, *remote_port, 0)
                .await?;
            result.insert(*service, port);
        }
        Ok(result)
    }

    pub async fn are_tunnels_healthy(&self, instance_id: u64) -> bool {
        let tunnels = self.get_tunnels_for_instance(instance_id).await;
        !tunnels.is_empty() && tunnels.iter().all(|t| !t.is_closed())
    }

    pub async fn close_tunnel(&self, instance_id: u64, service: ServiceLabel) {
        if let Some(tunnel) = self.tunnels.write().await.remove(&(instance_id, service)) {
            tunnel.close();
        }
    }

    /// Periodic reconciler referenced in §4.2 failure semantics: re-creates
    /// listeners for instances whose SSH client is healthy but whose
    /// declared tunnels (VNC + gateway, every instance's fixed service set)
    /// are not all live.
    pub fn spawn_reconciler(self: &Arc<Self>, interval_secs: u64, store: Arc<crate::store::InstanceStore>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
                for instance in store.all().await {
                    let declared = [
                        (ServiceLabel::Vnc, VNC_REMOTE_PORT),
                        (ServiceLabel::Gateway, GATEWAY_REMOTE_PORT),
                    ];
                    if !manager.pool.has_client(instance.id).await {
                        continue;
                    }
                    if manager.are_tunnels_healthy(instance.id).await {
                        continue;
                    }
                    if let Err(e) = manager.start_tunnels_for_instance(instance.id, &declared).await {
                        warn!(instance_id = instance.id, "tunnel reconcile failed: {e}");
                    }
                }
            }
        });
    }

    /// `OnStateChange(callback)` consumer (§4.2): recreates tunnels the
    /// moment C1 reports an instance back in `Connected`, instead of waiting
    /// out `spawn_reconciler`'s sweep interval. The reconciler stays as the
    /// catch-all for tunnels that fail between connections (e.g. the remote
    /// service itself restarting without the SSH session dropping).
    pub fn spawn_state_watcher(self: &Arc<Self>, store: Arc<crate::store::InstanceStore>) {
        let manager = self.clone();
        let mut changes = manager.pool.subscribe_state_changes();
        tokio::spawn(async move {
            loop {
                let (instance_id, state) = match changes.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                if state != crate::ssh::ConnectionState::Connected {
                    continue;
                }
                if manager.are_tunnels_healthy(instance_id).await {
                    continue;
                }
                let Some(instance) = store.get(instance_id).await else {
                    continue;
                };
                let declared = [
                    (ServiceLabel::Vnc, VNC_REMOTE_PORT),
                    (ServiceLabel::Gateway, GATEWAY_REMOTE_PORT),
                ];
                if let Err(e) = manager.start_tunnels_for_instance(instance.id, &declared).await {
                    warn!(instance_id, "tunnel recreation on reconnect failed: {e}");
                }
            }
        });
    }
}

async fn accept_loop(
    pool: Arc<SshPool>,
    instance_id: u64,
    remote_port: u16,
    listener: TcpListener,
    tunnel: Arc<ActiveTunnel>,
) {
    loop {
        if tunnel.is_closed() {
            return;
        }
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(instance_id, %peer, "tunnel accepted connection");
                let pool = pool.clone();
                tokio::spawn(async move {
                    if let Err(e) = pump_connection(pool, instance_id, remote_port, stream).await {
                        warn!(instance_id, "tunnel connection error: {e}");
                    }
                });
            }
            Err(_) => {
                // Listener closed.
                return;
            }
        }
    }
}

async fn pump_connection(
    pool: Arc<SshPool>,
    instance_id: u64,
    remote_port: u16,
    mut local: tokio::net::TcpStream,
) -> Result<(), TunnelError> {
    let handle = pool
        .get_client(instance_id)
        .await
        .map_err(|_| TunnelError::NoClient(instance_id))?;

    let mut channel = crate::ssh::client::open_direct_tcpip(&handle, "127.0.0.1", remote_port as u32)
        .await
        .map_err(|_| TunnelError::NoClient(instance_id))?;

    let (mut local_read, mut local_write) = local.split();
    let mut buf = vec![0u8; 32 * 1024];

    loop {
        tokio::select! {
            read = local_read.read(&mut buf) => {
                match read {
                    Ok(0) => { let _ = channel.eof().await; break; }
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if local_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => continue,
                }
            }
        }
    }

    let _ = channel.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_tunnel_reports_zero_port_when_closed() {
        let tunnel = ActiveTunnel {
            config: TunnelConfig {
                service: ServiceLabel::Vnc,
                remote_port: VNC_REMOTE_PORT,
                protocol: "tcp",
            },
            local_port: AtomicU16::new(4000),
            closed: AtomicBool::new(false),
        };
        assert_eq!(tunnel.local_port(), 4000);
        tunnel.close();
        assert_eq!(tunnel.local_port(), 0);
    }
}
