//! russh-based SSH client connect + ed25519 auth (§4.1 Authentication).
//! Grounded on `ssh/client.rs`'s `SshClient::connect`/`ClientHandler`
//! structure, narrowed to the spec's single auth method (ed25519
//! public-key) and TOFU host-key handling (§9).

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh_keys::key::{KeyPair, PublicKey};
use russh::{Channel, ChannelMsg};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::trust_store::{HostKeyVerification, TrustStore};

pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

pub async fn connect(
    params: &ConnectParams,
    signer: Arc<KeyPair>,
    trust_store: Arc<TrustStore>,
) -> Result<Handle<ClientHandler>, SshError> {
    let addr = format!("{}:{}", params.host, params.port);
    info!(host = %params.host, port = params.port, "dialing SSH");

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SshError::ConnectionFailed(format!("resolving {addr}: {e}")))?
        .next()
        .ok_or_else(|| SshError::ConnectionFailed(format!("no address for {addr}")))?;

    let config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(params.keepalive_interval_secs)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler::new(params.host.clone(), params.port, trust_store);

    let mut handle = tokio::time::timeout(
        Duration::from_secs(params.timeout_secs),
        client::connect(Arc::new(config), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::Timeout("SSH handshake".into()))?
    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

    debug!("SSH handshake complete, authenticating");

    let key_with_hash = PrivateKeyWithHashAlg::new(signer, None);
    let authenticated = handle
        .authenticate_publickey(&params.username, key_with_hash)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(
            "server rejected ed25519 key".into(),
        ));
    }

    info!(host = %params.host, "SSH authenticated");
    Ok(handle)
}

/// Runs `argv.join(" ")` over a fresh session and returns stdout, honoring a
/// deadline (§4.1 keepalive health-check, §4.4 log tail exec).
pub async fn exec(
    handle: &Handle<ClientHandler>,
    command: &str,
    timeout: Duration,
) -> Result<Vec<u8>, SshError> {
    let fut = async {
        let mut channel = handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        let mut out = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => out.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => out.extend_from_slice(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                _ => continue,
            }
        }
        Ok::<Vec<u8>, russh::Error>(out)
    };

    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SshError::Timeout(command.to_string()))?
        .map_err(SshError::from)
}

/// Runs `command` over a fresh session and streams stdout split on newlines
/// into the returned channel. Used for `tail -f`-style log following (§4.4);
/// the sender is dropped (closing the receiver) on EOF, channel close, or
/// cancellation.
pub async fn exec_stream(
    handle: &Handle<ClientHandler>,
    command: &str,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<tokio::sync::mpsc::Receiver<String>, SshError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        let mut pending = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            pending.extend_from_slice(&data);
                            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                                let line: Vec<u8> = pending.drain(..=pos).collect();
                                let line = String::from_utf8_lossy(&line).trim_end().to_string();
                                if tx.send(line).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        _ => continue,
                    }
                }
            }
        }
        if !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).trim_end().to_string();
            let _ = tx.send(line).await;
        }
    });

    Ok(rx)
}

pub async fn open_direct_tcpip(
    handle: &Handle<ClientHandler>,
    remote_host: &str,
    remote_port: u32,
) -> Result<Channel<client::Msg>, SshError> {
    handle
        .channel_open_direct_tcpip(remote_host, remote_port, "127.0.0.1", 0)
        .await
        .map_err(SshError::from)
}

/// Callback surface for server-initiated events. Only host-key verification
/// is exercised by this system; remote port forwarding is not requested so
/// `server_channel_open_forwarded_tcpip` is never invoked in practice.
pub struct ClientHandler {
    host: String,
    port: u16,
    trust_store: Arc<TrustStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, trust_store: Arc<TrustStore>) -> Self {
        Self {
            host,
            port,
            trust_store,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .trust_store
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    host = %self.host, port = self.port, %fingerprint,
                    "trust on first use: saving new host key"
                );
                if let Err(e) = self
                    .trust_store
                    .trust(&self.host, self.port, server_public_key)
                {
                    warn!("failed to persist host key: {e}");
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    host = %self.host, port = self.port,
                    %expected_fingerprint, %actual_fingerprint,
                    "host key changed, rejecting connection"
                );
                Err(SshError::ConnectionFailed(format!(
                    "host key for {}:{} changed (expected {expected_fingerprint}, got {actual_fingerprint})",
                    self.host, self.port
                )))
            }
        }
    }
}
