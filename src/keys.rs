//! C7: ed25519 key lifecycle — generation, fingerprinting, and fleet-wide
//! rotation (§4.7). New to this system (the teacher never manages SSH
//! key material); the rotation algorithm follows the spec step-by-step,
//! reusing C1's `SshPool::set_signer` and the `Orchestrator` boundary for
//! the authorized_keys push.

use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;
use crate::ssh::trust_store::fingerprint;
use crate::ssh::{client, SshPool};

#[derive(Debug, Clone)]
pub struct InstanceRotationOutcome {
    pub instance_id: u64,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RotationResult {
    pub outcomes: Vec<InstanceRotationOutcome>,
    pub full_success: bool,
    pub new_fingerprint: String,
}

/// One instance's SSH identity, as needed to push and verify a new key.
pub struct InstanceTarget {
    pub instance_id: u64,
    pub instance_name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
}

pub struct KeyManager {
    key_dir: PathBuf,
}

fn authorized_keys_line(public: &PublicKey) -> String {
    format!("ssh-ed25519 {}", public.public_key_base64())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

impl KeyManager {
    pub fn new(key_dir: PathBuf) -> Self {
        Self { key_dir }
    }

    fn private_path(&self) -> PathBuf {
        self.key_dir.join("ssh_key")
    }
    fn public_path(&self) -> PathBuf {
        self.key_dir.join("ssh_key.pub")
    }

    /// Loads the existing signer from disk, generating and persisting a
    /// fresh one on first run (startup path, not part of §4.7 rotation).
    pub fn load_or_create_signer(&self) -> std::io::Result<Arc<KeyPair>> {
        std::fs::create_dir_all(&self.key_dir)?;
        let private_path = self.private_path();
        if let Ok(raw) = std::fs::read(&private_path) {
            if let Some(keypair) = decode_seed(&raw) {
                return Ok(Arc::new(keypair));
            }
            warn!("stored SSH key was unreadable, regenerating");
        }

        let keypair = KeyPair::generate_ed25519().expect("ed25519 generation cannot fail");
        self.write_keypair(&keypair, &private_path, &self.public_path())?;
        Ok(Arc::new(keypair))
    }

    fn write_keypair(&self, keypair: &KeyPair, private: &Path, public: &Path) -> std::io::Result<()> {
        let public_key = keypair
            .clone_public_key()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        std::fs::write(private, encode_seed(keypair))?;
        std::fs::write(public, authorized_keys_line(&public_key))?;
        set_mode(private, 0o600)?;
        set_mode(public, 0o644)?;
        Ok(())
    }

    /// `RotateGlobalKeyPair` (§4.7). Generates once, pushes to every target,
    /// swaps the on-disk identity and the pool's live signer, then verifies
    /// each instance over a fresh connection before narrowing its
    /// `authorized_keys` to the new key alone.
    pub async fn rotate_global_keypair(
        &self,
        targets: &[InstanceTarget],
        orchestrator: &dyn Orchestrator,
        pool: &Arc<SshPool>,
        trust_store: Arc<crate::ssh::trust_store::TrustStore>,
    ) -> std::io::Result<RotationResult> {
        let new_pair = KeyPair::generate_ed25519().expect("ed25519 generation cannot fail");
        let new_public = new_pair
            .clone_public_key()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let new_fingerprint = fingerprint(&new_public);
        let new_line = authorized_keys_line(&new_public);

        let private_new = self.key_dir.join("ssh_key.new");
        let public_new = self.key_dir.join("ssh_key.pub.new");
        self.write_keypair(&new_pair, &private_new, &public_new)?;

        info!(fingerprint = %new_fingerprint, "appending new key to authorized_keys on all instances");
        let mut appended = Vec::new();
        for target in targets {
            match pool.get_client(target.instance_id).await {
                Ok(handle) => {
                    let cmd = format!(
                        "mkdir -p ~/.ssh && echo '{new_line}' >> ~/.ssh/authorized_keys"
                    );
                    match client::exec(&handle, &cmd, Duration::from_secs(10)).await {
                        Ok(_) => appended.push(target.instance_id),
                        Err(e) => warn!(instance_id = target.instance_id, "append failed: {e}"),
                    }
                }
                Err(e) => warn!(instance_id = target.instance_id, "no client: {e}"),
            }
        }

        let private_path = self.private_path();
        let public_path = self.public_path();
        let private_old = self.key_dir.join("ssh_key.old");
        let public_old = self.key_dir.join("ssh_key.pub.old");
        if private_path.exists() {
            std::fs::rename(&private_path, &private_old)?;
            std::fs::rename(&public_path, &public_old)?;
        }
        std::fs::rename(&private_new, &private_path)?;
        std::fs::rename(&public_new, &public_path)?;

        let new_pair = Arc::new(new_pair);
        pool.set_signer(new_pair.clone()).await;

        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            let params = client::ConnectParams {
                host: target.host.clone(),
                port: target.port,
                username: target.username.clone(),
                timeout_secs: 10,
                keepalive_interval_secs: 30,
            };
            let outcome = match client::connect(&params, new_pair.clone(), trust_store.clone()).await
            {
                Ok(handle) => match client::exec(&handle, "echo ping", Duration::from_secs(5)).await {
                    Ok(_) => {
                        if let Err(e) = orchestrator
                            .configure_ssh_access(&target.instance_name, &new_line)
                            .await
                        {
                            InstanceRotationOutcome {
                                instance_id: target.instance_id,
                                success: false,
                                message: format!("verified but orchestrator push failed: {e}"),
                            }
                        } else {
                            InstanceRotationOutcome {
                                instance_id: target.instance_id,
                                success: true,
                                message: "rotated".into(),
                            }
                        }
                    }
                    Err(e) => InstanceRotationOutcome {
                        instance_id: target.instance_id,
                        success: false,
                        message: format!("post-rotation ping failed: {e}"),
                    },
                },
                Err(e) => InstanceRotationOutcome {
                    instance_id: target.instance_id,
                    success: false,
                    message: format!("post-rotation connect failed: {e}"),
                },
            };
            outcomes.push(outcome);
        }

        let full_success = outcomes.iter().all(|o| o.success);
        if full_success {
            let _ = std::fs::remove_file(&private_old);
            let _ = std::fs::remove_file(&public_old);
        } else {
            warn!("rotation incomplete, retaining .old backups");
        }

        Ok(RotationResult {
            outcomes,
            full_success,
            new_fingerprint,
        })
    }
}

/// Our own on-disk seed format for the private key (32 raw bytes); the
/// corresponding public key is always written in real OpenSSH wire format
/// since that one has to be parsed by sshd, not just by us.
fn encode_seed(keypair: &KeyPair) -> Vec<u8> {
    match keypair {
        KeyPair::Ed25519(signing_key) => signing_key.to_bytes().to_vec(),
        _ => Vec::new(),
    }
}

fn decode_seed(raw: &[u8]) -> Option<KeyPair> {
    let bytes: [u8; 32] = raw.try_into().ok()?;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&bytes);
    Some(KeyPair::Ed25519(signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypair_round_trips_through_seed_encoding() {
        let pair = KeyPair::generate_ed25519().unwrap();
        let encoded = encode_seed(&pair);
        let decoded = decode_seed(&encoded).unwrap();
        let a = pair.clone_public_key().unwrap();
        let b = decoded.clone_public_key().unwrap();
        assert_eq!(authorized_keys_line(&a), authorized_keys_line(&b));
    }

    #[test]
    fn load_or_create_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let manager = KeyManager::new(dir.path().to_path_buf());
        let first = manager.load_or_create_signer().unwrap();
        let second = manager.load_or_create_signer().unwrap();
        assert_eq!(
            authorized_keys_line(&first.clone_public_key().unwrap()),
            authorized_keys_line(&second.clone_public_key().unwrap())
        );
    }
}
