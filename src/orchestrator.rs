//! Orchestrator boundary (§6, §9). The core consumes exactly this capability
//! set; real Kubernetes/Docker clients and container image construction are
//! non-goals. `NullOrchestrator` is a minimal in-memory stand-in sufficient
//! to wire and test the routes that depend on it.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("orchestrator operation failed: {0}")]
    Failed(String),
}

pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get_instance_status(&self, name: &str) -> Result<String, OrchestratorError>;

    /// Streams creation-phase log lines; the channel closes when the stream ends.
    async fn stream_creation_logs(
        &self,
        name: &str,
    ) -> Result<mpsc::Receiver<String>, OrchestratorError>;

    async fn exec_in_instance(
        &self,
        name: &str,
        argv: &[String],
    ) -> Result<ExecResult, OrchestratorError>;

    async fn configure_ssh_access(
        &self,
        name: &str,
        pubkey: &str,
    ) -> Result<(), OrchestratorError>;

    async fn get_ssh_address(&self, name: &str) -> Result<(String, u16), OrchestratorError>;

    async fn create_instance(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn delete_instance(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn start_instance(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn stop_instance(&self, name: &str) -> Result<(), OrchestratorError>;
    async fn restart_instance(&self, name: &str) -> Result<(), OrchestratorError>;
}

/// In-memory stand-in used for local wiring and tests. Not a production
/// Kubernetes/Docker client — see DESIGN.md.
#[derive(Default)]
pub struct NullOrchestrator {
    statuses: RwLock<HashMap<String, String>>,
    addresses: RwLock<HashMap<String, (String, u16)>>,
}

impl NullOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, name: &str, status: &str) {
        self.statuses
            .write()
            .await
            .insert(name.to_string(), status.to_string());
    }

    pub async fn set_ssh_address(&self, name: &str, host: &str, port: u16) {
        self.addresses
            .write()
            .await
            .insert(name.to_string(), (host.to_string(), port));
    }
}

#[async_trait]
impl Orchestrator for NullOrchestrator {
    async fn get_instance_status(&self, name: &str) -> Result<String, OrchestratorError> {
        self.statuses
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn stream_creation_logs(
        &self,
        _name: &str,
    ) -> Result<mpsc::Receiver<String>, OrchestratorError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn exec_in_instance(
        &self,
        _name: &str,
        _argv: &[String],
    ) -> Result<ExecResult, OrchestratorError> {
        Err(OrchestratorError::Failed(
            "NullOrchestrator cannot exec; supply a real orchestrator".into(),
        ))
    }

    async fn configure_ssh_access(
        &self,
        _name: &str,
        _pubkey: &str,
    ) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn get_ssh_address(&self, name: &str) -> Result<(String, u16), OrchestratorError> {
        self.addresses
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn create_instance(&self, name: &str) -> Result<(), OrchestratorError> {
        self.set_status(name, "creating").await;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), OrchestratorError> {
        self.statuses.write().await.remove(name);
        Ok(())
    }

    async fn start_instance(&self, name: &str) -> Result<(), OrchestratorError> {
        self.set_status(name, "running").await;
        Ok(())
    }

    async fn stop_instance(&self, name: &str) -> Result<(), OrchestratorError> {
        self.set_status(name, "stopped").await;
        Ok(())
    }

    async fn restart_instance(&self, name: &str) -> Result<(), OrchestratorError> {
        self.set_status(name, "restarting").await;
        Ok(())
    }
}
