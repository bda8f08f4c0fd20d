//! Core data model (§3). `Instance` is the only entity shared across every
//! component; everything else here is DTO/wire shape for the operator API.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Error,
    Failed,
}

impl InstanceStatus {
    /// Statuses for which the creation-phase feed (C4) has nothing left to say (§8 S2).
    pub fn is_terminal_for_creation(self) -> bool {
        matches!(
            self,
            InstanceStatus::Running
                | InstanceStatus::Stopped
                | InstanceStatus::Failed
                | InstanceStatus::Error
        )
    }
}

/// The one cross-component entity (§3). `id`/`name` are immutable after
/// creation; `name` doubles as the orchestrator lookup key and must equal
/// the hostname inside the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    pub display_name: String,
    pub status: InstanceStatus,
    /// Encrypted at rest by the outer system; the core treats it as opaque.
    pub gateway_token: String,
    pub allowed_source_ips: Vec<String>,
    pub log_paths: LogPaths,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    /// TLS material for the agent's own HTTPS endpoints, if the instance
    /// terminates TLS itself rather than relying on the tunnel (§3).
    pub agent_tls: Option<AgentTls>,
}

/// Optional agent-side TLS certificate/key pair (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTls {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogPaths {
    pub openclaw: Option<String>,
    pub browser: Option<String>,
    pub system: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Openclaw,
    Browser,
    System,
}

impl std::str::FromStr for LogType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openclaw" => Ok(LogType::Openclaw),
            "browser" => Ok(LogType::Browser),
            "system" => Ok(LogType::System),
            _ => Err(()),
        }
    }
}

/// Pre-canned tunnel service labels (§3 ActiveTunnel, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceLabel {
    Vnc,
    Gateway,
    Custom,
}

pub const VNC_REMOTE_PORT: u16 = 5900;
pub const GATEWAY_REMOTE_PORT: u16 = 8088;

/// Caller identity for the access gate (§4.6). Session/user auth proper is a
/// non-goal; this is the minimal shape the core needs to evaluate role.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: u64,
    pub is_admin: bool,
    pub assigned_instances: HashSet<u64>,
}

impl Caller {
    pub fn may_access(&self, instance_id: u64) -> bool {
        self.is_admin || self.assigned_instances.contains(&instance_id)
    }
}

/// Resolved peer address used by C6's source-IP check and C1's allow-list.
#[derive(Debug, Clone, Copy)]
pub struct RemotePeer(pub IpAddr);
