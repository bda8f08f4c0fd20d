//! In-memory stand-in for the external persisted-state store (§6). The core
//! only ever reads `Status`/`AllowedSourceIPs`/`LogPaths`/`SSHPublicKey` and
//! the user⇄instance assignment set; schema ownership stays outside the core.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{Caller, Instance, InstanceStatus};

#[derive(Default)]
pub struct InstanceStore {
    instances: RwLock<HashMap<u64, Instance>>,
    /// (user_id, instance_id) assignment set consumed by C6.
    assignments: RwLock<HashSet<(u64, u64)>>,
    admins: RwLock<HashSet<u64>>,
}

impl InstanceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, instance: Instance) {
        self.instances.write().await.insert(instance.id, instance);
    }

    pub async fn get(&self, id: u64) -> Option<Instance> {
        self.instances.read().await.get(&id).cloned()
    }

    pub async fn set_status(&self, id: u64, status: InstanceStatus) {
        if let Some(inst) = self.instances.write().await.get_mut(&id) {
            inst.status = status;
        }
    }

    pub async fn set_allowed_ips(&self, id: u64, ips: Vec<String>) -> bool {
        if let Some(inst) = self.instances.write().await.get_mut(&id) {
            inst.allowed_source_ips = ips;
            true
        } else {
            false
        }
    }

    pub async fn assign(&self, user_id: u64, instance_id: u64) {
        self.assignments.write().await.insert((user_id, instance_id));
    }

    pub async fn set_admin(&self, user_id: u64) {
        self.admins.write().await.insert(user_id);
    }

    pub async fn caller(&self, user_id: u64) -> Caller {
        let is_admin = self.admins.read().await.contains(&user_id);
        let assigned = self
            .assignments
            .read()
            .await
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, i)| *i)
            .collect();
        Caller {
            user_id,
            is_admin,
            assigned_instances: assigned,
        }
    }

    pub async fn all(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogPaths;

    fn test_instance(id: u64) -> Instance {
        Instance {
            id,
            name: format!("agent-{id}"),
            display_name: format!("Agent {id}"),
            status: InstanceStatus::Running,
            gateway_token: "tok".into(),
            allowed_source_ips: vec![],
            log_paths: LogPaths::default(),
            ssh_host: "127.0.0.1".into(),
            ssh_port: 22,
            ssh_username: "agent".into(),
            agent_tls: None,
        }
    }

    #[tokio::test]
    async fn caller_access_follows_assignment() {
        let store = InstanceStore::new();
        store.insert(test_instance(1)).await;
        store.assign(42, 1).await;

        let caller = store.caller(42).await;
        assert!(caller.may_access(1));
        assert!(!caller.may_access(2));
    }

    #[tokio::test]
    async fn admin_accesses_any_instance() {
        let store = InstanceStore::new();
        store.insert(test_instance(1)).await;
        store.set_admin(7).await;

        let caller = store.caller(7).await;
        assert!(caller.may_access(1));
        assert!(caller.may_access(999));
    }

    #[tokio::test]
    async fn set_allowed_ips_updates_instance() {
        let store = InstanceStore::new();
        store.insert(test_instance(1)).await;
        assert!(store.set_allowed_ips(1, vec!["10.0.0.0/8".into()]).await);
        let inst = store.get(1).await.unwrap();
        assert_eq!(inst.allowed_source_ips, vec!["10.0.0.0/8".to_string()]);
    }
}
