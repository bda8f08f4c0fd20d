//! C6: access gate. Two layered checks run on every proxied request —
//! role-based (admin or explicit assignment) then source-IP allow-list
//! (§4.6). Grounded on `Caller::may_access` (§3) and the CIDR containment
//! check already used by C1's connect-time IP gating.

use std::net::IpAddr;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::Caller;
use crate::ssh::allowlist::{check_ip_allowed, parse_allowed_ips};
use crate::store::InstanceStore;

/// Runs both gates for `caller` against `instance_id` from `remote`.
/// Returns 403 on either failure, 404 if the instance does not exist.
pub async fn check_access(
    store: &Arc<InstanceStore>,
    caller: &Caller,
    instance_id: u64,
    remote: IpAddr,
) -> Result<(), AppError> {
    if !caller.may_access(instance_id) {
        return Err(AppError::Authorization(
            "caller is not assigned to this instance".into(),
        ));
    }

    let instance = store
        .get(instance_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("instance {instance_id} not found")))?;

    if instance.allowed_source_ips.is_empty() {
        return Ok(());
    }

    let raw = instance.allowed_source_ips.join(",");
    let allowed = parse_allowed_ips(&raw)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("stored allow-list is invalid: {e}")))?;

    if check_ip_allowed(remote, &allowed) {
        Ok(())
    } else {
        Err(AppError::Authorization(format!(
            "source IP {remote} is not permitted for this instance"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Instance, LogPaths};

    fn instance_with_ips(id: u64, ips: Vec<&str>) -> Instance {
        Instance {
            id,
            name: format!("agent-{id}"),
            display_name: format!("Agent {id}"),
            status: crate::models::InstanceStatus::Running,
            gateway_token: "tok".into(),
            allowed_source_ips: ips.into_iter().map(String::from).collect(),
            log_paths: LogPaths::default(),
            ssh_host: "127.0.0.1".into(),
            ssh_port: 22,
            ssh_username: "agent".into(),
            agent_tls: None,
        }
    }

    #[tokio::test]
    async fn unassigned_caller_is_denied() {
        let store = InstanceStore::new();
        store.insert(instance_with_ips(1, vec![])).await;
        let caller = Caller {
            user_id: 99,
            is_admin: false,
            assigned_instances: Default::default(),
        };
        let result = check_access(&store, &caller, 1, "10.0.0.1".parse().unwrap()).await;
        assert!(matches!(result, Err(AppError::Authorization(_))));
    }

    #[tokio::test]
    async fn ip_outside_allow_list_is_denied() {
        let store = InstanceStore::new();
        store.insert(instance_with_ips(1, vec!["10.0.0.0/24"])).await;
        store.assign(7, 1).await;
        let caller = store.caller(7).await;

        let denied = check_access(&store, &caller, 1, "192.168.1.1".parse().unwrap()).await;
        assert!(matches!(denied, Err(AppError::Authorization(_))));

        let allowed = check_access(&store, &caller, 1, "10.0.0.5".parse().unwrap()).await;
        assert!(allowed.is_ok());
    }

    #[tokio::test]
    async fn missing_instance_is_not_found() {
        let store = InstanceStore::new();
        store.set_admin(1).await;
        let caller = store.caller(1).await;
        let result = check_access(&store, &caller, 404, "10.0.0.1".parse().unwrap()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
