//! IP allow-list helpers (§4.1). Used by C6's source-IP check and by the
//! proxy when an instance declares a non-empty allow-list.

use ipnet::IpNet;
use std::net::IpAddr;

/// Comma-separated list; bare hosts become /32 or /128 CIDRs. Empty input
/// means "allow all" (represented as an empty `Vec`, checked by the caller).
pub fn parse_allowed_ips(raw: &str) -> Result<Vec<IpNet>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            if entry.contains('/') {
                entry
                    .parse::<IpNet>()
                    .map_err(|e| format!("invalid CIDR {entry}: {e}"))
            } else {
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|e| format!("invalid host {entry}: {e}"))
            }
        })
        .collect()
}

/// `allowed` empty ⇒ allow all.
pub fn check_ip_allowed(remote: IpAddr, allowed: &[IpNet]) -> bool {
    allowed.is_empty() || allowed.iter().any(|net| net.contains(&remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_all() {
        let allowed = parse_allowed_ips("").unwrap();
        assert!(check_ip_allowed("203.0.113.5".parse().unwrap(), &allowed));
    }

    #[test]
    fn bare_host_becomes_single_host_cidr() {
        let allowed = parse_allowed_ips("10.0.0.5").unwrap();
        assert!(check_ip_allowed("10.0.0.5".parse().unwrap(), &allowed));
        assert!(!check_ip_allowed("10.0.0.6".parse().unwrap(), &allowed));
    }

    #[test]
    fn cidr_matches_by_containment() {
        let allowed = parse_allowed_ips("10.0.0.0/24, 192.168.1.1").unwrap();
        assert!(check_ip_allowed("10.0.0.200".parse().unwrap(), &allowed));
        assert!(check_ip_allowed("192.168.1.1".parse().unwrap(), &allowed));
        assert!(!check_ip_allowed("10.0.1.1".parse().unwrap(), &allowed));
    }

    #[test]
    fn invalid_entry_is_rejected() {
        assert!(parse_allowed_ips("not-an-ip").is_err());
    }
}
