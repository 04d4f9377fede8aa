//! Concrete probe methods
//!
//! Each method pairs a serde argument struct (as written under
//! `[checks.probe]`) with a type implementing [`Probe`](super::probe::Probe).

use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;

use super::probe::ProbeError;

pub mod dns;
pub mod file;
pub mod http;
pub mod icmp;
pub mod ntp;
pub mod shell;
pub mod tcp;

/// Address family restriction for remote targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Shared host validation for remote methods
fn validate_host(method: &str, host: &str) -> Option<String> {
    if host.trim().is_empty() {
        Some(format!("{} probe requires a non-empty host", method))
    } else {
        None
    }
}

/// An IP literal host must agree with a configured address family
fn validate_family(method: &str, host: &str, family: Option<AddressFamily>) -> Option<String> {
    let family = family?;
    let addr: IpAddr = host.parse().ok()?;
    if family.matches(&addr) {
        None
    } else {
        Some(format!(
            "{} probe host {} does not match address_family {:?}",
            method, addr, family
        ))
    }
}

/// Resolve `host` to every address of the requested family
async fn resolve_targets(
    host: &str,
    port: u16,
    family: Option<AddressFamily>,
) -> Result<Vec<SocketAddr>, ProbeError> {
    let targets: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Resolve {
            host: host.to_string(),
            message: e.to_string(),
        })?
        .filter(|addr| family.is_none_or(|f| f.matches(&addr.ip())))
        .collect();

    if targets.is_empty() {
        return Err(ProbeError::Resolve {
            host: host.to_string(),
            message: "no addresses of the requested family".to_string(),
        });
    }
    Ok(targets)
}

/// Run `check` against each target in turn.
///
/// With `all_valid` every target must pass; otherwise the first passing
/// target wins and the last error is reported when none pass.
async fn check_targets<F, Fut>(
    targets: &[SocketAddr],
    all_valid: bool,
    check: F,
) -> Result<String, ProbeError>
where
    F: Fn(SocketAddr) -> Fut,
    Fut: Future<Output = Result<String, ProbeError>>,
{
    let mut details = Vec::with_capacity(targets.len());
    let mut last_error = None;

    for target in targets {
        match check(*target).await {
            Ok(detail) if all_valid => details.push(detail),
            Ok(detail) => return Ok(detail),
            Err(e) if all_valid => return Err(e),
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => Err(e),
        None if details.is_empty() => Err(ProbeError::Mismatch("no targets to check".to_string())),
        None => Ok(details.join("; ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(ports: &[u16]) -> Vec<SocketAddr> {
        ports
            .iter()
            .map(|p| SocketAddr::from(([127, 0, 0, 1], *p)))
            .collect()
    }

    async fn odd_ports_pass(addr: SocketAddr) -> Result<String, ProbeError> {
        if addr.port() % 2 == 1 {
            Ok(format!("{} ok", addr.port()))
        } else {
            Err(ProbeError::Mismatch(format!("{} down", addr.port())))
        }
    }

    #[tokio::test]
    async fn test_any_target_passing_is_enough() {
        let detail = check_targets(&addrs(&[2, 3]), false, odd_ports_pass).await.unwrap();
        assert_eq!(detail, "3 ok");
        assert!(check_targets(&addrs(&[2, 4]), false, odd_ports_pass).await.is_err());
    }

    #[tokio::test]
    async fn test_all_valid_requires_every_target() {
        assert!(check_targets(&addrs(&[3, 4]), true, odd_ports_pass).await.is_err());
        let detail = check_targets(&addrs(&[3, 5]), true, odd_ports_pass).await.unwrap();
        assert_eq!(detail, "3 ok; 5 ok");
    }

    #[tokio::test]
    async fn test_resolve_targets_filters_family() {
        let targets = resolve_targets("127.0.0.1", 53, None).await.unwrap();
        assert_eq!(targets, addrs(&[53]));
        let result = resolve_targets("127.0.0.1", 53, Some(AddressFamily::Ipv6)).await;
        assert!(matches!(result, Err(ProbeError::Resolve { .. })));
    }

    #[test]
    fn test_validate_family_against_literal() {
        assert!(validate_family("tcp", "192.0.2.1", Some(AddressFamily::Ipv6)).is_some());
        assert!(validate_family("tcp", "192.0.2.1", Some(AddressFamily::Ipv4)).is_none());
        assert!(validate_family("tcp", "svc.example", Some(AddressFamily::Ipv6)).is_none());
    }
}
