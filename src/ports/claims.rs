//! Port claim registry
//!
//! Records which (ip, port, protocol) triples are held open on behalf of a
//! service. Each claim keeps a placeholder socket bound so the kernel's
//! port table stays honest: the packet-filter rules redirect traffic before
//! it ever reaches the placeholder, but holding the bind (a) proves the
//! port was safe to take and (b) keeps that true.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::PortError;
use crate::service::{Protocol, ServicePortName};
use crate::socket::{ProxySocket, ProxySocketFactory};

/// Key for one claim. The address is kept as a string because a claim on
/// "all local addresses" (node ports) has no `IpAddr` representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClaimKey {
    ip: String,
    port: u16,
    protocol: Protocol,
}

impl ClaimKey {
    fn new(ip: Option<IpAddr>, port: u16, protocol: Protocol) -> Self {
        Self {
            ip: ip.map(|ip| ip.to_string()).unwrap_or_default(),
            port,
            protocol,
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.protocol)
    }
}

struct Claim {
    owner: ServicePortName,
    placeholder: Arc<dyn ProxySocket>,
}

/// Registry of service-owned local ports, serialized on its own lock.
pub struct PortClaimRegistry {
    make_socket: ProxySocketFactory,
    claims: Mutex<HashMap<ClaimKey, Claim>>,
}

impl PortClaimRegistry {
    /// Create a registry whose placeholder sockets come from `make_socket`.
    #[must_use]
    pub fn new(make_socket: ProxySocketFactory) -> Self {
        Self {
            make_socket,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a port as owned by `owner`, binding a placeholder socket.
    ///
    /// `None` for `ip` claims the port on all local addresses (node ports).
    /// Re-claiming with the same owner is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `PortError::Conflict` when another service holds the claim,
    /// or `PortError::ClaimSocket` when the placeholder cannot be bound.
    pub fn claim(
        &self,
        ip: Option<IpAddr>,
        port: u16,
        protocol: Protocol,
        owner: &ServicePortName,
    ) -> Result<(), PortError> {
        let key = ClaimKey::new(ip, port, protocol);
        let mut claims = self.claims.lock();

        if let Some(existing) = claims.get(&key) {
            if existing.owner == *owner {
                return Ok(());
            }
            return Err(PortError::Conflict {
                key: key.to_string(),
                owner: owner.to_string(),
                holder: existing.owner.to_string(),
            });
        }

        let bind_ip = ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let placeholder =
            (self.make_socket)(protocol, bind_ip, port).map_err(|e| PortError::ClaimSocket {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        debug!(port = %key, owner = %owner, "Claimed local port");
        claims.insert(key, Claim {
            owner: owner.clone(),
            placeholder,
        });
        Ok(())
    }

    /// Release a claim, closing its placeholder socket.
    ///
    /// Releasing an unclaimed port is tolerated (it happens when unwinding
    /// a failed merge).
    ///
    /// # Errors
    ///
    /// Returns `PortError::WrongOwner` when the claim is held by another
    /// service.
    pub fn release(
        &self,
        ip: Option<IpAddr>,
        port: u16,
        protocol: Protocol,
        owner: &ServicePortName,
    ) -> Result<(), PortError> {
        let key = ClaimKey::new(ip, port, protocol);
        let mut claims = self.claims.lock();

        let Some(existing) = claims.get(&key) else {
            info!(port = %key, "Ignoring release on unowned port");
            return Ok(());
        };
        if existing.owner != *owner {
            return Err(PortError::WrongOwner {
                key: key.to_string(),
                owner: owner.to_string(),
                holder: existing.owner.to_string(),
            });
        }
        let claim = claims.remove(&key).unwrap();
        claim.placeholder.close();
        Ok(())
    }

    /// Number of live claims
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::default_factory;

    fn owner(name: &str) -> ServicePortName {
        ServicePortName::new("default", name, "")
    }

    #[tokio::test]
    async fn test_claim_is_idempotent_for_same_owner() {
        let registry = PortClaimRegistry::new(default_factory());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let a = owner("a");

        registry.claim(Some(ip), 0, Protocol::Udp, &a).unwrap();
        assert_eq!(registry.len(), 1);

        // Same (ip, port, protocol, owner): no second placeholder.
        registry.claim(Some(ip), 0, Protocol::Udp, &a).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_conflict_leaves_holder_intact() {
        let registry = PortClaimRegistry::new(default_factory());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let a = owner("a");
        let b = owner("b");

        registry.claim(Some(ip), 31234, Protocol::Tcp, &a).unwrap();
        let err = registry.claim(Some(ip), 31234, Protocol::Tcp, &b).unwrap_err();
        assert!(matches!(err, PortError::Conflict { .. }));
        assert_eq!(registry.len(), 1);

        // The holder can still release normally.
        registry.release(Some(ip), 31234, Protocol::Tcp, &a).unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_unclaimed_is_tolerated() {
        let registry = PortClaimRegistry::new(default_factory());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(registry.release(Some(ip), 31235, Protocol::Tcp, &owner("a")).is_ok());
    }

    #[tokio::test]
    async fn test_release_wrong_owner_fails() {
        let registry = PortClaimRegistry::new(default_factory());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let a = owner("a");
        let b = owner("b");

        registry.claim(Some(ip), 31236, Protocol::Udp, &a).unwrap();
        let err = registry.release(Some(ip), 31236, Protocol::Udp, &b).unwrap_err();
        assert!(matches!(err, PortError::WrongOwner { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_freed_port_can_be_rebound() {
        let registry = PortClaimRegistry::new(default_factory());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let a = owner("a");

        registry.claim(Some(ip), 31237, Protocol::Tcp, &a).unwrap();
        registry.release(Some(ip), 31237, Protocol::Tcp, &a).unwrap();
        // The placeholder is closed, so a fresh claim can bind again.
        registry.claim(Some(ip), 31237, Protocol::Tcp, &a).unwrap();
    }
}
