//! svc-proxy: userspace service proxy for a cluster networking data plane
//!
//! This crate receives a stream of service and endpoint declarations from a
//! control plane and makes every declared virtual service endpoint reachable
//! on the node: it opens a local proxy listener per (service, port), installs
//! packet-filter rules that rewrite portal traffic to that listener, and
//! forwards accepted connections and datagrams to a backend chosen by a
//! pluggable load balancer.
//!
//! # Architecture
//!
//! ```text
//! Client → iptables REDIRECT/DNAT → proxy socket → LoadBalancer → Backend
//!              ▲                         ▲
//!         firewall rules            forwarding loop
//!              ▲                         ▲
//!              └──── Proxier (reconciliation pass) ────┘
//!                    ▲
//!      service/endpoint events → change tracker → sync runner
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use svc_proxy::config::ProxyConfig;
//! use svc_proxy::firewall::IptablesCmd;
//! use svc_proxy::lb::RoundRobinBalancer;
//! use svc_proxy::proxier::Proxier;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::default();
//! let proxier = Proxier::new(
//!     Arc::new(RoundRobinBalancer::new()),
//!     Arc::new(IptablesCmd::new()),
//!     &config,
//! )?;
//!
//! // Feed proxier.on_service_add(..) etc. from your event transport and
//! // run proxier.sync_loop() in the background.
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`firewall`]: Packet-filter program, rule builders, and drivers
//! - [`lb`]: Load balancer seam and the round-robin implementation
//! - [`netutil`]: Host IP discovery, local-address probing, conntrack glue
//! - [`ports`]: Proxy-port allocator and port claim registry
//! - [`proxier`]: The service reconciler and public event surface
//! - [`service`]: Service and endpoint descriptors
//! - [`socket`]: TCP/UDP proxy sockets and the UDP client cache
//! - [`sync`]: Bounded-frequency runner and service change tracker

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod firewall;
pub mod lb;
pub mod netutil;
pub mod ports;
pub mod proxier;
pub mod service;
pub mod socket;
pub mod sync;

// Re-export commonly used types at the crate root
pub use config::{load_config, ProxyConfig};
pub use error::{
    ConfigError, FirewallError, PortError, ProxySocketError, Result, ServiceProxyError,
};
pub use firewall::{cleanup_leftovers, FilterDriver, IptablesCmd, MemoryFilterDriver};
pub use lb::{LoadBalancer, LoadBalancerError, RoundRobinBalancer};
pub use ports::{PortAllocator, PortClaimRegistry, PortRange, RangePortAllocator};
pub use proxier::{Proxier, ServiceInfo};
pub use service::{
    ClientIpAffinity, EndpointPort, EndpointSpec, NamespacedName, Portal, Protocol, ServicePort,
    ServicePortName, ServiceSpec,
};
pub use socket::{ClientCache, ProxySocket, ProxySocketFactory};
pub use sync::{BoundedFrequencyRunner, ServiceChangeTracker};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
