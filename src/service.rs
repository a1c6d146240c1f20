//! Service and endpoint descriptors
//!
//! These are the declarative inputs the proxy consumes from its control
//! plane. A [`ServiceSpec`] describes the virtual addresses a service should
//! be reachable at; an [`EndpointSpec`] describes where its backends live.
//! [`ServicePortName`] is the unique key for everything the proxy installs.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP stream proxying
    Tcp,
    /// UDP datagram relay
    Udp,
}

impl Protocol {
    /// Lowercase name as used in packet-filter rule arguments
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace-qualified service name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The unique key for one proxied service port: (namespace, name, port-name).
///
/// The display form `namespace/name:port` is written into packet-filter rule
/// comments and is matched byte-for-byte on deletion, so the trailing colon
/// for unnamed ports is deliberate and load-bearing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    pub port: String,
}

impl ServicePortName {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port: port.into(),
        }
    }

    /// The namespace/name pair without the port qualifier
    #[must_use]
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

/// A virtual (ip, port) a service is reachable at.
///
/// `is_external` is true when packets addressed to this portal may have
/// originated off-host, which changes the redirect rules emitted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Portal {
    pub ip: IpAddr,
    pub port: u16,
    pub is_external: bool,
}

/// One declared port of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port name; empty for single-port services
    #[serde(default)]
    pub name: String,
    /// The service (cluster) port
    pub port: u16,
    /// Cluster-wide node port; 0 = none
    #[serde(default)]
    pub node_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

/// Client-IP session affinity configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIpAffinity {
    /// Seconds a client sticks to its endpoint; 0 = use the default
    #[serde(default)]
    pub timeout_seconds: u32,
}

/// A declarative service description from the control plane.
///
/// Deep equality on this type is what the change tracker uses to collapse
/// no-op update batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub namespace: String,
    pub name: String,
    pub ports: Vec<ServicePort>,
    /// Stable virtual IPs; the first IPv4 entry is the primary portal address
    #[serde(default)]
    pub cluster_ips: Vec<IpAddr>,
    #[serde(default)]
    pub external_ips: Vec<IpAddr>,
    #[serde(default)]
    pub load_balancer_ips: Vec<IpAddr>,
    /// Headless services get no portals at all
    #[serde(default)]
    pub headless: bool,
    #[serde(default)]
    pub session_affinity: Option<ClientIpAffinity>,
}

impl ServiceSpec {
    /// The namespace/name key used by the change tracker
    #[must_use]
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }

    /// Whether the proxy should ignore this service entirely
    #[must_use]
    pub fn should_skip(&self) -> bool {
        self.headless || self.cluster_ips.is_empty()
    }

    /// The primary cluster IP. IPv4 wins when both families are declared;
    /// IPv6 redirection is best-effort.
    #[must_use]
    pub fn cluster_ip(&self) -> Option<IpAddr> {
        self.cluster_ips
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.cluster_ips.first())
            .copied()
    }
}

/// Backends for one named port of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    pub targets: Vec<SocketAddr>,
}

/// A declarative endpoint description, opaque to the proxy itself and
/// forwarded to the load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub namespace: String,
    pub name: String,
    pub ports: Vec<EndpointPort>,
}

impl EndpointSpec {
    #[must_use]
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}
