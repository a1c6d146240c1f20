//! Proxy sockets
//!
//! A [`ProxySocket`] is the listening endpoint for one (service, port): the
//! packet-filter rules rewrite portal traffic to its local port, and its
//! `proxy_loop` forwards everything that arrives to a backend chosen by the
//! load balancer. TCP splices streams; UDP relays datagrams through a
//! client cache with idle expiry.

pub mod client_cache;
pub mod splice;
pub mod tcp;
pub mod udp;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{is_too_many_fds_error, ProxySocketError};
use crate::lb::LoadBalancer;
use crate::proxier::ServiceInfo;
use crate::service::{Protocol, ServicePortName};

pub use client_cache::ClientCache;
pub use splice::{splice_streams, SpliceSummary};
pub use tcp::TcpProxySocket;
pub use udp::UdpProxySocket;

/// Escalating timeouts for backend dial attempts. Each failure re-asks the
/// load balancer with the session-affinity reset flag so a dead backend is
/// not re-selected for the same client.
pub const ENDPOINT_DIAL_TIMEOUTS: [Duration; 4] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// How long the accept loop backs off after file-descriptor exhaustion
/// instead of spinning on the error.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The listening endpoint for one proxied service port.
#[async_trait]
pub trait ProxySocket: Send + Sync {
    /// Local address the socket is bound to
    fn addr(&self) -> SocketAddr;

    /// Local port the socket listens on
    fn listen_port(&self) -> u16;

    /// Stop the forwarding loop and release the socket. Idempotent; the
    /// loop observes the closure as its termination signal.
    fn close(&self);

    /// Forward traffic until the socket is closed. Sets the service's
    /// `started` flag before the first accept and `finished` on exit.
    async fn proxy_loop(
        &self,
        name: &ServicePortName,
        info: &Arc<ServiceInfo>,
        load_balancer: &Arc<dyn LoadBalancer>,
    );
}

/// Constructor seam for proxy sockets, allowing test injection.
pub type ProxySocketFactory =
    Arc<dyn Fn(Protocol, IpAddr, u16) -> Result<Arc<dyn ProxySocket>, ProxySocketError> + Send + Sync>;

/// Build a real TCP or UDP proxy socket bound to `ip:port`.
///
/// # Errors
///
/// Returns `ProxySocketError::Bind` when the address cannot be bound.
pub fn make_proxy_socket(
    protocol: Protocol,
    ip: IpAddr,
    port: u16,
) -> Result<Arc<dyn ProxySocket>, ProxySocketError> {
    match protocol {
        Protocol::Tcp => Ok(Arc::new(TcpProxySocket::bind(ip, port)?)),
        Protocol::Udp => Ok(Arc::new(UdpProxySocket::bind(ip, port)?)),
    }
}

/// The default [`ProxySocketFactory`], backed by [`make_proxy_socket`].
#[must_use]
pub fn default_factory() -> ProxySocketFactory {
    Arc::new(make_proxy_socket)
}

/// Dial a backend for `client`, walking the retry ladder.
///
/// # Errors
///
/// Returns `NoEndpoint` when the load balancer has nothing to offer and
/// `Dial` when every attempt timed out or failed.
pub(crate) async fn try_connect_endpoints(
    name: &ServicePortName,
    client: SocketAddr,
    load_balancer: &Arc<dyn LoadBalancer>,
) -> Result<TcpStream, ProxySocketError> {
    let mut session_affinity_reset = false;
    let mut last_error = String::from("no dial attempted");

    for dial_timeout in ENDPOINT_DIAL_TIMEOUTS {
        let endpoint = load_balancer
            .next_endpoint(name, client, session_affinity_reset)
            .map_err(|e| ProxySocketError::NoEndpoint {
                service: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(service = %name, endpoint = %endpoint, "Mapped service to endpoint");

        match tokio::time::timeout(dial_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                if is_too_many_fds_error(&e) {
                    return Err(ProxySocketError::IoError(e));
                }
                warn!(service = %name, endpoint = %endpoint, error = %e, "Dial failed");
                last_error = e.to_string();
            }
            Err(_) => {
                warn!(service = %name, endpoint = %endpoint, "Dial timed out");
                last_error = format!("timed out after {dial_timeout:?}");
            }
        }
        session_affinity_reset = true;
    }

    Err(ProxySocketError::Dial {
        service: name.to_string(),
        reason: last_error,
    })
}
