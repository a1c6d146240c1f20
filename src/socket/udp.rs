//! UDP proxy socket
//!
//! Relays datagrams between clients and backends. Each client address gets
//! a dedicated backend socket recorded in the service's client cache; a
//! detached reply pump per flow carries responses back until the backend
//! goes idle for the service timeout, at which point the flow is evicted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{ClientCache, ProxySocket};
use crate::error::{is_closed_error, ProxySocketError};
use crate::lb::LoadBalancer;
use crate::proxier::ServiceInfo;
use crate::service::ServicePortName;

const UDP_BUFFER_SIZE: usize = 4096;

/// UDP [`ProxySocket`]
pub struct UdpProxySocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl UdpProxySocket {
    /// Bind a datagram socket on `ip:port`. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `ProxySocketError::Bind` on any socket setup failure.
    pub fn bind(ip: IpAddr, port: u16) -> Result<Self, ProxySocketError> {
        let requested = SocketAddr::new(ip, port);
        let std_socket = std::net::UdpSocket::bind(requested)
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;
        std_socket
            .set_nonblocking(true)
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }

    /// Dial a fresh backend socket for one client flow.
    async fn dial_backend(&self, endpoint: &str) -> std::io::Result<Arc<UdpSocket>> {
        let bind_addr: SocketAddr = match self.local_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(endpoint).await?;
        Ok(Arc::new(socket))
    }
}

#[async_trait]
impl ProxySocket for UdpProxySocket {
    fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn listen_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    async fn proxy_loop(
        &self,
        name: &ServicePortName,
        info: &Arc<ServiceInfo>,
        load_balancer: &Arc<dyn LoadBalancer>,
    ) {
        info.mark_started();
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            if !info.is_alive() {
                break;
            }

            let received = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => result,
            };
            let (len, client) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    if !info.is_alive() || is_closed_error(&e) {
                        break;
                    }
                    error!(service = %name, error = %e, "UDP read failed");
                    continue;
                }
            };

            let cache = info.active_clients();
            let backend = match cache.get(&client) {
                Some(existing) => existing,
                None => {
                    let endpoint = match load_balancer.next_endpoint(name, client, false) {
                        Ok(endpoint) => endpoint,
                        Err(e) => {
                            debug!(service = %name, client = %client, error = %e, "Couldn't find an endpoint");
                            continue;
                        }
                    };
                    debug!(service = %name, client = %client, endpoint = %endpoint, "Opened UDP flow");
                    let backend = match self.dial_backend(&endpoint).await {
                        Ok(socket) => socket,
                        Err(e) => {
                            warn!(service = %name, endpoint = %endpoint, error = %e, "Failed to dial backend");
                            continue;
                        }
                    };
                    cache.insert(client, Arc::clone(&backend), info.timeout());
                    tokio::spawn(reply_pump(
                        Arc::clone(&self.socket),
                        Arc::clone(&backend),
                        client,
                        Arc::clone(cache),
                        info.timeout(),
                    ));
                    backend
                }
            };

            match backend.send(&buf[..len]).await {
                Ok(_) => cache.touch(&client, info.timeout()),
                Err(e) => {
                    warn!(service = %name, client = %client, error = %e, "Forward to backend failed");
                    cache.remove_matching(&client, &backend);
                }
            }
        }
        info.mark_finished();
    }
}

/// Carry backend replies to `client` until the flow sits idle for
/// `timeout`, then evict it and close the backend socket.
async fn reply_pump(
    listener: Arc<UdpSocket>,
    backend: Arc<UdpSocket>,
    client: SocketAddr,
    cache: Arc<ClientCache>,
    timeout: Duration,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        match tokio::time::timeout(timeout, backend.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                if let Err(e) = listener.send_to(&buf[..len], client).await {
                    debug!(client = %client, error = %e, "Reply send failed");
                    break;
                }
                cache.touch(&client, timeout);
            }
            Ok(Err(e)) => {
                debug!(client = %client, error = %e, "Backend read failed");
                break;
            }
            Err(_) => {
                debug!(client = %client, "Connection to endpoint closed due to inactivity");
                break;
            }
        }
    }
    // Dropping the last reference closes the backend socket.
    cache.remove_matching(&client, &backend);
}
