//! TCP proxy socket
//!
//! Accepts redirected connections and splices each one to a backend chosen
//! by the load balancer. One detached task per connection; the accept loop
//! itself never blocks on a transfer.

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{splice_streams, try_connect_endpoints, ProxySocket, ACCEPT_BACKOFF};
use crate::error::{is_closed_error, is_too_many_fds_error, ProxySocketError};
use crate::lb::LoadBalancer;
use crate::proxier::ServiceInfo;
use crate::service::ServicePortName;

const LISTEN_BACKLOG: i32 = 1024;

/// TCP [`ProxySocket`]
pub struct TcpProxySocket {
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TcpProxySocket {
    /// Bind a listener on `ip:port`. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `ProxySocketError::Bind` on any socket setup failure.
    pub fn bind(ip: IpAddr, port: u16) -> Result<Self, ProxySocketError> {
        let requested = SocketAddr::new(ip, port);
        let domain = Domain::for_address(requested);
        let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;

        socket
            .set_reuse_address(true)
            .and_then(|()| socket.set_nonblocking(true))
            .and_then(|()| socket.bind(&requested.into()))
            .and_then(|()| socket.listen(LISTEN_BACKLOG))
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;

        // Safety: the fd is a freshly created, owned, listening socket.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(socket.into_raw_fd()) };
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxySocketError::bind(requested.to_string(), e.to_string()))?;

        Ok(Self {
            listener,
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl ProxySocket for TcpProxySocket {
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
        loop {
            if !info.is_alive() {
                break;
            }

            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = self.listener.accept() => result,
            };

            let (inbound, client) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if !info.is_alive() || is_closed_error(&e) {
                        break;
                    }
                    if is_too_many_fds_error(&e) {
                        error!(service = %name, error = %e, "Accept failed, backing off");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                    error!(service = %name, error = %e, "Accept failed");
                    continue;
                }
            };
            debug!(service = %name, client = %client, "Accepted TCP connection");

            let name = name.clone();
            let load_balancer = Arc::clone(load_balancer);
            tokio::spawn(async move {
                match try_connect_endpoints(&name, client, &load_balancer).await {
                    Ok(mut backend) => {
                        let mut inbound = inbound;
                        match splice_streams(&mut inbound, &mut backend).await {
                            Ok(summary) => debug!(
                                service = %name,
                                client = %client,
                                from_client = summary.from_client,
                                from_backend = summary.from_backend,
                                "Connection finished"
                            ),
                            Err(e) => debug!(service = %name, client = %client, error = %e, "Splice error"),
                        }
                    }
                    Err(e) => {
                        warn!(service = %name, client = %client, error = %e, "Failed to connect to backend");
                    }
                }
            });
        }
        info.mark_finished();
    }
}
