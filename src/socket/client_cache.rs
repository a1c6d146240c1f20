//! UDP client cache
//!
//! Per-service table of active client datagram flows. The forwarding loop
//! inserts and looks up entries; each flow's reply pump evicts its own
//! entry once the backend read sits idle past the service timeout. There
//! is no background sweeper; cleanup is lazy per read-timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;

/// One active client flow
pub struct ClientEntry {
    /// Socket dialed to the chosen backend
    pub socket: Arc<UdpSocket>,
    /// Instant after which the flow counts as idle
    pub deadline: Instant,
}

/// Active UDP client flows for one service, keyed by client address.
#[derive(Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<SocketAddr, ClientEntry>>,
}

impl ClientCache {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend socket for `client`, if a flow is active
    #[must_use]
    pub fn get(&self, client: &SocketAddr) -> Option<Arc<UdpSocket>> {
        self.clients.lock().get(client).map(|e| Arc::clone(&e.socket))
    }

    /// Record a new flow
    pub fn insert(&self, client: SocketAddr, socket: Arc<UdpSocket>, idle: Duration) {
        self.clients.lock().insert(
            client,
            ClientEntry {
                socket,
                deadline: Instant::now() + idle,
            },
        );
    }

    /// Push the idle deadline out after traffic in either direction
    pub fn touch(&self, client: &SocketAddr, idle: Duration) {
        if let Some(entry) = self.clients.lock().get_mut(client) {
            entry.deadline = Instant::now() + idle;
        }
    }

    /// Evict `client` only while it still maps to `socket`.
    ///
    /// The reply pump calls this on idle timeout; the identity check keeps
    /// a slow pump from tearing down a successor flow that reused the same
    /// client address.
    pub fn remove_matching(&self, client: &SocketAddr, socket: &Arc<UdpSocket>) {
        let mut clients = self.clients.lock();
        if let Some(entry) = clients.get(client) {
            if Arc::ptr_eq(&entry.socket, socket) {
                clients.remove(client);
            }
        }
    }

    /// Number of active flows
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    fn client(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let cache = ClientCache::new();
        let sock = backend_socket().await;
        let addr = client(50001);

        assert!(cache.get(&addr).is_none());
        cache.insert(addr, Arc::clone(&sock), Duration::from_millis(250));
        assert!(cache.get(&addr).is_some());
        assert_eq!(cache.len(), 1);

        cache.remove_matching(&addr, &sock);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_remove_matching_spares_successor_flow() {
        let cache = ClientCache::new();
        let old = backend_socket().await;
        let new = backend_socket().await;
        let addr = client(50002);

        cache.insert(addr, Arc::clone(&old), Duration::from_millis(250));
        // The flow is replaced before the old pump wakes up.
        cache.insert(addr, Arc::clone(&new), Duration::from_millis(250));

        cache.remove_matching(&addr, &old);
        let survivor = cache.get(&addr).expect("successor flow evicted");
        assert!(Arc::ptr_eq(&survivor, &new));
    }

    #[tokio::test]
    async fn test_touch_extends_deadline() {
        let cache = ClientCache::new();
        let sock = backend_socket().await;
        let addr = client(50003);

        cache.insert(addr, sock, Duration::from_millis(100));
        let before = cache.clients.lock().get(&addr).unwrap().deadline;
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.touch(&addr, Duration::from_millis(100));
        let after = cache.clients.lock().get(&addr).unwrap().deadline;
        assert!(after > before);
    }
}
