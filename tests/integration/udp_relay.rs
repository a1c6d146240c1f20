//! UDP relay tests: forwarding, reply pumping, and idle expiry

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use svc_proxy::service::Protocol;

use super::{harness_with_udp_timeout, initialize, port_name, service, set_endpoints};

/// UDP echo server that reports each peer it hears from.
async fn spawn_udp_echo() -> (SocketAddr, mpsc::UnboundedReceiver<SocketAddr>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = tx.send(peer);
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    (addr, rx)
}

async fn exchange(client: &UdpSocket, proxy: SocketAddr, payload: &[u8]) -> Vec<u8> {
    client.send_to(payload, proxy).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("no reply within deadline")
        .unwrap();
    assert_eq!(from, proxy);
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_udp_datagrams_relay_both_ways() {
    let h = harness_with_udp_timeout(Duration::from_millis(500));
    let (backend, _peers) = spawn_udp_echo().await;

    let dns = service("dns", 53, Protocol::Udp, "10.0.0.10");
    h.proxier.on_service_add(&dns);
    initialize(&h);
    set_endpoints(&h, &dns, &[backend]);
    h.proxier.sync_proxy_rules();

    let info = h.proxier.service_info(&port_name("dns")).unwrap();
    let proxy = info.socket().addr();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply = exchange(&client, proxy, b"query").await;
    assert_eq!(reply, b"query");

    // One active flow for this client.
    assert_eq!(info.active_clients().len(), 1);

    // The same flow serves a second datagram.
    let reply = exchange(&client, proxy, b"again").await;
    assert_eq!(reply, b"again");
    assert_eq!(info.active_clients().len(), 1);
}

#[tokio::test]
async fn test_idle_timeout_evicts_flow_and_redials() {
    let idle = Duration::from_millis(300);
    let h = harness_with_udp_timeout(idle);
    let (backend, mut peers) = spawn_udp_echo().await;

    let dns = service("dns", 53, Protocol::Udp, "10.0.0.10");
    h.proxier.on_service_add(&dns);
    initialize(&h);
    set_endpoints(&h, &dns, &[backend]);
    h.proxier.sync_proxy_rules();

    let info = h.proxier.service_info(&port_name("dns")).unwrap();
    let proxy = info.socket().addr();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply = exchange(&client, proxy, b"first").await;
    assert_eq!(reply, b"first");
    let first_backend_peer = peers.recv().await.unwrap();
    assert_eq!(info.active_clients().len(), 1);

    // Sleep past the idle timeout: the reply pump evicts the flow and
    // closes the backend socket.
    tokio::time::sleep(idle + Duration::from_millis(400)).await;
    assert!(info.active_clients().is_empty());

    // The next datagram opens a fresh flow with a new ephemeral source.
    let reply = exchange(&client, proxy, b"second").await;
    assert_eq!(reply, b"second");
    let second_backend_peer = peers.recv().await.unwrap();
    assert_ne!(first_backend_peer, second_backend_peer);
    assert_eq!(info.active_clients().len(), 1);
}

#[tokio::test]
async fn test_two_clients_two_flows() {
    let h = harness_with_udp_timeout(Duration::from_millis(500));
    let (backend, mut peers) = spawn_udp_echo().await;

    let dns = service("dns", 53, Protocol::Udp, "10.0.0.10");
    h.proxier.on_service_add(&dns);
    initialize(&h);
    set_endpoints(&h, &dns, &[backend]);
    h.proxier.sync_proxy_rules();

    let info = h.proxier.service_info(&port_name("dns")).unwrap();
    let proxy = info.socket().addr();

    let one = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let two = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(exchange(&one, proxy, b"one").await, b"one");
    assert_eq!(exchange(&two, proxy, b"two").await, b"two");

    assert_eq!(info.active_clients().len(), 2);
    let p1 = peers.recv().await.unwrap();
    let p2 = peers.recv().await.unwrap();
    assert_ne!(p1, p2);

    // Flows are independent Arc-held sockets.
    let s1 = info
        .active_clients()
        .get(&one.local_addr().unwrap())
        .unwrap();
    let s2 = info
        .active_clients()
        .get(&two.local_addr().unwrap())
        .unwrap();
    assert!(!Arc::ptr_eq(&s1, &s2));
}
