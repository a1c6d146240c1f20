//! Reconciler lifecycle tests: merge, no-op update, conflicts, shutdown

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use svc_proxy::service::Protocol;

use super::{harness, initialize, port_name, service, TEST_RANGE_SIZE};

/// Echo server that answers one line per connection.
async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if let Ok(n) = stream.read(&mut buf).await {
                    let _ = stream.write_all(&buf[..n]).await;
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_merged_service_forwards_tcp_traffic() {
    let h = harness();
    let backend = spawn_tcp_echo().await;

    let web = service("web", 80, Protocol::Tcp, "10.0.0.5");
    h.proxier.on_service_add(&web);
    initialize(&h);
    super::set_endpoints(&h, &web, &[backend]);
    h.proxier.sync_proxy_rules();

    let info = h.proxier.service_info(&port_name("web")).unwrap();
    assert!((h.port_base..h.port_base + TEST_RANGE_SIZE).contains(&info.proxy_port()));
    assert!(info.is_started());

    // Traffic through the proxy port reaches the backend and returns.
    let mut stream = TcpStream::connect(info.socket().addr()).await.unwrap();
    stream.write_all(b"hello through the portal").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"hello through the portal");
}

#[tokio::test]
async fn test_noop_update_keeps_listener_and_rules() {
    let h = harness();
    let web = service("web", 80, Protocol::Tcp, "10.0.0.5");
    h.proxier.on_service_add(&web);
    initialize(&h);
    h.proxier.sync_proxy_rules();

    let before = h.proxier.service_info(&port_name("web")).unwrap();
    let rules_before = h.driver.rule_count();

    h.proxier.on_service_update(&web, &web);
    h.proxier.sync_proxy_rules();

    let after = h.proxier.service_info(&port_name("web")).unwrap();
    assert_eq!(before.proxy_port(), after.proxy_port());
    assert!(std::sync::Arc::ptr_eq(&before, &after));
    assert_eq!(h.driver.rule_count(), rules_before);
    assert!(!before.is_finished());
}

#[tokio::test]
async fn test_external_ip_update_adds_three_rules_one_listener() {
    use svc_proxy::firewall::{Table, PORTALS_CONTAINER_CHAIN, PORTALS_HOST_CHAIN};

    let h = harness();
    let web = service("web", 80, Protocol::Tcp, "10.0.0.5");
    h.proxier.on_service_add(&web);
    initialize(&h);
    h.proxier.sync_proxy_rules();
    let container_before = h.driver.rules(Table::Nat, PORTALS_CONTAINER_CHAIN).len();
    let host_before = h.driver.rules(Table::Nat, PORTALS_HOST_CHAIN).len();

    let mut updated = web.clone();
    updated.external_ips = vec!["198.51.100.4".parse().unwrap()];
    h.proxier.on_service_update(&web, &updated);
    h.proxier.sync_proxy_rules();

    // The config changed, so the listener reopened, but there is still
    // exactly one service entry and the external portal added 2+1 rules.
    assert_eq!(h.proxier.service_count(), 1);
    assert_eq!(
        h.driver.rules(Table::Nat, PORTALS_CONTAINER_CHAIN).len(),
        container_before + 2
    );
    assert_eq!(
        h.driver.rules(Table::Nat, PORTALS_HOST_CHAIN).len(),
        host_before + 1
    );
}

#[tokio::test]
async fn test_node_port_conflict_skips_second_service() {
    use svc_proxy::firewall::{Table, NODEPORT_CONTAINER_CHAIN};

    let h = harness();
    let mut a = service("alpha", 80, Protocol::Tcp, "10.0.0.5");
    a.ports[0].node_port = 31300;
    let mut b = service("beta", 81, Protocol::Tcp, "10.0.0.6");
    b.ports[0].node_port = 31300;

    h.proxier.on_service_add(&a);
    h.proxier.on_service_add(&b);
    initialize(&h);
    h.proxier.sync_proxy_rules();

    // One of the two wins the claim; the loser is absent entirely.
    let alpha = h.proxier.service_info(&port_name("alpha"));
    let beta = h.proxier.service_info(&port_name("beta"));
    assert_eq!(alpha.is_some() as usize + beta.is_some() as usize, 1);
    assert_eq!(h.proxier.service_count(), 1);

    let node_rules = h.driver.rules(Table::Nat, NODEPORT_CONTAINER_CHAIN);
    assert_eq!(node_rules.len(), 1);

    let (winner, loser) = if alpha.is_some() {
        ("default/alpha:", "default/beta:")
    } else {
        ("default/beta:", "default/alpha:")
    };
    assert!(node_rules[0].contains(winner));
    for chain_rules in [
        h.driver.rules(Table::Nat, NODEPORT_CONTAINER_CHAIN),
        h.driver.rules(Table::Nat, svc_proxy::firewall::PORTALS_CONTAINER_CHAIN),
    ] {
        assert!(!chain_rules.iter().any(|r| r.contains(loser)));
    }
}

#[tokio::test]
async fn test_shutdown_closes_sockets_but_keeps_rules() {
    let h = harness();
    let web = service("web", 80, Protocol::Tcp, "10.0.0.5");
    let dns = service("dns", 53, Protocol::Udp, "10.0.0.10");
    h.proxier.on_service_add(&web);
    h.proxier.on_service_add(&dns);
    initialize(&h);
    h.proxier.sync_proxy_rules();

    let web_addr = h
        .proxier
        .service_info(&port_name("web"))
        .unwrap()
        .socket()
        .addr();
    let rules_before = h.driver.rule_count();

    h.proxier.shutdown();
    assert_eq!(h.proxier.service_count(), 0);

    // Rule retraction is cleanup_leftovers' job, not shutdown's.
    assert_eq!(h.driver.rule_count(), rules_before);

    // The forwarding loops observe the closure and release the listeners.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(web_addr).await.is_err());
}

#[tokio::test]
async fn test_events_before_initialization_do_not_reconcile() {
    let h = harness();
    h.proxier.on_service_add(&service("web", 80, Protocol::Tcp, "10.0.0.5"));
    h.proxier.sync_proxy_rules();
    assert_eq!(h.proxier.service_count(), 0);

    // Once both streams sync, the queued change applies.
    initialize(&h);
    h.proxier.sync_proxy_rules();
    assert_eq!(h.proxier.service_count(), 1);
}

#[tokio::test]
async fn test_service_error_isolation() {
    // A service whose node-port claim fails must not disturb its neighbor.
    let h = harness();
    let good = service("good", 80, Protocol::Tcp, "10.0.0.5");
    let mut bad = service("bad", 81, Protocol::Tcp, "10.0.0.6");
    // Claimed out from under the proxier by "another process".
    let blocker = std::net::TcpListener::bind("0.0.0.0:31301");
    bad.ports[0].node_port = 31301;

    h.proxier.on_service_add(&good);
    h.proxier.on_service_add(&bad);
    initialize(&h);
    h.proxier.sync_proxy_rules();

    assert!(h.proxier.service_info(&port_name("good")).is_some());
    if blocker.is_ok() {
        assert!(h.proxier.service_info(&port_name("bad")).is_none());
    }
}
