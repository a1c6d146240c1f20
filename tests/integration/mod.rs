//! Integration tests for svc-proxy
//!
//! These drive the proxier end to end: real sockets on loopback, the
//! in-memory packet-filter driver, and the round-robin load balancer.
//!
//! # Test Organization
//!
//! - `firewall_program`: chain topology install/cleanup and per-service rule sets
//! - `reconcile`: merge/unmerge lifecycle, no-op updates, conflicts, shutdown
//! - `udp_relay`: datagram forwarding and client-cache idle expiry

pub mod firewall_program;
pub mod reconcile;
pub mod udp_relay;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use svc_proxy::firewall::MemoryFilterDriver;
use svc_proxy::lb::RoundRobinBalancer;
use svc_proxy::ports::{PortRange, RangePortAllocator};
use svc_proxy::proxier::Proxier;
use svc_proxy::service::{
    EndpointPort, EndpointSpec, Protocol, ServicePort, ServicePortName, ServiceSpec,
};
use svc_proxy::socket::make_proxy_socket;

/// Size of the per-test proxy-port slice
pub const TEST_RANGE_SIZE: u16 = 50;

/// Each harness gets its own port slice; tests run in parallel and must
/// not fight over listener ports.
static NEXT_PORT_BASE: AtomicU16 = AtomicU16::new(51000);

pub struct TestHarness {
    pub proxier: Arc<Proxier>,
    pub driver: Arc<MemoryFilterDriver>,
    pub port_base: u16,
}

/// Build a proxier on loopback with injectable state visible to tests.
pub fn harness_with_udp_timeout(udp_idle_timeout: Duration) -> TestHarness {
    let driver = Arc::new(MemoryFilterDriver::new());
    let listen_ip: IpAddr = "127.0.0.1".parse().unwrap();
    let port_base = NEXT_PORT_BASE.fetch_add(TEST_RANGE_SIZE, Ordering::SeqCst);
    let proxier = Proxier::with_parts(
        Arc::new(RoundRobinBalancer::new()),
        driver.clone(),
        listen_ip,
        listen_ip,
        Arc::new(RangePortAllocator::new(PortRange::new(
            port_base,
            TEST_RANGE_SIZE,
        ))),
        Arc::new(make_proxy_socket),
        Duration::from_secs(30),
        Duration::from_millis(10),
        udp_idle_timeout,
    )
    .unwrap();
    TestHarness {
        proxier,
        driver,
        port_base,
    }
}

pub fn harness() -> TestHarness {
    harness_with_udp_timeout(Duration::from_millis(250))
}

/// Mark both streams synced so reconciliation is unlocked.
pub fn initialize(harness: &TestHarness) {
    harness.proxier.on_service_synced();
    harness.proxier.on_endpoints_synced();
}

pub fn service(name: &str, port: u16, protocol: Protocol, cluster_ip: &str) -> ServiceSpec {
    ServiceSpec {
        namespace: "default".into(),
        name: name.into(),
        ports: vec![ServicePort {
            name: String::new(),
            port,
            node_port: 0,
            protocol,
        }],
        cluster_ips: vec![cluster_ip.parse().unwrap()],
        external_ips: vec![],
        load_balancer_ips: vec![],
        headless: false,
        session_affinity: None,
    }
}

pub fn port_name(name: &str) -> ServicePortName {
    ServicePortName::new("default", name, "")
}

/// Register backend targets for a service's unnamed port.
pub fn set_endpoints(harness: &TestHarness, spec: &ServiceSpec, targets: &[std::net::SocketAddr]) {
    let endpoints = EndpointSpec {
        namespace: spec.namespace.clone(),
        name: spec.name.clone(),
        ports: vec![EndpointPort {
            name: String::new(),
            targets: targets.to_vec(),
        }],
    };
    harness.proxier.on_endpoints_add(&endpoints, spec);
}
