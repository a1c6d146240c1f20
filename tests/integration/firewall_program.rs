//! Chain topology and per-service rule-set tests

use svc_proxy::firewall::{
    self, MemoryFilterDriver, Table, INPUT_CHAIN, NODEPORT_CONTAINER_CHAIN, NODEPORT_HOST_CHAIN,
    NODEPORT_NON_LOCAL_CHAIN, OUTPUT_CHAIN, PORTALS_CONTAINER_CHAIN, PORTALS_HOST_CHAIN,
    PREROUTING_CHAIN,
};
use svc_proxy::service::Protocol;

use super::{harness, initialize, port_name, service};

#[test]
fn test_init_then_cleanup_leaves_no_trace() {
    let driver = MemoryFilterDriver::new();
    firewall::init(&driver).unwrap();

    // Exactly five owned chains with their jumps in position.
    assert!(driver.has_chain(Table::Nat, PORTALS_CONTAINER_CHAIN));
    assert!(driver.has_chain(Table::Nat, PORTALS_HOST_CHAIN));
    assert!(driver.has_chain(Table::Nat, NODEPORT_CONTAINER_CHAIN));
    assert!(driver.has_chain(Table::Nat, NODEPORT_HOST_CHAIN));
    assert!(driver.has_chain(Table::Filter, NODEPORT_NON_LOCAL_CHAIN));

    let prerouting = driver.rules(Table::Nat, PREROUTING_CHAIN);
    assert!(prerouting[0].ends_with("-j PORTALS-CONTAINER"));
    assert!(prerouting[1].ends_with("-j NODEPORT-CONTAINER"));
    let output = driver.rules(Table::Nat, OUTPUT_CHAIN);
    assert!(output[0].ends_with("-j PORTALS-HOST"));
    assert!(output[1].ends_with("-j NODEPORT-HOST"));
    assert_eq!(driver.rules(Table::Filter, INPUT_CHAIN).len(), 1);

    assert!(!firewall::cleanup_leftovers(&driver));
    assert!(!driver.has_chain(Table::Nat, PORTALS_CONTAINER_CHAIN));
    assert!(!driver.has_chain(Table::Filter, NODEPORT_NON_LOCAL_CHAIN));
    assert!(driver.rules(Table::Nat, PREROUTING_CHAIN).is_empty());
    assert!(driver.rules(Table::Nat, OUTPUT_CHAIN).is_empty());
    assert!(driver.rules(Table::Filter, INPUT_CHAIN).is_empty());
}

#[tokio::test]
async fn test_basic_merge_installs_expected_rules() {
    let h = harness();
    let web = service("web", 80, Protocol::Tcp, "10.0.0.5");
    h.proxier.on_service_add(&web);
    initialize(&h);
    h.proxier.sync_proxy_rules();

    let info = h.proxier.service_info(&port_name("web")).unwrap();
    let proxy_port = info.proxy_port();

    let container = h.driver.rules(Table::Nat, PORTALS_CONTAINER_CHAIN);
    assert_eq!(container.len(), 1);
    assert_eq!(
        container[0],
        format!(
            "-m comment --comment default/web: -p tcp -m tcp --dport 80 \
             -d 10.0.0.5/32 -j DNAT --to-destination 127.0.0.1:{proxy_port}"
        )
    );

    let host = h.driver.rules(Table::Nat, PORTALS_HOST_CHAIN);
    assert_eq!(host.len(), 1);
    assert_eq!(
        host[0],
        format!(
            "-m comment --comment default/web: -p tcp -m tcp --dport 80 \
             -d 10.0.0.5/32 -j DNAT --to-destination 127.0.0.1:{proxy_port}"
        )
    );

    // No node port declared: the node-port chains stay empty.
    assert!(h.driver.rules(Table::Nat, NODEPORT_CONTAINER_CHAIN).is_empty());
    assert!(h.driver.rules(Table::Nat, NODEPORT_HOST_CHAIN).is_empty());
    assert!(h.driver.rules(Table::Filter, NODEPORT_NON_LOCAL_CHAIN).is_empty());
}

#[tokio::test]
async fn test_full_portal_set_rule_counts() {
    let h = harness();
    let mut svc = service("kafka", 9092, Protocol::Tcp, "10.0.0.20");
    svc.external_ips = vec!["198.51.100.7".parse().unwrap()];
    svc.ports[0].node_port = 31200;
    h.proxier.on_service_add(&svc);
    initialize(&h);
    h.proxier.sync_proxy_rules();

    assert!(h.proxier.service_info(&port_name("kafka")).is_some());

    // Cluster portal: 1 container + 1 host. External portal: 2 container
    // (physdev and dst-local variants) + 1 host. Node port: one per chain.
    assert_eq!(h.driver.rules(Table::Nat, PORTALS_CONTAINER_CHAIN).len(), 3);
    assert_eq!(h.driver.rules(Table::Nat, PORTALS_HOST_CHAIN).len(), 2);
    assert_eq!(h.driver.rules(Table::Nat, NODEPORT_CONTAINER_CHAIN).len(), 1);
    assert_eq!(h.driver.rules(Table::Nat, NODEPORT_HOST_CHAIN).len(), 1);
    assert_eq!(h.driver.rules(Table::Filter, NODEPORT_NON_LOCAL_CHAIN).len(), 1);

    let container = h.driver.rules(Table::Nat, PORTALS_CONTAINER_CHAIN);
    assert!(container.iter().any(|r| r.contains("-m physdev ! --physdev-is-in")));
    assert!(container.iter().any(|r| r.contains("-m addrtype --dst-type LOCAL")));

    let non_local = &h.driver.rules(Table::Filter, NODEPORT_NON_LOCAL_CHAIN)[0];
    assert!(non_local.ends_with("-m state --state NEW -j ACCEPT"));

    // A second pass (ensure_portals) must be a no-op for the rule set.
    let before = h.driver.rule_count();
    h.proxier.sync_proxy_rules();
    assert_eq!(h.driver.rule_count(), before);
}

#[tokio::test]
async fn test_unmerge_retracts_exactly_the_service_rules() {
    let h = harness();
    let web = service("web", 80, Protocol::Tcp, "10.0.0.5");
    let dns = service("dns", 53, Protocol::Udp, "10.0.0.10");
    h.proxier.on_service_add(&web);
    h.proxier.on_service_add(&dns);
    initialize(&h);
    h.proxier.sync_proxy_rules();
    assert_eq!(h.proxier.service_count(), 2);

    h.proxier.on_service_delete(&dns);
    h.proxier.sync_proxy_rules();

    assert_eq!(h.proxier.service_count(), 1);
    let container = h.driver.rules(Table::Nat, PORTALS_CONTAINER_CHAIN);
    assert_eq!(container.len(), 1);
    assert!(container[0].contains("default/web:"));
    assert!(!container.iter().any(|r| r.contains("default/dns:")));
}
