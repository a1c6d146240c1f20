//! Packet-filter program
//!
//! Declares the fixed chain topology and installs or retracts the jump
//! rules that route portal and node-port traffic into it. The per-service
//! redirect rules themselves are built in [`rules`] and installed by the
//! reconciler.
//!
//! Rule ordering is a correctness requirement, not a tuning knob: portal
//! rules must match before node-port rules. Some environments categorize a
//! load-balancer ingress IP as LOCAL; if the node-port chains ran first and
//! that IP's port collided with a node port, the wrong service would win.

pub mod driver;
pub mod rules;

use tracing::error;

use crate::error::{FirewallError, ServiceProxyError};

pub use driver::{Chain, FilterDriver, IptablesCmd, MemoryFilterDriver, RulePosition, Table};

/// NAT chain for portal traffic arriving from containers
pub const PORTALS_CONTAINER_CHAIN: Chain = Chain("PORTALS-CONTAINER");
/// NAT chain for portal traffic generated on the host
pub const PORTALS_HOST_CHAIN: Chain = Chain("PORTALS-HOST");
/// NAT chain for node-port traffic arriving from containers
pub const NODEPORT_CONTAINER_CHAIN: Chain = Chain("NODEPORT-CONTAINER");
/// NAT chain for node-port traffic generated on the host
pub const NODEPORT_HOST_CHAIN: Chain = Chain("NODEPORT-HOST");
/// Filter chain admitting redirected non-local node-port traffic
pub const NODEPORT_NON_LOCAL_CHAIN: Chain = Chain("NODEPORT-NON-LOCAL");

/// Built-in kernel entry points
pub const PREROUTING_CHAIN: Chain = Chain("PREROUTING");
pub const OUTPUT_CHAIN: Chain = Chain("OUTPUT");
pub const INPUT_CHAIN: Chain = Chain("INPUT");

// The jump comments double as deletion match keys in cleanup_leftovers and
// must never drift from what was installed.
const PORTALS_COMMENT: &str = "handle ClusterIPs; NOTE: this must be before the NodePort rules";
const NODEPORT_COMMENT: &str = "handle service NodePorts; NOTE: this must be the last rule in the chain";
const NON_LOCAL_COMMENT: &str = "Ensure that non-local NodePort traffic can flow";

fn portals_jump_args(target: Chain) -> Vec<String> {
    vec![
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        PORTALS_COMMENT.into(),
        "-j".into(),
        target.0.into(),
    ]
}

fn node_port_jump_args(target: Chain) -> Vec<String> {
    vec![
        "-m".into(),
        "addrtype".into(),
        "--dst-type".into(),
        "LOCAL".into(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        NODEPORT_COMMENT.into(),
        "-j".into(),
        target.0.into(),
    ]
}

fn non_local_jump_args(target: Chain) -> Vec<String> {
    vec![
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        NON_LOCAL_COMMENT.into(),
        "-j".into(),
        target.0.into(),
    ]
}

/// The five (table, chain) pairs owned by the proxy, NAT first.
const OWNED_CHAINS: [(Table, Chain); 5] = [
    (Table::Nat, PORTALS_CONTAINER_CHAIN),
    (Table::Nat, PORTALS_HOST_CHAIN),
    (Table::Nat, NODEPORT_CONTAINER_CHAIN),
    (Table::Nat, NODEPORT_HOST_CHAIN),
    (Table::Filter, NODEPORT_NON_LOCAL_CHAIN),
];

/// Ensure the chain topology exists. Safe to call on every sync.
///
/// The portal jumps are prepended so they run before anything else in
/// PREROUTING/OUTPUT; the node-port jumps are appended so they run after
/// the portal jumps (see the module comment for why that order matters).
///
/// # Errors
///
/// Returns the first driver error; partial topology is healed on the next
/// call.
pub fn init(driver: &dyn FilterDriver) -> Result<(), FirewallError> {
    driver.ensure_chain(Table::Nat, PORTALS_CONTAINER_CHAIN)?;
    driver.ensure_rule(
        RulePosition::Prepend,
        Table::Nat,
        PREROUTING_CHAIN,
        &portals_jump_args(PORTALS_CONTAINER_CHAIN),
    )?;
    driver.ensure_chain(Table::Nat, PORTALS_HOST_CHAIN)?;
    driver.ensure_rule(
        RulePosition::Prepend,
        Table::Nat,
        OUTPUT_CHAIN,
        &portals_jump_args(PORTALS_HOST_CHAIN),
    )?;

    driver.ensure_chain(Table::Nat, NODEPORT_CONTAINER_CHAIN)?;
    driver.ensure_rule(
        RulePosition::Append,
        Table::Nat,
        PREROUTING_CHAIN,
        &node_port_jump_args(NODEPORT_CONTAINER_CHAIN),
    )?;
    driver.ensure_chain(Table::Nat, NODEPORT_HOST_CHAIN)?;
    driver.ensure_rule(
        RulePosition::Append,
        Table::Nat,
        OUTPUT_CHAIN,
        &node_port_jump_args(NODEPORT_HOST_CHAIN),
    )?;

    driver.ensure_chain(Table::Filter, NODEPORT_NON_LOCAL_CHAIN)?;
    driver.ensure_rule(
        RulePosition::Prepend,
        Table::Filter,
        INPUT_CHAIN,
        &non_local_jump_args(NODEPORT_NON_LOCAL_CHAIN),
    )?;

    Ok(())
}

/// Flush every owned chain. Run once at construction: any redirect rules
/// surviving a restart point at proxy ports that are no longer bound.
///
/// # Errors
///
/// Returns an aggregate of the individual flush failures; every chain is
/// still attempted.
pub fn flush_chains(driver: &dyn FilterDriver) -> Result<(), ServiceProxyError> {
    let mut errors = Vec::new();
    for (table, chain) in OWNED_CHAINS {
        if let Err(e) = driver.flush_chain(table, chain) {
            errors.push(ServiceProxyError::Firewall(e));
        }
    }
    ServiceProxyError::aggregate(errors)
}

/// Remove everything the proxy ever installed: the five jump rules, then
/// (flush + delete) each owned chain. This is the authoritative retraction;
/// per-service rule removal elsewhere is an optimization on top of it.
///
/// Returns true if any non-tolerated error was encountered. Not-found
/// errors are expected (nothing may be installed) and ignored.
pub fn cleanup_leftovers(driver: &dyn FilterDriver) -> bool {
    let mut encountered_error = false;

    let jumps: [(Table, Chain, Vec<String>); 5] = [
        (
            Table::Nat,
            PREROUTING_CHAIN,
            portals_jump_args(PORTALS_CONTAINER_CHAIN),
        ),
        (Table::Nat, OUTPUT_CHAIN, portals_jump_args(PORTALS_HOST_CHAIN)),
        (
            Table::Nat,
            PREROUTING_CHAIN,
            node_port_jump_args(NODEPORT_CONTAINER_CHAIN),
        ),
        (
            Table::Nat,
            OUTPUT_CHAIN,
            node_port_jump_args(NODEPORT_HOST_CHAIN),
        ),
        (
            Table::Filter,
            INPUT_CHAIN,
            non_local_jump_args(NODEPORT_NON_LOCAL_CHAIN),
        ),
    ];
    for (table, chain, args) in jumps {
        if let Err(e) = driver.delete_rule(table, chain, &args) {
            if !e.is_not_found() {
                error!(table = %table, chain = %chain, error = %e, "Error removing jump rule");
                encountered_error = true;
            }
        }
    }

    for (table, chain) in OWNED_CHAINS {
        // Flush first; a delete against a non-empty chain would fail anyway.
        match driver.flush_chain(table, chain) {
            Err(e) if !e.is_not_found() => {
                error!(table = %table, chain = %chain, error = %e, "Error flushing chain");
                encountered_error = true;
            }
            Err(_) => {}
            Ok(()) => {
                if let Err(e) = driver.delete_chain(table, chain) {
                    if !e.is_not_found() {
                        error!(table = %table, chain = %chain, error = %e, "Error deleting chain");
                        encountered_error = true;
                    }
                }
            }
        }
    }

    encountered_error
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_builds_topology() {
        let driver = MemoryFilterDriver::new();
        init(&driver).unwrap();

        for (table, chain) in OWNED_CHAINS {
            assert!(driver.has_chain(table, chain), "missing {chain}");
        }

        let prerouting = driver.rules(Table::Nat, PREROUTING_CHAIN);
        assert_eq!(prerouting.len(), 2);
        // Portal jump was prepended, node-port jump appended after it.
        assert!(prerouting[0].contains("-j PORTALS-CONTAINER"));
        assert!(prerouting[1].contains("-j NODEPORT-CONTAINER"));
        assert!(prerouting[1].contains("--dst-type LOCAL"));

        let output = driver.rules(Table::Nat, OUTPUT_CHAIN);
        assert!(output[0].contains("-j PORTALS-HOST"));
        assert!(output[1].contains("-j NODEPORT-HOST"));

        let input = driver.rules(Table::Filter, INPUT_CHAIN);
        assert!(input[0].contains("-j NODEPORT-NON-LOCAL"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let driver = MemoryFilterDriver::new();
        init(&driver).unwrap();
        let count = driver.rule_count();
        init(&driver).unwrap();
        assert_eq!(driver.rule_count(), count);
    }

    #[test]
    fn test_cleanup_leftovers_removes_everything() {
        let driver = MemoryFilterDriver::new();
        init(&driver).unwrap();

        assert!(!cleanup_leftovers(&driver));

        for (table, chain) in OWNED_CHAINS {
            assert!(!driver.has_chain(table, chain), "{chain} survived cleanup");
        }
        assert!(driver.rules(Table::Nat, PREROUTING_CHAIN).is_empty());
        assert!(driver.rules(Table::Nat, OUTPUT_CHAIN).is_empty());
        assert!(driver.rules(Table::Filter, INPUT_CHAIN).is_empty());
    }

    #[test]
    fn test_cleanup_on_clean_host_is_quiet() {
        // Nothing installed: every delete is a tolerated not-found.
        let driver = MemoryFilterDriver::new();
        assert!(!cleanup_leftovers(&driver));
    }

    #[test]
    fn test_flush_chains_clears_rules_but_keeps_topology() {
        let driver = MemoryFilterDriver::new();
        init(&driver).unwrap();
        driver
            .ensure_rule(
                RulePosition::Append,
                Table::Nat,
                PORTALS_CONTAINER_CHAIN,
                &["-j".to_string(), "ACCEPT".to_string()],
            )
            .unwrap();

        flush_chains(&driver).unwrap();
        assert!(driver.rules(Table::Nat, PORTALS_CONTAINER_CHAIN).is_empty());
        assert!(driver.has_chain(Table::Nat, PORTALS_CONTAINER_CHAIN));
        // The jumps from the built-in chains stay.
        assert_eq!(driver.rules(Table::Nat, PREROUTING_CHAIN).len(), 2);
    }
}
