//! Packet-filter driver
//!
//! The [`FilterDriver`] trait is the seam between the rule program and the
//! kernel utility. [`IptablesCmd`] shells out to `iptables`;
//! [`MemoryFilterDriver`] keeps the would-be kernel state in process for
//! tests and dry runs.

use std::collections::HashMap;
use std::fmt;
use std::process::Command;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::FirewallError;

/// Kernel table a chain lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Filter => "filter",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chain name. Only process-wide literals are ever used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chain(pub &'static str);

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Where `ensure_rule` puts a rule that does not exist yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    /// Insert at position 1 (`-I`)
    Prepend,
    /// Append at the end (`-A`)
    Append,
}

/// Driver seam over the kernel packet-filter utility.
///
/// `ensure_*` operations are idempotent and report whether the object
/// already existed. Rule arguments must be passed in their canonical
/// `iptables-save` order; drivers may match rules textually.
pub trait FilterDriver: Send + Sync {
    /// Ensure `chain` exists in `table`; returns true if it already did.
    fn ensure_chain(&self, table: Table, chain: Chain) -> Result<bool, FirewallError>;

    /// Ensure a rule with exactly `args` exists in `chain`; returns true if
    /// it already did.
    fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<bool, FirewallError>;

    /// Delete the rule with exactly `args` from `chain`.
    fn delete_rule(&self, table: Table, chain: Chain, args: &[String]) -> Result<(), FirewallError>;

    /// Remove every rule from `chain`.
    fn flush_chain(&self, table: Table, chain: Chain) -> Result<(), FirewallError>;

    /// Delete `chain` itself. Fails while rules still reference it.
    fn delete_chain(&self, table: Table, chain: Chain) -> Result<(), FirewallError>;
}

/// `FilterDriver` backed by the `iptables` binary.
pub struct IptablesCmd {
    program: String,
}

impl IptablesCmd {
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "iptables".into(),
        }
    }

    /// Use an alternative binary (`ip6tables`, `iptables-legacy`).
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run the utility; Ok(()) on exit 0, classified error otherwise.
    fn run(&self, args: &[String]) -> Result<(), FirewallError> {
        trace!(program = %self.program, args = %args.join(" "), "Running filter command");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| FirewallError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_not_found_message(&stderr) {
            return Err(FirewallError::NotFound(stderr));
        }
        Err(FirewallError::command_failed(&self.program, args, stderr))
    }

    fn base_args(table: Table, op: &str, chain: Chain) -> Vec<String> {
        vec![
            "-t".into(),
            table.as_str().into(),
            op.into(),
            chain.0.into(),
        ]
    }
}

impl Default for IptablesCmd {
    fn default() -> Self {
        Self::new()
    }
}

/// stderr shapes the various iptables generations use for missing objects
fn is_not_found_message(stderr: &str) -> bool {
    stderr.contains("No chain/target/match by that name")
        || stderr.contains("Bad rule (does a matching rule exist in that chain?)")
        || stderr.contains("does not exist")
        || stderr.contains("doesn't exist")
}

impl FilterDriver for IptablesCmd {
    fn ensure_chain(&self, table: Table, chain: Chain) -> Result<bool, FirewallError> {
        match self.run(&Self::base_args(table, "-N", chain)) {
            Ok(()) => Ok(false),
            Err(FirewallError::CommandFailed { stderr, .. })
                if stderr.contains("Chain already exists") =>
            {
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<bool, FirewallError> {
        let mut check = Self::base_args(table, "-C", chain);
        check.extend_from_slice(args);
        match self.run(&check) {
            Ok(()) => return Ok(true),
            // A missing rule surfaces as "Bad rule ..." (not-found class) on
            // current generations and as a plain failure on older ones.
            Err(FirewallError::NotFound(_) | FirewallError::CommandFailed { .. }) => {}
            Err(e) => return Err(e),
        }

        let op = match position {
            RulePosition::Prepend => "-I",
            RulePosition::Append => "-A",
        };
        let mut insert = Self::base_args(table, op, chain);
        insert.extend_from_slice(args);
        self.run(&insert)?;
        Ok(false)
    }

    fn delete_rule(&self, table: Table, chain: Chain, args: &[String]) -> Result<(), FirewallError> {
        let mut delete = Self::base_args(table, "-D", chain);
        delete.extend_from_slice(args);
        self.run(&delete)
    }

    fn flush_chain(&self, table: Table, chain: Chain) -> Result<(), FirewallError> {
        self.run(&Self::base_args(table, "-F", chain))
    }

    fn delete_chain(&self, table: Table, chain: Chain) -> Result<(), FirewallError> {
        self.run(&Self::base_args(table, "-X", chain))
    }
}

/// In-memory `FilterDriver` for tests and dry runs.
///
/// Chains hold their rules as joined argument strings in insertion order.
/// Built-in chains (PREROUTING, OUTPUT, INPUT) are implicit: a rule landing
/// in an unknown chain creates it, mirroring the kernel's always-present
/// entry points.
#[derive(Default)]
pub struct MemoryFilterDriver {
    state: Mutex<HashMap<(Table, &'static str), Vec<String>>>,
}

impl MemoryFilterDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules currently in `chain`, in match order
    #[must_use]
    pub fn rules(&self, table: Table, chain: Chain) -> Vec<String> {
        self.state
            .lock()
            .get(&(table, chain.0))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `chain` exists (was ensured or received a rule)
    #[must_use]
    pub fn has_chain(&self, table: Table, chain: Chain) -> bool {
        self.state.lock().contains_key(&(table, chain.0))
    }

    /// Total number of rules across all chains
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.state.lock().values().map(Vec::len).sum()
    }
}

impl FilterDriver for MemoryFilterDriver {
    fn ensure_chain(&self, table: Table, chain: Chain) -> Result<bool, FirewallError> {
        let mut state = self.state.lock();
        let existed = state.contains_key(&(table, chain.0));
        state.entry((table, chain.0)).or_default();
        Ok(existed)
    }

    fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<bool, FirewallError> {
        let rule = args.join(" ");
        let mut state = self.state.lock();
        let rules = state.entry((table, chain.0)).or_default();
        if rules.contains(&rule) {
            return Ok(true);
        }
        match position {
            RulePosition::Prepend => rules.insert(0, rule),
            RulePosition::Append => rules.push(rule),
        }
        Ok(false)
    }

    fn delete_rule(&self, table: Table, chain: Chain, args: &[String]) -> Result<(), FirewallError> {
        let rule = args.join(" ");
        let mut state = self.state.lock();
        let Some(rules) = state.get_mut(&(table, chain.0)) else {
            return Err(FirewallError::NotFound(format!("chain {chain}")));
        };
        let Some(pos) = rules.iter().position(|r| *r == rule) else {
            return Err(FirewallError::NotFound(format!("rule in {chain}: {rule}")));
        };
        rules.remove(pos);
        Ok(())
    }

    fn flush_chain(&self, table: Table, chain: Chain) -> Result<(), FirewallError> {
        let mut state = self.state.lock();
        match state.get_mut(&(table, chain.0)) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(FirewallError::NotFound(format!("chain {chain}"))),
        }
    }

    fn delete_chain(&self, table: Table, chain: Chain) -> Result<(), FirewallError> {
        let mut state = self.state.lock();
        match state.remove(&(table, chain.0)) {
            Some(_) => Ok(()),
            None => Err(FirewallError::NotFound(format!("chain {chain}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CHAIN: Chain = Chain("TEST-CHAIN");

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| (*a).to_string()).collect()
    }

    #[test]
    fn test_memory_driver_rule_lifecycle() {
        let driver = MemoryFilterDriver::new();
        assert!(!driver.ensure_chain(Table::Nat, TEST_CHAIN).unwrap());
        assert!(driver.ensure_chain(Table::Nat, TEST_CHAIN).unwrap());

        let rule = args(&["-p", "tcp", "--dport", "80", "-j", "ACCEPT"]);
        assert!(!driver
            .ensure_rule(RulePosition::Append, Table::Nat, TEST_CHAIN, &rule)
            .unwrap());
        assert!(driver
            .ensure_rule(RulePosition::Append, Table::Nat, TEST_CHAIN, &rule)
            .unwrap());
        assert_eq!(driver.rules(Table::Nat, TEST_CHAIN).len(), 1);

        driver.delete_rule(Table::Nat, TEST_CHAIN, &rule).unwrap();
        let err = driver.delete_rule(Table::Nat, TEST_CHAIN, &rule).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_memory_driver_prepend_ordering() {
        let driver = MemoryFilterDriver::new();
        driver
            .ensure_rule(RulePosition::Append, Table::Nat, TEST_CHAIN, &args(&["first"]))
            .unwrap();
        driver
            .ensure_rule(RulePosition::Prepend, Table::Nat, TEST_CHAIN, &args(&["second"]))
            .unwrap();
        assert_eq!(driver.rules(Table::Nat, TEST_CHAIN), vec!["second", "first"]);
    }

    #[test]
    fn test_memory_driver_chain_removal() {
        let driver = MemoryFilterDriver::new();
        driver.ensure_chain(Table::Filter, TEST_CHAIN).unwrap();
        driver.flush_chain(Table::Filter, TEST_CHAIN).unwrap();
        driver.delete_chain(Table::Filter, TEST_CHAIN).unwrap();
        assert!(!driver.has_chain(Table::Filter, TEST_CHAIN));
        assert!(driver.delete_chain(Table::Filter, TEST_CHAIN).unwrap_err().is_not_found());
    }

    #[test]
    fn test_not_found_message_classifier() {
        assert!(is_not_found_message(
            "iptables: No chain/target/match by that name."
        ));
        assert!(is_not_found_message(
            "iptables: Bad rule (does a matching rule exist in that chain?)."
        ));
        assert!(is_not_found_message("Chain `FOO' does not exist."));
        assert!(!is_not_found_message("iptables: Permission denied."));
    }

    #[test]
    fn test_tables_and_chains_display() {
        assert_eq!(Table::Nat.to_string(), "nat");
        assert_eq!(Table::Filter.to_string(), "filter");
        assert_eq!(TEST_CHAIN.to_string(), "TEST-CHAIN");
    }
}
