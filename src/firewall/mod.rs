//! Packet-filter state management
//!
//! `PacketFilter` is the narrow command interface the compiler depends on.
//! Failures are soft: every mutating call reports `false` and logs, so a
//! teardown can carry on after a single failed delete.

pub mod compiler;
pub mod iptables;
pub mod memory;

use async_trait::async_trait;
use std::fmt;

use crate::error::{GateError, GateResult};

pub use compiler::FirewallCompiler;
pub use iptables::Iptables;
pub use memory::MemoryFilter;

/// Chain/rule operations of a packet-filter engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Every chain of a table, built-in chains included
    async fn list_chains(&self, table: &str) -> Vec<String>;

    /// Rules of a chain as argument lists, in evaluation order
    async fn list_rules(&self, table: &str, chain: &str) -> Vec<Vec<String>>;

    async fn create_chain(&self, table: &str, chain: &str) -> bool;

    /// Delete an empty, unreferenced chain
    async fn delete_chain(&self, table: &str, chain: &str) -> bool;

    async fn flush_chain(&self, table: &str, chain: &str) -> bool;

    async fn append_rule(&self, table: &str, chain: &str, args: &[String]) -> bool;

    async fn insert_rule(&self, table: &str, chain: &str, args: &[String]) -> bool;

    /// Delete the first matching rule
    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> bool;

    async fn rule_exists(&self, table: &str, chain: &str, args: &[String]) -> bool;
}

pub async fn chain_exists(filter: &dyn PacketFilter, table: &str, chain: &str) -> bool {
    filter.list_chains(table).await.iter().any(|c| c == chain)
}

/// Create a chain unless it already exists
pub async fn ensure_chain(filter: &dyn PacketFilter, table: &str, chain: &str) -> bool {
    chain_exists(filter, table, chain).await || filter.create_chain(table, chain).await
}

/// Append a rule only if an identical one is not already present
pub async fn append_unique(filter: &dyn PacketFilter, table: &str, chain: &str, args: &[String]) -> bool {
    if filter.rule_exists(table, chain, args).await {
        return true;
    }
    filter.append_rule(table, chain, args).await
}

/// Rules in any chain of the table that jump to `target`, as (chain, args)
pub async fn chain_targets(filter: &dyn PacketFilter, table: &str, target: &str) -> Vec<(String, Vec<String>)> {
    let mut found = Vec::new();
    for chain in filter.list_chains(table).await {
        for args in filter.list_rules(table, &chain).await {
            if jump_target(&args) == Some(target) {
                found.push((chain.clone(), args));
            }
        }
    }
    found
}

/// Remove a chain: drop references to it, flush it, then delete it
///
/// Returns `true` when the chain is gone afterwards, including when it never
/// existed.
pub async fn remove_chain(filter: &dyn PacketFilter, table: &str, chain: &str) -> bool {
    if !chain_exists(filter, table, chain).await {
        return true;
    }

    for (parent, args) in chain_targets(filter, table, chain).await {
        filter.delete_rule(table, &parent, &args).await;
    }

    filter.flush_chain(table, chain).await;
    filter.delete_chain(table, chain).await
}

/// Target of a rule's `-j`/`--jump` argument
pub fn jump_target(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "-j" || a == "--jump")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// A rule bound to its table and chain
///
/// Top-level rules are persisted as text lines that literally use the append
/// operator (`-t <table> -A <chain> <args>`). Teardown parses the line back
/// into this record and deletes the same arguments, so no textual operator
/// substitution is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
}

impl FilterRule {
    pub fn new(table: &str, chain: &str, args: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            args: to_args(args),
        }
    }

    /// Persisted form, always using `-A`
    pub fn to_line(&self) -> String {
        let mut line = format!("-t {} -A {}", self.table, self.chain);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Delete form of the persisted line, for display
    pub fn teardown_line(&self) -> String {
        let mut line = format!("-t {} -D {}", self.table, self.chain);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Parse a persisted line; lines without `-A` are refused
    pub fn parse(line: &str) -> GateResult<Self> {
        let mut tokens = line.split_whitespace().peekable();
        let mut table = "filter".to_string();

        if tokens.peek() == Some(&"-t") {
            tokens.next();
            table = tokens
                .next()
                .ok_or_else(|| GateError::ParseError(format!("Missing table in rule: {}", line)))?
                .to_string();
        }

        match tokens.next() {
            Some("-A") => {}
            _ => {
                return Err(GateError::ParseError(format!(
                    "Rule does not use the append operator: {}",
                    line
                )))
            }
        }

        let chain = tokens
            .next()
            .ok_or_else(|| GateError::ParseError(format!("Missing chain in rule: {}", line)))?
            .to_string();
        let args: Vec<String> = tokens.map(String::from).collect();

        Ok(Self { table, chain, args })
    }

    /// Append unconditionally; teardown deletes exactly one copy per line
    pub async fn apply(&self, filter: &dyn PacketFilter) -> bool {
        filter.append_rule(&self.table, &self.chain, &self.args).await
    }

    pub async fn remove(&self, filter: &dyn PacketFilter) -> bool {
        filter.delete_rule(&self.table, &self.chain, &self.args).await
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_line_round_trip() {
        let rule = FilterRule::new("nat", "POSTROUTING", &["-s", "10.8.0.0/24", "-o", "eth0", "-j", "MASQUERADE"]);
        let line = rule.to_line();
        assert_eq!(line, "-t nat -A POSTROUTING -s 10.8.0.0/24 -o eth0 -j MASQUERADE");
        assert_eq!(FilterRule::parse(&line).unwrap(), rule);
        assert_eq!(rule.teardown_line(), "-t nat -D POSTROUTING -s 10.8.0.0/24 -o eth0 -j MASQUERADE");
    }

    #[test]
    fn test_parse_defaults_to_filter_table() {
        let rule = FilterRule::parse("-A INPUT -p udp --dport 1194 -j ACCEPT").unwrap();
        assert_eq!(rule.table, "filter");
        assert_eq!(rule.chain, "INPUT");
        assert_eq!(jump_target(&rule.args), Some("ACCEPT"));
    }

    #[test]
    fn test_parse_refuses_other_operators() {
        assert!(FilterRule::parse("-t filter -I INPUT -j ACCEPT").is_err());
        assert!(FilterRule::parse("-t filter -D INPUT -j ACCEPT").is_err());
        assert!(FilterRule::parse("-t").is_err());
        assert!(FilterRule::parse("-t filter -A").is_err());
        assert!(FilterRule::parse("").is_err());
    }

    #[tokio::test]
    async fn test_append_unique_skips_existing_rule() {
        let mut filter = MockPacketFilter::new();
        filter.expect_rule_exists().times(1).returning(|_, _, _| true);
        filter.expect_append_rule().times(0);

        assert!(append_unique(&filter, "filter", "GateVPN", &to_args(&["-j", "DROP"])).await);
    }

    #[tokio::test]
    async fn test_remove_chain_drops_parent_jumps_first() {
        let mut filter = MockPacketFilter::new();
        filter
            .expect_list_chains()
            .returning(|_| vec!["FORWARD".to_string(), "GateVPN".to_string()]);
        filter.expect_list_rules().returning(|_, chain| {
            if chain == "FORWARD" {
                vec![to_args(&["-s", "10.8.0.0/24", "-j", "GateVPN"])]
            } else {
                Vec::new()
            }
        });
        filter
            .expect_delete_rule()
            .times(1)
            .withf(|_, chain, args| chain == "FORWARD" && jump_target(args) == Some("GateVPN"))
            .returning(|_, _, _| true);
        filter.expect_flush_chain().times(1).returning(|_, _| true);
        filter.expect_delete_chain().times(1).returning(|_, _| true);

        assert!(remove_chain(&filter, "filter", "GateVPN").await);
    }

    #[tokio::test]
    async fn test_remove_missing_chain_is_noop() {
        let mut filter = MockPacketFilter::new();
        filter
            .expect_list_chains()
            .returning(|_| vec!["INPUT".to_string()]);
        filter.expect_flush_chain().times(0);
        filter.expect_delete_chain().times(0);

        assert!(remove_chain(&filter, "filter", "GateVPN").await);
    }
}
