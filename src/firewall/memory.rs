//! In-memory packet-filter engine
//!
//! Behaves like the kernel tables for the operations the compiler uses,
//! including the refusals: deleting a built-in, non-empty or referenced
//! chain fails, and so does jumping to a chain that does not exist.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{jump_target, PacketFilter};

const BUILTIN_TARGETS: &[&str] = &["ACCEPT", "DROP", "RETURN", "REJECT", "LOG", "MASQUERADE", "SNAT", "DNAT"];

pub type Tables = BTreeMap<String, BTreeMap<String, Vec<Vec<String>>>>;

pub struct MemoryFilter {
    tables: Mutex<Tables>,
    builtins: Vec<(String, String)>,
    deleted_rules: Mutex<usize>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        let builtins: Vec<(String, String)> = [
            ("filter", "INPUT"),
            ("filter", "FORWARD"),
            ("filter", "OUTPUT"),
            ("nat", "PREROUTING"),
            ("nat", "INPUT"),
            ("nat", "OUTPUT"),
            ("nat", "POSTROUTING"),
        ]
        .iter()
        .map(|(t, c)| (t.to_string(), c.to_string()))
        .collect();

        let mut tables = Tables::new();
        for (table, chain) in &builtins {
            tables.entry(table.clone()).or_default().insert(chain.clone(), Vec::new());
        }

        Self {
            tables: Mutex::new(tables),
            builtins,
            deleted_rules: Mutex::new(0),
        }
    }

    /// Copy of every table, for comparing states
    pub fn snapshot(&self) -> Tables {
        self.lock().clone()
    }

    /// Rules of one chain, `None` if the chain does not exist
    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<Vec<String>>> {
        self.lock().get(table)?.get(chain).cloned()
    }

    /// Number of successful single-rule deletions so far
    pub fn deleted_rules(&self) -> usize {
        self.deleted_rules.lock().map(|n| *n).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // a panic while holding the lock only happens in a failing test
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_builtin(&self, table: &str, chain: &str) -> bool {
        self.builtins.iter().any(|(t, c)| t == table && c == chain)
    }

    fn valid_target(tables: &Tables, table: &str, args: &[String]) -> bool {
        match jump_target(args) {
            None => true,
            Some(target) if BUILTIN_TARGETS.contains(&target) => true,
            Some(target) => tables.get(table).map(|t| t.contains_key(target)).unwrap_or(false),
        }
    }

    fn add_rule(&self, table: &str, chain: &str, args: &[String], at_head: bool) -> bool {
        let mut tables = self.lock();
        if !Self::valid_target(&tables, table, args) {
            debug!("Refusing rule in {}/{} with missing target: {:?}", table, chain, args);
            return false;
        }

        match tables.get_mut(table).and_then(|t| t.get_mut(chain)) {
            Some(rules) => {
                if at_head {
                    rules.insert(0, args.to_vec());
                } else {
                    rules.push(args.to_vec());
                }
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PacketFilter for MemoryFilter {
    async fn list_chains(&self, table: &str) -> Vec<String> {
        self.lock()
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn list_rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.rules(table, chain).unwrap_or_default()
    }

    async fn create_chain(&self, table: &str, chain: &str) -> bool {
        let mut tables = self.lock();
        let chains = tables.entry(table.to_string()).or_default();
        if chains.contains_key(chain) {
            return false;
        }
        chains.insert(chain.to_string(), Vec::new());
        true
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> bool {
        if self.is_builtin(table, chain) {
            return false;
        }

        let mut tables = self.lock();
        let Some(chains) = tables.get_mut(table) else {
            return false;
        };

        match chains.get(chain) {
            Some(rules) if rules.is_empty() => {}
            _ => return false,
        }

        let referenced = chains
            .values()
            .flatten()
            .any(|args| jump_target(args) == Some(chain));
        if referenced {
            return false;
        }

        chains.remove(chain);
        true
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> bool {
        match self.lock().get_mut(table).and_then(|t| t.get_mut(chain)) {
            Some(rules) => {
                rules.clear();
                true
            }
            None => false,
        }
    }

    async fn append_rule(&self, table: &str, chain: &str, args: &[String]) -> bool {
        self.add_rule(table, chain, args, false)
    }

    async fn insert_rule(&self, table: &str, chain: &str, args: &[String]) -> bool {
        self.add_rule(table, chain, args, true)
    }

    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> bool {
        let removed = {
            let mut tables = self.lock();
            match tables.get_mut(table).and_then(|t| t.get_mut(chain)) {
                Some(rules) => match rules.iter().position(|r| r.as_slice() == args) {
                    Some(index) => {
                        rules.remove(index);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };

        if removed {
            if let Ok(mut count) = self.deleted_rules.lock() {
                *count += 1;
            }
        }
        removed
    }

    async fn rule_exists(&self, table: &str, chain: &str, args: &[String]) -> bool {
        self.rules(table, chain)
            .map(|rules| rules.iter().any(|r| r.as_slice() == args))
            .unwrap_or(false)
    }
}
