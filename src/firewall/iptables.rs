//! `iptables` command backend

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::PacketFilter;
use crate::validation::sanitize_error_message;

pub struct Iptables {
    binary: String,
}

impl Iptables {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// Run one command, returning stdout on success
    ///
    /// `quiet` keeps expected failures (existence checks) out of the warn log.
    async fn run(&self, args: &[&str], quiet: bool) -> Option<String> {
        let cmdline = format!("{} --wait {}", self.binary, args.join(" "));
        let output = match Command::new(&self.binary).arg("--wait").args(args).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to run '{}': {}", cmdline, e);
                return None;
            }
        };

        if output.status.success() {
            debug!("Ran '{}'", cmdline);
            return Some(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = sanitize_error_message(&String::from_utf8_lossy(&output.stderr));
        if quiet {
            debug!("'{}' returned {:?}: {}", cmdline, output.status.code(), stderr);
        } else {
            warn!("'{}' failed with {:?}: {}", cmdline, output.status.code(), stderr);
        }
        None
    }

    async fn rule_op(&self, op: &str, table: &str, chain: &str, args: &[String], quiet: bool) -> bool {
        let mut full = vec!["-t", table, op, chain];
        full.extend(args.iter().map(String::as_str));
        self.run(&full, quiet).await.is_some()
    }
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new("iptables")
    }
}

#[async_trait]
impl PacketFilter for Iptables {
    async fn list_chains(&self, table: &str) -> Vec<String> {
        self.run(&["-t", table, "-S"], false)
            .await
            .map(|out| parse_chains(&out))
            .unwrap_or_default()
    }

    async fn list_rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.run(&["-t", table, "-S", chain], false)
            .await
            .map(|out| parse_rules(&out, chain))
            .unwrap_or_default()
    }

    async fn create_chain(&self, table: &str, chain: &str) -> bool {
        self.run(&["-t", table, "-N", chain], false).await.is_some()
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> bool {
        self.run(&["-t", table, "-X", chain], false).await.is_some()
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> bool {
        self.run(&["-t", table, "-F", chain], false).await.is_some()
    }

    async fn append_rule(&self, table: &str, chain: &str, args: &[String]) -> bool {
        self.rule_op("-A", table, chain, args, false).await
    }

    async fn insert_rule(&self, table: &str, chain: &str, args: &[String]) -> bool {
        self.rule_op("-I", table, chain, args, false).await
    }

    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> bool {
        self.rule_op("-D", table, chain, args, false).await
    }

    async fn rule_exists(&self, table: &str, chain: &str, args: &[String]) -> bool {
        self.rule_op("-C", table, chain, args, true).await
    }
}

/// Chain names from `iptables -S` output (`-P` built-ins and `-N` user chains)
fn parse_chains(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("-P") | Some("-N") => tokens.next().map(String::from),
                _ => None,
            }
        })
        .collect()
}

/// Rule arguments of one chain from `iptables -S <chain>` output
fn parse_rules(output: &str, chain: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next() != Some("-A") || tokens.next() != Some(chain) {
                return None;
            }
            Some(tokens.map(String::from).collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAVE_OUTPUT: &str = "\
-P INPUT ACCEPT
-P FORWARD DROP
-P OUTPUT ACCEPT
-N GateVPN
-N GateVPN_Clients
-A FORWARD -s 10.8.0.0/24 -j GateVPN
-A GateVPN -j GateVPN_Clients
-A GateVPN -j DROP
";

    #[test]
    fn test_parse_chains() {
        assert_eq!(
            parse_chains(SAVE_OUTPUT),
            vec!["INPUT", "FORWARD", "OUTPUT", "GateVPN", "GateVPN_Clients"]
        );
    }

    #[test]
    fn test_parse_rules() {
        let rules = parse_rules(SAVE_OUTPUT, "GateVPN");
        assert_eq!(rules, vec![vec!["-j", "GateVPN_Clients"], vec!["-j", "DROP"]]);
        assert!(parse_rules(SAVE_OUTPUT, "GateVPN_Clients").is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_degrades_to_false() {
        let filter = Iptables::new("/nonexistent/iptables");
        assert!(!filter.create_chain("filter", "GateVPN").await);
        assert!(!filter.rule_exists("filter", "INPUT", &[]).await);
        assert!(filter.list_chains("filter").await.is_empty());
    }
}
