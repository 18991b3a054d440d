//! Access policy to packet-filter chains
//!
//! Chain layout:
//! - `GateVPN`: entered from FORWARD for traffic sourced from the VPN subnet,
//!   allows DNS to the pushed nameservers, then hands off to the clients chain
//!   and drops whatever comes back.
//! - `GateVPN_Clients`: one `-s <virtual ip> -j <group chain>` per session.
//! - `GateVPN_Group_<id>`: a group's rules, ACCEPT before DROP, default deny.
//!
//! Every chain is a projection of the current entities and can be rebuilt at
//! any time; a rebuild always starts with a flush, so re-running it after a
//! partial failure converges.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{append_unique, ensure_chain, remove_chain, to_args, FilterRule, PacketFilter};
use crate::error::GateResult;
use crate::model::{FirewallRule, Group};
use crate::settings::{keys, SettingsStore};
use crate::validation::{parse_cidr, validate_interface_name, validate_ipv4};

pub const BASE_CHAIN: &str = "GateVPN";
pub const CLIENTS_CHAIN: &str = "GateVPN_Clients";
pub const GROUP_CHAIN_PREFIX: &str = "GateVPN_Group_";

/// Longest chain name iptables accepts
pub const MAX_CHAIN_NAME_LEN: usize = 28;

const DEFAULT_PORT: &str = "1194";
const DEFAULT_PROTOCOL: &str = "udp";

/// Chain name of a group: prefix plus the hyphen-less id, truncated
pub fn chain_name(group_id: &Uuid) -> String {
    let mut name = format!("{}{}", GROUP_CHAIN_PREFIX, group_id.simple());
    name.truncate(MAX_CHAIN_NAME_LEN);
    name
}

/// Filter arguments of one policy rule
pub fn rule_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(destination) = rule.destination.as_deref().filter(|d| !d.is_empty()) {
        args.extend(to_args(&["-d", destination]));
    }

    if let Some(protocol) = rule.protocol {
        args.extend(to_args(&["-p", protocol.as_str()]));

        let port = rule.port.as_deref().filter(|p| !p.is_empty());
        if let (true, Some(port)) = (protocol.has_ports(), port) {
            if port.contains(',') || port.contains(':') {
                args.extend(to_args(&["--match", "multiport", "--dports", port]));
            } else {
                args.extend(to_args(&["--dport", port]));
            }
        }
    }

    args.extend(to_args(&["-j", rule.action.as_str()]));
    args
}

/// Enabled rules in evaluation order: ACCEPT first, stable within an action
pub fn ordered_rules(rules: &[FirewallRule]) -> Vec<&FirewallRule> {
    let mut enabled: Vec<&FirewallRule> = rules.iter().filter(|r| r.is_enabled).collect();
    enabled.sort_by(|a, b| b.action.cmp(&a.action));
    enabled
}

fn session_jump(virtual_ip: &str, group_id: &Uuid) -> Vec<String> {
    to_args(&["-s", virtual_ip, "-j", &chain_name(group_id)])
}

pub struct FirewallCompiler {
    filter: Arc<dyn PacketFilter>,
    settings: Arc<dyn SettingsStore>,
    table: String,
}

impl FirewallCompiler {
    pub fn new(filter: Arc<dyn PacketFilter>, settings: Arc<dyn SettingsStore>, table: &str) -> Self {
        Self {
            filter,
            settings,
            table: table.to_string(),
        }
    }

    pub fn filter(&self) -> &dyn PacketFilter {
        self.filter.as_ref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Recreate a group's chain from its rules
    pub async fn rebuild_group_chain(&self, group: &Group, rules: &[FirewallRule]) -> bool {
        let chain = chain_name(&group.id);
        let filter = self.filter();
        debug!("Rebuilding chain {} for group '{}'", chain, group.name);

        let mut ok = ensure_chain(filter, &self.table, &chain).await;
        ok &= filter.flush_chain(&self.table, &chain).await;

        for rule in ordered_rules(rules) {
            if !append_unique(filter, &self.table, &chain, &rule_args(rule)).await {
                warn!("Failed to add rule {} to chain {}", rule.id, chain);
                ok = false;
            }
        }

        ok &= append_unique(filter, &self.table, &chain, &to_args(&["-j", "DROP"])).await;
        ok
    }

    /// Remove a group's chain together with every jump into it
    pub async fn delete_group_chain(&self, group_id: &Uuid) -> bool {
        let chain = chain_name(group_id);
        debug!("Deleting chain {}", chain);
        remove_chain(self.filter(), &self.table, &chain).await
    }

    /// Delete group chains that no longer belong to a known group
    pub async fn delete_orphan_group_chains(&self) -> usize {
        let mut removed = 0;
        for chain in self.filter.list_chains(&self.table).await {
            if chain.starts_with(GROUP_CHAIN_PREFIX) && remove_chain(self.filter(), &self.table, &chain).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn add_session_jump(&self, virtual_ip: &str, group_id: &Uuid) -> bool {
        append_unique(self.filter(), &self.table, CLIENTS_CHAIN, &session_jump(virtual_ip, group_id)).await
    }

    /// Remove a session's jump rule; `false` when there was none to remove
    pub async fn remove_session_jump(&self, virtual_ip: &str, group_id: &Uuid) -> bool {
        let args = session_jump(virtual_ip, group_id);
        if !self.filter.rule_exists(&self.table, CLIENTS_CHAIN, &args).await {
            return false;
        }
        self.filter.delete_rule(&self.table, CLIENTS_CHAIN, &args).await
    }

    pub async fn create_base_chains(&self) -> bool {
        let filter = self.filter();
        ensure_chain(filter, &self.table, BASE_CHAIN).await & ensure_chain(filter, &self.table, CLIENTS_CHAIN).await
    }

    /// Delete the base chains; the base chain goes first since it jumps into
    /// the clients chain
    pub async fn delete_base_chains(&self) -> bool {
        let filter = self.filter();
        remove_chain(filter, &self.table, BASE_CHAIN).await & remove_chain(filter, &self.table, CLIENTS_CHAIN).await
    }

    /// Top-level rules derived from the operator settings
    pub fn render_top_level_rules(&self) -> GateResult<Vec<FilterRule>> {
        let settings = &self.settings;
        let protocol = settings.get_or(keys::VPN_PROTOCOL, DEFAULT_PROTOCOL);
        let port = settings.get_or(keys::VPN_PORT, DEFAULT_PORT);
        let subnet = settings.require(keys::VPN_SUBNET)?;
        parse_cidr(&subnet)?;

        let table = self.table.as_str();
        let mut rules = Vec::new();

        let interface = settings.get(keys::VPN_INTERFACE).filter(|i| !i.trim().is_empty());
        let mut input = Vec::new();
        if let Some(interface) = &interface {
            validate_interface_name(interface)?;
            input.extend(["-i", interface.as_str()]);
        }
        input.extend(["-p", protocol.as_str(), "--dport", port.as_str(), "-j", "ACCEPT"]);
        rules.push(FilterRule::new(table, "INPUT", &input));

        rules.push(FilterRule::new(table, "FORWARD", &["-s", &subnet, "-j", BASE_CHAIN]));
        rules.push(FilterRule::new(
            table,
            "FORWARD",
            &["-d", &subnet, "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        ));

        for nameserver in settings.get_list(keys::VPN_NAMESERVERS) {
            validate_ipv4(&nameserver)?;
            for proto in ["udp", "tcp"] {
                rules.push(FilterRule::new(
                    table,
                    BASE_CHAIN,
                    &["-d", &nameserver, "-p", proto, "--dport", "53", "-j", "ACCEPT"],
                ));
            }
        }

        rules.push(FilterRule::new(table, BASE_CHAIN, &["-j", CLIENTS_CHAIN]));
        rules.push(FilterRule::new(table, BASE_CHAIN, &["-j", "DROP"]));

        if let Some(nat) = settings.get(keys::VPN_NAT_INTERFACE).filter(|i| !i.trim().is_empty()) {
            validate_interface_name(&nat)?;
            rules.push(FilterRule::new("nat", "POSTROUTING", &["-s", &subnet, "-o", &nat, "-j", "MASQUERADE"]));
        }

        Ok(rules)
    }

    /// Apply rules in order, returning the ones that were appended
    pub async fn apply_rules(&self, rules: &[FilterRule]) -> Vec<FilterRule> {
        let mut applied = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.apply(self.filter()).await {
                applied.push(rule.clone());
            } else {
                warn!("Failed to apply '{}'", rule);
            }
        }
        info!("Applied {}/{} top-level firewall rules", applied.len(), rules.len());
        applied
    }

    /// Remove rules in reverse order, returning how many were removed
    pub async fn remove_rules(&self, rules: &[FilterRule]) -> usize {
        let mut removed = 0;
        for rule in rules.iter().rev() {
            if rule.remove(self.filter()).await {
                removed += 1;
            } else {
                debug!("Nothing removed for '{}'", rule.teardown_line());
            }
        }
        removed
    }
}
