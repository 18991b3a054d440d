//! vpngate - identity and access management around an OpenVPN server
//!
//! Async library providing:
//! - A certificate authority issuing server and device certificates
//! - An append-only revocation log and CRL publishing
//! - Per-group packet-filter chains compiled from firewall rules
//! - Server and client configuration rendering
//! - A client for the daemon's management socket
//! - The lifecycle hooks the daemon invokes on start, stop and client events

pub mod error;
pub mod validation;
pub mod config;
pub mod settings;
pub mod model;
pub mod store;
pub mod pki;
pub mod revocation;
pub mod firewall;
pub mod access;
pub mod vpn;

// Re-export commonly used types
pub use error::{GateError, GateResult};
pub use config::GateConfig;
pub use settings::{FileSettings, MemorySettings, SettingsStore};
pub use model::{Device, Event, FirewallRule, Group, Protocol, RuleAction, Session, User};
pub use store::{State, StateStore};
pub use pki::{KeyPair, PkiEngine};
pub use revocation::{CrlPublisher, RevocationLog};
pub use firewall::{FilterRule, FirewallCompiler, Iptables, MemoryFilter, PacketFilter};
pub use access::AccessService;
pub use vpn::{ClientConfig, Hook, ManagementClient, ServerConfig, VpnLifecycle, VpnService};
