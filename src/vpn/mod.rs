//! OpenVPN integration
//!
//! Everything vpngate does around the VPN daemon itself:
//!
//! - `config`: rendering the server and client configuration files
//! - `environment`: the variables the daemon passes to its hook scripts
//! - `hooks`: the lifecycle coordinator invoked once per hook
//! - `management`: the daemon's line-oriented control socket
//! - `service`: server key material and the systemd unit
//!
//! ```text
//!   openvpn ──(hook + env)──▶ VpnLifecycle ──▶ AccessService ──▶ FirewallCompiler
//!      ▲                                            │
//!      └────────(kill <cn>)── ManagementClient ◀────┘
//! ```

pub mod common;
pub mod config;
pub mod environment;
pub mod hooks;
pub mod management;
pub mod service;

pub use config::{ClientConfig, ServerConfig};
pub use hooks::{Hook, VpnLifecycle};
pub use management::ManagementClient;
pub use service::VpnService;
