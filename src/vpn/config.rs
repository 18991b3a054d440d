//! OpenVPN configuration rendering
//!
//! Rendering is pure: the same inputs always give the same text. Optional
//! directives render as empty lines which are dropped at the end.

use std::path::PathBuf;

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::pki::KeyPair;
use crate::settings::{keys, SettingsStore};
use crate::validation::{expand_cidr, validate_hostname, validate_ipv4};

use super::common::interface_ipv4;

const DEFAULT_PORT: u16 = 1194;
const DEFAULT_PROTOCOL: &str = "udp";
const RESOLV_SCRIPT: &str = "/etc/openvpn/update-resolv-conf";

/// Level 3 is the lowest at which OpenVPN passes `password` to `via-env` scripts
const SERVER_SCRIPT_SECURITY: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub port: u16,
    pub protocol: String,
    /// CIDR block handed out to clients
    pub subnet: String,
    pub nameservers: Vec<String>,
    /// CIDR blocks pushed as routes
    pub routes: Vec<String>,
    pub domain: Option<String>,
    pub ca_crt: String,
    pub server_crt: String,
    pub server_key: String,
    pub dh_params: String,
    pub tls_auth_key: String,
    /// Command line the daemon runs for client hooks
    pub hook_command: String,
    pub crl_file: PathBuf,
    pub management_socket: PathBuf,
    pub log_file: PathBuf,
    pub status_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub hostname: String,
    pub port: u16,
    pub protocol: String,
    pub ca_crt: String,
    pub client_crt: String,
    pub client_key: String,
    pub tls_auth_key: String,
    /// Add the resolver update scripts used by Linux clients
    pub linux: bool,
}

fn port_setting(settings: &dyn SettingsStore) -> GateResult<u16> {
    match settings.get(keys::VPN_PORT) {
        Some(port) => port
            .trim()
            .parse()
            .map_err(|_| GateError::ConfigError(format!("Invalid VPN port: {}", port))),
        None => Ok(DEFAULT_PORT),
    }
}

fn protocol_setting(settings: &dyn SettingsStore) -> GateResult<String> {
    let protocol = settings.get_or(keys::VPN_PROTOCOL, DEFAULT_PROTOCOL).to_lowercase();
    match protocol.as_str() {
        "udp" | "tcp" => Ok(protocol),
        _ => Err(GateError::ConfigError(format!("Invalid VPN protocol: {}", protocol))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ServerConfig {
    /// Gather server settings, resolving the bind address from the VPN
    /// interface when none is configured
    pub async fn from_settings(settings: &dyn SettingsStore, config: &GateConfig) -> GateResult<Self> {
        let bind_address = match non_empty(settings.get(keys::VPN_BIND_ADDRESS)) {
            Some(address) => Some(address),
            None => match non_empty(settings.get(keys::VPN_INTERFACE)) {
                Some(interface) => interface_ipv4(&interface).await?,
                None => None,
            },
        };

        Ok(Self {
            bind_address,
            port: port_setting(settings)?,
            protocol: protocol_setting(settings)?,
            subnet: settings.require(keys::VPN_SUBNET)?,
            nameservers: settings.get_list(keys::VPN_NAMESERVERS),
            routes: settings.get_list(keys::VPN_ROUTES),
            domain: non_empty(settings.get(keys::VPN_DOMAIN)),
            ca_crt: settings.require(keys::CA_CRT)?,
            server_crt: settings.require(keys::VPN_CRT)?,
            server_key: settings.require(keys::VPN_KEY)?,
            dh_params: settings.require(keys::VPN_DH_PARAMS)?,
            tls_auth_key: settings.require(keys::VPN_TLS_AUTH_KEY)?,
            hook_command: config.vpn.hook_command.clone(),
            crl_file: config.paths.crl_file.clone(),
            management_socket: config.paths.management_socket.clone(),
            log_file: config.paths.log_file.clone(),
            status_file: config.paths.status_file.clone(),
        })
    }

    pub fn render(&self) -> GateResult<String> {
        let (network, netmask) = expand_cidr(&self.subnet)?;

        let local = match &self.bind_address {
            Some(address) => {
                validate_ipv4(address)?;
                format!("local {}", address)
            }
            None => String::new(),
        };

        let mut pushes = Vec::new();
        for route in &self.routes {
            let (route_net, route_mask) = expand_cidr(route)?;
            pushes.push(format!("push \"route {} {}\"", route_net, route_mask));
        }
        for nameserver in &self.nameservers {
            validate_ipv4(nameserver)?;
            pushes.push(format!("push \"dhcp-option DNS {}\"", nameserver));
        }
        if let Some(domain) = &self.domain {
            validate_hostname(domain)?;
            pushes.push(format!("push \"dhcp-option DOMAIN {}\"", domain));
        }

        let conf = format!(
            r#"mode server
tls-server
{local}
port {port}
proto {proto}
dev tun
topology subnet
server {network} {netmask}

{pushes}

keepalive 10 60
persist-key
persist-tun
auth SHA512
tls-version-min 1.2
remote-cert-tls client
key-direction 0
crl-verify {crl}

management {socket} unix
script-security {security}
auth-user-pass-verify "{hook} client-authenticate" via-env
client-connect "{hook} client-connect"
client-disconnect "{hook} client-disconnect"

log-append {log}
status {status}
verb 3

<ca>
{ca}
</ca>
<cert>
{cert}
</cert>
<key>
{key}
</key>
<dh>
{dh}
</dh>
<tls-auth>
{tls}
</tls-auth>
"#,
            local = local,
            port = self.port,
            proto = self.protocol,
            network = network,
            netmask = netmask,
            pushes = pushes.join("\n"),
            crl = self.crl_file.display(),
            socket = self.management_socket.display(),
            security = SERVER_SCRIPT_SECURITY,
            hook = self.hook_command,
            log = self.log_file.display(),
            status = self.status_file.display(),
            ca = self.ca_crt.trim(),
            cert = self.server_crt.trim(),
            key = self.server_key.trim(),
            dh = self.dh_params.trim(),
            tls = self.tls_auth_key.trim(),
        );

        Ok(remove_empty_lines(&conf))
    }
}

impl ClientConfig {
    /// Server-side part of a client configuration, without the client keypair
    ///
    /// Every required setting is checked here, so a device keypair only needs
    /// issuing once this succeeds.
    pub fn from_settings(settings: &dyn SettingsStore, linux: bool) -> GateResult<Self> {
        let hostname = settings.require(keys::VPN_HOSTNAME)?;
        validate_hostname(hostname.trim())?;

        Ok(Self {
            hostname: hostname.trim().to_string(),
            port: port_setting(settings)?,
            protocol: protocol_setting(settings)?,
            ca_crt: settings.require(keys::CA_CRT)?,
            client_crt: String::new(),
            client_key: String::new(),
            tls_auth_key: settings.require(keys::VPN_TLS_AUTH_KEY)?,
            linux,
        })
    }

    pub fn with_keypair(mut self, keypair: &KeyPair) -> GateResult<Self> {
        let (client_crt, client_key) = keypair.pem()?;
        self.client_crt = client_crt;
        self.client_key = client_key;
        Ok(self)
    }

    pub fn render(&self) -> String {
        let resolv = if self.linux {
            format!("script-security 2\nup {script}\ndown {script}", script = RESOLV_SCRIPT)
        } else {
            String::new()
        };

        let conf = format!(
            r#"client
dev tun
proto {proto}
remote {host} {port}
resolv-retry infinite
nobind
persist-key
persist-tun
auth-user-pass
auth-nocache
auth SHA512
tls-version-min 1.2
remote-cert-tls server
key-direction 1
verb 3

{resolv}

<ca>
{ca}
</ca>
<cert>
{cert}
</cert>
<key>
{key}
</key>
<tls-auth>
{tls}
</tls-auth>
"#,
            proto = self.protocol,
            host = self.hostname,
            port = self.port,
            resolv = resolv,
            ca = self.ca_crt.trim(),
            cert = self.client_crt.trim(),
            key = self.client_key.trim(),
            tls = self.tls_auth_key.trim(),
        );

        remove_empty_lines(&conf)
    }
}

/// Drop blank lines, keeping a trailing newline
pub fn remove_empty_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        out.push_str(line);
        out.push('\n');
    }
    out
}
