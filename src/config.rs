//! Configuration management for vpngate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::{GateError, GateResult};

/// Default location of the process configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/vpngate/vpngate.toml";

/// Main vpngate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Filesystem locations
    #[serde(default)]
    pub paths: ConfigPaths,
    /// Packet-filter settings
    #[serde(default)]
    pub firewall: FirewallSettings,
    /// VPN daemon integration
    #[serde(default)]
    pub vpn: VpnSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Persistent data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Entity state document (users, groups, devices, sessions)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Operator settings store
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    /// Rendered OpenVPN server configuration
    #[serde(default = "default_server_config_file")]
    pub server_config_file: PathBuf,
    /// Certificate revocation list
    #[serde(default = "default_crl_file")]
    pub crl_file: PathBuf,
    /// OpenVPN management socket
    #[serde(default = "default_management_socket")]
    pub management_socket: PathBuf,
    /// OpenVPN log file
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// OpenVPN status file
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSettings {
    /// Packet-filter binary
    #[serde(default = "default_iptables")]
    pub iptables: String,
    /// Table holding the VPN chains
    #[serde(default = "default_table")]
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnSettings {
    /// Command line the daemon runs for client hooks
    #[serde(default = "default_hook_command")]
    pub hook_command: String,
    /// systemd unit running the daemon
    #[serde(default = "default_service_unit")]
    pub service_unit: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/vpngate")
}

fn default_state_file() -> PathBuf {
    default_data_dir().join("state.json")
}

fn default_settings_file() -> PathBuf {
    default_data_dir().join("settings.toml")
}

fn default_server_config_file() -> PathBuf {
    default_data_dir().join("openvpn.conf")
}

fn default_crl_file() -> PathBuf {
    default_data_dir().join("keys").join("crl.pem")
}

fn default_management_socket() -> PathBuf {
    PathBuf::from("/run/vpngate-vpn.sock")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/vpngate/openvpn.log")
}

fn default_status_file() -> PathBuf {
    PathBuf::from("/var/log/vpngate/openvpn-status.log")
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_hook_command() -> String {
    "/usr/bin/vpngate hook".to_string()
}

fn default_service_unit() -> String {
    "vpngate-vpn".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state_file: default_state_file(),
            settings_file: default_settings_file(),
            server_config_file: default_server_config_file(),
            crl_file: default_crl_file(),
            management_socket: default_management_socket(),
            log_file: default_log_file(),
            status_file: default_status_file(),
        }
    }
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            iptables: default_iptables(),
            table: default_table(),
        }
    }
}

impl Default for VpnSettings {
    fn default() -> Self {
        Self {
            hook_command: default_hook_command(),
            service_unit: default_service_unit(),
        }
    }
}

impl GateConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GateError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| GateError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> GateResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| GateError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| GateError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> GateResult<()> {
        let files = [
            &self.paths.state_file,
            &self.paths.settings_file,
            &self.paths.server_config_file,
            &self.paths.crl_file,
        ];
        let parents = files.iter().filter_map(|p| p.parent());

        for dir in std::iter::once(self.paths.data_dir.as_path()).chain(parents) {
            std::fs::create_dir_all(dir)
                .map_err(|e| GateError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    /// Configuration rooted entirely inside `dir`, used by tests and dry runs
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            paths: ConfigPaths {
                data_dir: dir.to_path_buf(),
                state_file: dir.join("state.json"),
                settings_file: dir.join("settings.toml"),
                server_config_file: dir.join("openvpn.conf"),
                crl_file: dir.join("keys").join("crl.pem"),
                management_socket: dir.join("vpn.sock"),
                log_file: dir.join("openvpn.log"),
                status_file: dir.join("openvpn-status.log"),
            },
            ..Self::default()
        }
    }
}
