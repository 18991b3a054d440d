//! Operator settings store
//!
//! Named string values (PEM material, hostnames, ports, subnet, nameserver
//! lists, routes, key sizes) shared between the CLI, the daemon and the hooks.
//! Components receive a `SettingsStore` instead of reaching for global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{GateError, GateResult};
use crate::store::FileLock;

/// Well-known setting names
pub mod keys {
    pub const CA_CRT: &str = "ca_crt";
    pub const CA_KEY: &str = "ca_key";
    pub const PKI_KEY_SIZE: &str = "pki_key_size";

    pub const VPN_CRT: &str = "vpn_crt";
    pub const VPN_KEY: &str = "vpn_key";
    pub const VPN_DH_PARAMS: &str = "vpn_dh_params";
    pub const VPN_TLS_AUTH_KEY: &str = "vpn_tls_auth_key";

    pub const VPN_BIND_ADDRESS: &str = "vpn_bind_address";
    pub const VPN_DOMAIN: &str = "vpn_domain";
    pub const VPN_HOSTNAME: &str = "vpn_hostname";
    pub const VPN_INTERFACE: &str = "vpn_interface";
    pub const VPN_NAMESERVERS: &str = "vpn_nameservers";
    pub const VPN_NAT_INTERFACE: &str = "vpn_nat_interface";
    pub const VPN_PORT: &str = "vpn_port";
    pub const VPN_PROTOCOL: &str = "vpn_protocol";
    pub const VPN_ROUTES: &str = "vpn_routes";
    pub const VPN_SUBNET: &str = "vpn_subnet";

    pub const VPN_FIREWALL_RULES: &str = "vpn_firewall_rules";
    pub const VPN_RESTART_PENDING: &str = "vpn_restart_pending";

    pub const APP_MFA_REQUIRED: &str = "app_mfa_required";
}

/// Key-value settings with explicit reload
pub trait SettingsStore: Send + Sync {
    /// Current value of a setting
    fn get(&self, name: &str) -> Option<String>;

    /// Create or overwrite a setting, persisting it immediately
    fn set(&self, name: &str, value: &str) -> GateResult<()>;

    /// Remove a setting; removing an absent setting is not an error
    fn delete(&self, name: &str) -> GateResult<()>;

    /// Re-read every setting from the backing store
    fn reload(&self) -> GateResult<()>;

    fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    /// Value of a setting that must be present and non-empty
    fn require(&self, name: &str) -> GateResult<String> {
        match self.get(name) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(GateError::ConfigError(format!("required setting '{}' is not set", name))),
        }
    }

    /// Newline-separated list, empty entries dropped
    fn get_list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|value| {
                value
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(value) => matches!(value.trim().to_lowercase().as_str(), "true" | "yes" | "1" | "on"),
            None => default,
        }
    }

    fn get_int(&self, name: &str, default: u32) -> u32 {
        match self.get(name) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                warn!("Setting '{}' is not an integer ({:?}), using {}", name, value, default);
                default
            }),
            None => default,
        }
    }

    fn set_bool(&self, name: &str, value: bool) -> GateResult<()> {
        self.set(name, if value { "true" } else { "false" })
    }

    fn set_list(&self, name: &str, values: &[String]) -> GateResult<()> {
        self.set(name, &values.join("\n"))
    }
}

/// Settings persisted as a flat TOML table
///
/// Writes are read-modify-write under an exclusive `flock` on a sidecar
/// file, so hook processes changing different names never lose an update.
pub struct FileSettings {
    path: PathBuf,
    lock_path: PathBuf,
    cache: RwLock<BTreeMap<String, String>>,
}

impl FileSettings {
    /// Open the store, loading the file if it exists
    pub fn open<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let settings = Self {
            lock_path: path.with_extension("toml.lock"),
            path,
            cache: RwLock::new(BTreeMap::new()),
        };
        settings.reload()?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> GateResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| GateError::ConfigError(format!("Failed to read settings {:?}: {}", self.path, e)))?;
        toml::from_str(&content)
            .map_err(|e| GateError::ConfigError(format!("Failed to parse settings {:?}: {}", self.path, e)))
    }

    fn write_file(&self, values: &BTreeMap<String, String>) -> GateResult<()> {
        let content = toml::to_string(values)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Merge a single change into the on-disk table
    fn update(&self, name: &str, value: Option<&str>) -> GateResult<()> {
        let mut cache = self.cache.write().map_err(|_| poisoned())?;
        let _lock = FileLock::acquire(&self.lock_path, true)?;
        let mut values = self.read_file()?;

        match value {
            Some(value) => values.insert(name.to_string(), value.to_string()),
            None => values.remove(name),
        };

        self.write_file(&values)?;
        *cache = values;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, name: &str) -> Option<String> {
        self.cache.read().ok()?.get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) -> GateResult<()> {
        debug!("Setting '{}' updated", name);
        self.update(name, Some(value))
    }

    fn delete(&self, name: &str) -> GateResult<()> {
        debug!("Setting '{}' deleted", name);
        self.update(name, None)
    }

    fn reload(&self) -> GateResult<()> {
        let values = {
            let _lock = FileLock::acquire(&self.lock_path, false)?;
            self.read_file()?
        };
        *self.cache.write().map_err(|_| poisoned())? = values;
        Ok(())
    }
}

/// Settings that live only in memory
#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(values.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().ok()?.get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) -> GateResult<()> {
        self.values.write().map_err(|_| poisoned())?.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, name: &str) -> GateResult<()> {
        self.values.write().map_err(|_| poisoned())?.remove(name);
        Ok(())
    }

    fn reload(&self) -> GateResult<()> {
        Ok(())
    }
}

fn poisoned() -> GateError {
    GateError::ConfigError("settings lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_settings_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");

        let settings = FileSettings::open(&path).unwrap();
        assert_eq!(settings.get(keys::VPN_PORT), None);

        settings.set(keys::VPN_PORT, "1194").unwrap();
        settings.set(keys::VPN_NAMESERVERS, "1.1.1.1\n8.8.8.8\n").unwrap();

        let reopened = FileSettings::open(&path).unwrap();
        assert_eq!(reopened.get(keys::VPN_PORT).as_deref(), Some("1194"));
        assert_eq!(reopened.get_list(keys::VPN_NAMESERVERS), vec!["1.1.1.1", "8.8.8.8"]);

        reopened.delete(keys::VPN_PORT).unwrap();
        settings.reload().unwrap();
        assert_eq!(settings.get(keys::VPN_PORT), None);
    }

    #[test]
    fn test_concurrent_writers_merge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");

        let a = FileSettings::open(&path).unwrap();
        let b = FileSettings::open(&path).unwrap();
        a.set("first", "1").unwrap();
        b.set("second", "2").unwrap();

        a.reload().unwrap();
        assert_eq!(a.get("first").as_deref(), Some("1"));
        assert_eq!(a.get("second").as_deref(), Some("2"));
    }

    #[test]
    fn test_parallel_writers_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || {
                    // one store per writer, like separate hook processes
                    let settings = FileSettings::open(&path).unwrap();
                    for n in 0..10 {
                        settings.set(&format!("writer{}_{}", w, n), "x").unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let settings = FileSettings::open(&path).unwrap();
        for w in 0..8 {
            for n in 0..10 {
                assert!(settings.get(&format!("writer{}_{}", w, n)).is_some(), "writer{}_{} lost", w, n);
            }
        }
        assert!(dir.path().join("settings.toml.lock").exists());
    }

    #[test]
    fn test_typed_helpers() {
        let settings = MemorySettings::with([
            (keys::PKI_KEY_SIZE, "4096"),
            (keys::VPN_RESTART_PENDING, "True"),
            ("bogus_int", "abc"),
            (keys::VPN_DOMAIN, "  "),
        ]);

        assert_eq!(settings.get_int(keys::PKI_KEY_SIZE, 2048), 4096);
        assert_eq!(settings.get_int("bogus_int", 2048), 2048);
        assert_eq!(settings.get_int("missing", 2048), 2048);
        assert!(settings.get_bool(keys::VPN_RESTART_PENDING, false));
        assert!(!settings.get_bool("missing", false));
        assert!(settings.get_list("missing").is_empty());
        assert!(matches!(settings.require(keys::VPN_DOMAIN), Err(GateError::ConfigError(_))));
        assert_eq!(settings.get_or(keys::VPN_PROTOCOL, "udp"), "udp");

        settings.set_bool(keys::VPN_RESTART_PENDING, false).unwrap();
        assert!(!settings.get_bool(keys::VPN_RESTART_PENDING, true));
    }
}
