//! OpenVPN server keys and systemd unit control

use std::path::Path;
use tracing::info;

use crate::error::GateResult;
use crate::pki::{create_tls_auth_key, PkiEngine};
use crate::settings::{keys, SettingsStore};

use super::common::{run_command, run_status};
use super::management;

pub const SERVER_COMMON_NAME: &str = "VpnGate Server";
pub const SERVER_VALIDITY_DAYS: u32 = 3650;
pub const SERVER_DH_BITS: u32 = 2048;

/// Generate and store the server keypair, DH parameters and TLS-auth key
pub fn create_server_keys(pki: &PkiEngine, settings: &dyn SettingsStore) -> GateResult<()> {
    create_server_keys_with(pki, settings, SERVER_DH_BITS)
}

pub fn create_server_keys_with(pki: &PkiEngine, settings: &dyn SettingsStore, dh_bits: u32) -> GateResult<()> {
    let keypair = pki.create_server_keypair(SERVER_COMMON_NAME, SERVER_VALIDITY_DAYS)?;
    let (crt, key) = keypair.pem()?;
    settings.set(keys::VPN_CRT, &crt)?;
    settings.set(keys::VPN_KEY, &key)?;

    info!("Generating {}-bit DH parameters, this can take a while", dh_bits);
    settings.set(keys::VPN_DH_PARAMS, &pki.create_dh_params(Some(dh_bits))?)?;
    settings.set(keys::VPN_TLS_AUTH_KEY, &create_tls_auth_key())?;

    info!("Server keys created ({})", keypair.fingerprint()?);
    Ok(())
}

/// The systemd unit running the daemon
pub struct VpnService {
    unit: String,
}

impl VpnService {
    pub fn new(unit: &str) -> Self {
        Self { unit: unit.to_string() }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub async fn start(&self) -> GateResult<()> {
        run_command("systemctl", &["start", &self.unit]).await?;
        info!("Started {}", self.unit);
        Ok(())
    }

    pub async fn stop(&self) -> GateResult<()> {
        run_command("systemctl", &["stop", &self.unit]).await?;
        info!("Stopped {}", self.unit);
        Ok(())
    }

    pub async fn restart(&self) -> GateResult<()> {
        run_command("systemctl", &["restart", &self.unit]).await?;
        info!("Restarted {}", self.unit);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        run_status("systemctl", &["is-active", "--quiet", &self.unit]).await
    }

    /// Restart the unit if a settings change asked for it
    pub async fn restart_if_pending(&self, settings: &dyn SettingsStore) -> GateResult<bool> {
        settings.reload()?;
        if !settings.get_bool(keys::VPN_RESTART_PENDING, false) {
            return Ok(false);
        }
        self.restart().await?;
        Ok(true)
    }
}

/// Force-disconnect a live session by common name
pub async fn kill_client(socket: &Path, common_name: &str) -> GateResult<String> {
    let response = management::kill_client(socket, common_name).await?;
    info!("Disconnected {}", common_name);
    Ok(response)
}
