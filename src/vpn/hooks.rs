//! OpenVPN lifecycle hooks
//!
//! The daemon (through its systemd unit and its script directives) runs one
//! hook per process invocation. Each hook runs to completion; a rejected
//! client surfaces as [`GateError::AccessRejected`] so the caller exits
//! non-zero and the daemon refuses the connection.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::access::AccessService;
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::firewall::FilterRule;
use crate::model::{format_duration, Event, Session};
use crate::revocation::ensure_placeholder;
use crate::settings::{keys, SettingsStore};
use crate::validation::validate_ipv4;

use super::common::write_secure_config;
use super::config::ServerConfig;
use super::environment::{AuthRequest, ConnectRequest, DisconnectRequest};

pub const EVENT_CONNECT: &str = "vpn.connect";
pub const EVENT_DISCONNECT: &str = "vpn.disconnect";
pub const EVENT_ERROR: &str = "vpn.error";

/// Integration points invoked by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Hook {
    PreStart,
    PostStart,
    PostStop,
    ClientAuthenticate,
    ClientConnect,
    ClientDisconnect,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::PreStart => "pre-start",
            Hook::PostStart => "post-start",
            Hook::PostStop => "post-stop",
            Hook::ClientAuthenticate => "client-authenticate",
            Hook::ClientConnect => "client-connect",
            Hook::ClientDisconnect => "client-disconnect",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct VpnLifecycle {
    config: GateConfig,
    settings: Arc<dyn SettingsStore>,
    access: AccessService,
}

impl VpnLifecycle {
    pub fn new(config: GateConfig, settings: Arc<dyn SettingsStore>, access: AccessService) -> Self {
        Self {
            config,
            settings,
            access,
        }
    }

    pub fn access(&self) -> &AccessService {
        &self.access
    }

    /// Run a hook, reading client details from the process environment
    pub async fn run(&self, hook: Hook) -> GateResult<()> {
        debug!("Running hook {}", hook);
        match hook {
            Hook::PreStart => self.pre_start().await,
            Hook::PostStart => self.post_start().await,
            Hook::PostStop => self.post_stop().await,
            Hook::ClientAuthenticate => self.client_authenticate(&AuthRequest::from_env()?).await,
            Hook::ClientConnect => self.client_connect(&ConnectRequest::from_env()?).await.map(|_| ()),
            Hook::ClientDisconnect => self.client_disconnect(&DisconnectRequest::from_env()?).await.map(|_| ()),
        }
    }

    /// Write the server configuration and make sure a CRL file exists
    pub async fn pre_start(&self) -> GateResult<()> {
        self.settings.reload()?;

        let server = ServerConfig::from_settings(self.settings.as_ref(), &self.config).await?;
        let text = server.render()?;
        write_secure_config(&self.config.paths.server_config_file, &text, 0o600).await?;

        if ensure_placeholder(&self.config.paths.crl_file)? {
            info!("Created empty CRL at {:?}", self.config.paths.crl_file);
        }
        info!("Server configuration written to {:?}", self.config.paths.server_config_file);
        Ok(())
    }

    /// Build the firewall state for a freshly started daemon
    pub async fn post_start(&self) -> GateResult<()> {
        self.settings.reload()?;
        // render first so a configuration error aborts before any teardown
        let rules = self.access.compiler().render_top_level_rules()?;

        self.post_stop().await?;

        let compiler = self.access.compiler();
        if !compiler.create_base_chains().await {
            warn!("Failed to create base chains");
        }
        // persist only what was appended
        let applied = compiler.apply_rules(&rules).await;
        let groups = self.access.rebuild_all().await?;

        let lines: Vec<String> = applied.iter().map(FilterRule::to_line).collect();
        self.settings.set_list(keys::VPN_FIREWALL_RULES, &lines)?;
        self.settings.set_bool(keys::VPN_RESTART_PENDING, false)?;

        info!("Firewall ready: {} top-level rules, {} group chains", lines.len(), groups);
        Ok(())
    }

    /// Remove everything post-start created and drop all sessions
    pub async fn post_stop(&self) -> GateResult<()> {
        self.settings.reload()?;
        let compiler = self.access.compiler();

        let rules: Vec<FilterRule> = self
            .settings
            .get_list(keys::VPN_FIREWALL_RULES)
            .iter()
            .filter_map(|line| match FilterRule::parse(line) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("Skipping persisted rule: {}", e);
                    None
                }
            })
            .collect();
        let removed = compiler.remove_rules(&rules).await;

        if !compiler.delete_base_chains().await {
            warn!("Failed to delete base chains");
        }
        self.settings.delete(keys::VPN_FIREWALL_RULES)?;

        let state = self.access.store().load()?;
        for group in state.enabled_groups() {
            compiler.delete_group_chain(&group.id).await;
        }
        let orphans = compiler.delete_orphan_group_chains().await;
        if orphans > 0 {
            debug!("Removed {} leftover group chains", orphans);
        }

        let sessions = self.access.flush_sessions().await?;
        info!("Firewall torn down: {} top-level rules removed, {} sessions flushed", removed, sessions);
        Ok(())
    }

    /// Accept or refuse a user by email and optional second factor
    pub async fn client_authenticate(&self, request: &AuthRequest) -> GateResult<()> {
        let state = self.access.store().load()?;
        let Some(user) = state.user_by_email(&request.username) else {
            warn!("Authentication for unknown user {}", request.username);
            return Err(GateError::AccessRejected(format!("user with username {} not found", request.username)));
        };

        let active = state.group(user.group_id).map(|g| user.is_active(g)).unwrap_or(false);
        if !active {
            return self.reject(user.id, "User is not currently active.");
        }

        let mfa_required = user.mfa_enabled || self.settings.get_bool(keys::APP_MFA_REQUIRED, false);
        if mfa_required && !user.verify_mfa_code(&request.password) {
            return self.reject(user.id, "User two-factor authentication code invalid.");
        }

        info!("User {} authenticated", user.email);
        Ok(())
    }

    fn reject(&self, user_id: uuid::Uuid, reason: &str) -> GateResult<()> {
        warn!("Rejecting user {}: {}", user_id, reason);
        self.access.record_event(Event::new(EVENT_ERROR, user_id, reason))?;
        Err(GateError::AccessRejected(reason.to_string()))
    }

    /// Admit a device by certificate fingerprint and open its session
    pub async fn client_connect(&self, request: &ConnectRequest) -> GateResult<Session> {
        validate_ipv4(&request.virtual_ip)?;

        let state = self.access.store().load()?;
        let device = state
            .device_by_fingerprint(&request.fingerprint)
            .cloned()
            .ok_or_else(|| {
                warn!("Unknown device with fingerprint {}", request.fingerprint);
                GateError::AccessRejected(format!("unknown device with fingerprint: {}", request.fingerprint))
            })?;

        let session = Session {
            common_name: request.common_name.clone(),
            device_id: device.id,
            platform: request.platform.clone(),
            virtual_ip: request.virtual_ip.clone(),
            remote_addr: request.remote_addr(),
            connected_at: Utc::now(),
        };
        self.access.create_session(session.clone()).await?;

        let detail = format!("Device {} connected from {}", device.name, request.trusted_ip);
        self.access.store().update(|state| {
            state.record(Event::new(EVENT_CONNECT, device.user_id, detail.clone()));
            if let Some(device) = state.device_mut(device.id) {
                device.last_seen = Some(session.connected_at);
            }
            Ok(())
        })?;

        info!("{} connected as {}", session.common_name, session.virtual_ip);
        Ok(session)
    }

    /// Close a session; a repeated disconnect is a no-op
    pub async fn client_disconnect(&self, request: &DisconnectRequest) -> GateResult<Option<Session>> {
        let Some(session) = self.access.delete_session(&request.common_name).await? else {
            debug!("Disconnect for unknown session {}", request.common_name);
            return Ok(None);
        };

        let duration = format_duration(session.duration_secs(Utc::now()));
        let state = self.access.store().load()?;
        match state.device(session.device_id) {
            Some(device) => {
                let detail = format!(
                    "Device {} disconnected from {} after {}",
                    device.name, request.trusted_ip, duration
                );
                self.access.record_event(Event::new(EVENT_DISCONNECT, device.user_id, detail))?;
            }
            None => warn!("Session {} belonged to a deleted device", session.common_name),
        }

        info!("{} disconnected after {}", session.common_name, duration);
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_names_match_cli() {
        use clap::ValueEnum;

        for hook in Hook::value_variants() {
            let parsed = Hook::from_str(hook.as_str(), false).unwrap();
            assert_eq!(&parsed, hook);
        }
        assert!(Hook::from_str("restart", false).is_err());
    }
}
