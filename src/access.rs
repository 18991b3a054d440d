//! Access policy mutations with their firewall and revocation side effects
//!
//! Every change to sessions, groups, rules, users or devices that affects the
//! packet filter goes through here, and each operation calls the compiler
//! itself. Entity changes are committed first under the store lock; filter
//! updates follow and degrade to warnings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GateError, GateResult};
use crate::firewall::FirewallCompiler;
use crate::model::{validate_rule, Device, Event, FirewallRule, Group, Session, User};
use crate::pki::{KeyPair, PkiEngine};
use crate::revocation::append_entry;
use crate::store::{State, StateStore};
use crate::vpn::management;

/// Lifetime of a device certificate
pub const CLIENT_VALIDITY_DAYS: u32 = 3650;

/// A session paired with the group its jump rule points at
type Placed = (Session, Option<Uuid>);

fn place(state: &State, session: Session) -> Placed {
    let group = state.group_for_device(session.device_id).map(|g| g.id);
    (session, group)
}

pub struct AccessService {
    store: Arc<StateStore>,
    compiler: Arc<FirewallCompiler>,
    pki: PkiEngine,
    management_socket: Option<PathBuf>,
}

impl AccessService {
    pub fn new(store: Arc<StateStore>, compiler: Arc<FirewallCompiler>, pki: PkiEngine) -> Self {
        Self {
            store,
            compiler,
            pki,
            management_socket: None,
        }
    }

    /// Force-disconnect terminated sessions through this management socket
    pub fn with_management_socket(mut self, path: &Path) -> Self {
        self.management_socket = Some(path.to_path_buf());
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn compiler(&self) -> &FirewallCompiler {
        &self.compiler
    }

    pub fn record_event(&self, event: Event) -> GateResult<()> {
        self.store.update(|state| {
            state.record(event);
            Ok(())
        })
    }

    // ---- sessions ----

    /// Register a session and add its jump rule
    ///
    /// A stale session holding the same common name or virtual IP is replaced.
    pub async fn create_session(&self, session: Session) -> GateResult<()> {
        let (group_id, stale) = self.store.update(|state| {
            let group_id = state
                .group_for_device(session.device_id)
                .map(|g| g.id)
                .ok_or_else(|| GateError::NotFound(format!("group for device {}", session.device_id)))?;

            let mut stale = Vec::new();
            state.sessions.retain(|s| {
                let replaced = s.common_name == session.common_name || s.virtual_ip == session.virtual_ip;
                if replaced {
                    stale.push(s.clone());
                }
                !replaced
            });
            let stale: Vec<Placed> = stale.into_iter().map(|s| place(state, s)).collect();

            state.sessions.push(session.clone());
            Ok((group_id, stale))
        })?;

        for (old, group) in stale {
            warn!("Replacing stale session {} ({})", old.common_name, old.virtual_ip);
            if let Some(group) = group {
                self.compiler.remove_session_jump(&old.virtual_ip, &group).await;
            }
        }

        if !self.compiler.add_session_jump(&session.virtual_ip, &group_id).await {
            warn!("Failed to add jump rule for session {}", session.common_name);
        }
        info!("Session {} created for {}", session.common_name, session.virtual_ip);
        Ok(())
    }

    /// Forget a session and remove its jump rule; `None` if it was not found
    pub async fn delete_session(&self, common_name: &str) -> GateResult<Option<Session>> {
        let removed = self.store.update(|state| {
            let Some(index) = state.sessions.iter().position(|s| s.common_name == common_name) else {
                return Ok(None);
            };
            let session = state.sessions.remove(index);
            Ok(Some(place(state, session)))
        })?;

        let Some((session, group)) = removed else {
            debug!("No session {} to delete", common_name);
            return Ok(None);
        };

        if let Some(group) = group {
            self.compiler.remove_session_jump(&session.virtual_ip, &group).await;
        }
        info!("Session {} deleted", common_name);
        Ok(Some(session))
    }

    /// Drop every session record
    pub async fn flush_sessions(&self) -> GateResult<usize> {
        let removed = self.store.update(|state| {
            let sessions = std::mem::take(&mut state.sessions);
            Ok(sessions.into_iter().map(|s| place(state, s)).collect::<Vec<_>>())
        })?;

        for (session, group) in &removed {
            if let Some(group) = group {
                self.compiler.remove_session_jump(&session.virtual_ip, group).await;
            }
        }

        if !removed.is_empty() {
            info!("Flushed {} sessions", removed.len());
        }
        Ok(removed.len())
    }

    /// Disconnect a live session and forget it
    pub async fn terminate_session(&self, common_name: &str) -> GateResult<Option<Session>> {
        self.kill(common_name).await;
        self.delete_session(common_name).await
    }

    async fn kill(&self, common_name: &str) {
        let Some(path) = &self.management_socket else {
            return;
        };
        match management::kill_client(path, common_name).await {
            Ok(response) => debug!("kill {}: {}", common_name, response.trim_end()),
            Err(e) => warn!("Failed to disconnect {}: {}", common_name, e),
        }
    }

    async fn terminate_all(&self, sessions: Vec<Session>) -> GateResult<()> {
        for session in sessions {
            self.terminate_session(&session.common_name).await?;
        }
        Ok(())
    }

    // ---- groups and rules ----

    /// Create or update a group
    ///
    /// An enabled group gets its chain rebuilt; a disabled one loses its
    /// sessions and its chain.
    pub async fn save_group(&self, group: Group) -> GateResult<()> {
        let (rules, sessions) = self.store.update(|state| {
            match state.groups.iter_mut().find(|g| g.id == group.id) {
                Some(existing) => *existing = group.clone(),
                None => state.groups.push(group.clone()),
            }

            let sessions = if group.is_enabled {
                Vec::new()
            } else {
                let members: Vec<Uuid> = state.users.iter().filter(|u| u.group_id == group.id).map(|u| u.id).collect();
                state.sessions_of_users(&members)
            };
            Ok((state.group_rules(group.id), sessions))
        })?;

        if group.is_enabled {
            self.refresh_group_chain(&group, &rules).await;
        } else {
            self.terminate_all(sessions).await?;
            self.compiler.delete_group_chain(&group.id).await;
        }
        Ok(())
    }

    /// Delete a group that has no members, with its rules and chain
    pub async fn delete_group(&self, group_id: Uuid) -> GateResult<()> {
        self.store.update(|state| {
            if state.users.iter().any(|u| u.group_id == group_id) {
                return Err(GateError::InvalidParameter(format!("group {} still has users", group_id)));
            }
            let before = state.groups.len();
            state.groups.retain(|g| g.id != group_id);
            if state.groups.len() == before {
                return Err(GateError::NotFound(format!("group {}", group_id)));
            }
            state.rules.retain(|r| r.group_id != group_id);
            Ok(())
        })?;

        self.compiler.delete_group_chain(&group_id).await;
        Ok(())
    }

    pub async fn save_rule(&self, rule: FirewallRule) -> GateResult<()> {
        validate_rule(&rule)?;

        let (group, rules) = self.store.update(|state| {
            let group = state
                .group(rule.group_id)
                .cloned()
                .ok_or_else(|| GateError::NotFound(format!("group {}", rule.group_id)))?;

            match state.rules.iter_mut().find(|r| r.id == rule.id) {
                Some(existing) => *existing = rule.clone(),
                None => state.rules.push(rule.clone()),
            }
            Ok((group, state.group_rules(rule.group_id)))
        })?;

        self.refresh_group_chain(&group, &rules).await;
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: Uuid) -> GateResult<()> {
        let (group, rules) = self.store.update(|state| {
            let index = state
                .rules
                .iter()
                .position(|r| r.id == rule_id)
                .ok_or_else(|| GateError::NotFound(format!("rule {}", rule_id)))?;
            let rule = state.rules.remove(index);
            Ok((state.group(rule.group_id).cloned(), state.group_rules(rule.group_id)))
        })?;

        if let Some(group) = group {
            self.refresh_group_chain(&group, &rules).await;
        }
        Ok(())
    }

    async fn refresh_group_chain(&self, group: &Group, rules: &[FirewallRule]) {
        if group.is_enabled && !self.compiler.rebuild_group_chain(group, rules).await {
            warn!("Chain for group '{}' was only partially rebuilt", group.name);
        }
    }

    /// Rebuild the chain of every enabled group
    pub async fn rebuild_all(&self) -> GateResult<usize> {
        let state = self.store.load()?;
        let mut rebuilt = 0;
        for group in state.enabled_groups() {
            self.refresh_group_chain(group, &state.group_rules(group.id)).await;
            rebuilt += 1;
        }
        Ok(rebuilt)
    }

    // ---- users and devices ----

    /// Create or update a user
    ///
    /// Deactivation terminates the user's sessions; a group change re-points
    /// each live session at the new group's chain.
    pub async fn save_user(&self, user: User) -> GateResult<()> {
        let (previous, active, sessions) = self.store.update(|state| {
            let group = state
                .group(user.group_id)
                .cloned()
                .ok_or_else(|| GateError::NotFound(format!("group {}", user.group_id)))?;

            if state.users.iter().any(|u| u.id != user.id && u.email.eq_ignore_ascii_case(&user.email)) {
                return Err(GateError::AlreadyExists(format!("user {}", user.email)));
            }

            let previous = match state.users.iter_mut().find(|u| u.id == user.id) {
                Some(existing) => Some(std::mem::replace(existing, user.clone())),
                None => {
                    state.users.push(user.clone());
                    None
                }
            };
            Ok((previous, user.is_active(&group), state.sessions_of_users(&[user.id])))
        })?;

        if !active {
            return self.terminate_all(sessions).await;
        }

        if let Some(previous) = previous.filter(|p| p.group_id != user.group_id) {
            for session in &sessions {
                self.compiler.remove_session_jump(&session.virtual_ip, &previous.group_id).await;
                self.compiler.add_session_jump(&session.virtual_ip, &user.group_id).await;
            }
            info!("Moved {} sessions of {} to group {}", sessions.len(), user.email, user.group_id);
        }
        Ok(())
    }

    /// Register a device without key material
    pub fn add_device(&self, user_id: Uuid, name: &str) -> GateResult<Device> {
        let name = name.trim();
        if name.is_empty() || name.contains(':') {
            return Err(GateError::InvalidParameter(format!("Invalid device name: {:?}", name)));
        }

        self.store.update(|state| {
            if state.user(user_id).is_none() {
                return Err(GateError::NotFound(format!("user {}", user_id)));
            }
            if state.devices.iter().any(|d| d.user_id == user_id && d.name == name) {
                return Err(GateError::AlreadyExists(format!("device {}", name)));
            }
            let device = Device::new(user_id, name);
            state.devices.push(device.clone());
            Ok(device)
        })
    }

    /// Issue the one and only keypair of a device
    pub fn issue_device_keypair(&self, device_id: Uuid) -> GateResult<KeyPair> {
        let state = self.store.load()?;
        let device = state
            .device(device_id)
            .ok_or_else(|| GateError::NotFound(format!("device {}", device_id)))?;
        if device.is_issued() {
            return Err(GateError::AlreadyExists(format!("keypair for device {}", device_id)));
        }
        let user = state
            .user(device.user_id)
            .ok_or_else(|| GateError::NotFound(format!("user {}", device.user_id)))?;

        let keypair = self.pki.create_client_keypair(&device.common_name(user), CLIENT_VALIDITY_DAYS)?;
        let fingerprint = keypair.fingerprint()?;
        let serial = keypair.serial()?;

        self.store.update(|state| {
            let device = state
                .device_mut(device_id)
                .ok_or_else(|| GateError::NotFound(format!("device {}", device_id)))?;
            // a concurrent issue may have won while the key was generated
            if device.is_issued() {
                return Err(GateError::AlreadyExists(format!("keypair for device {}", device_id)));
            }
            device.fingerprint = fingerprint.clone();
            device.serial = serial.clone();
            Ok(())
        })?;

        info!("Issued keypair {} for device {}", fingerprint, device_id);
        Ok(keypair)
    }

    /// Undo an issuance whose client configuration never reached the operator
    ///
    /// The certificate is revoked and the device can be issued again.
    pub fn withdraw_device_keypair(&self, device_id: Uuid, keypair: &KeyPair) -> GateResult<()> {
        let fingerprint = keypair.fingerprint()?;
        self.store.update(|state| {
            let device = state
                .device_mut(device_id)
                .ok_or_else(|| GateError::NotFound(format!("device {}", device_id)))?;
            if device.fingerprint != fingerprint {
                return Err(GateError::InvalidParameter(format!(
                    "device {} holds a different keypair",
                    device_id
                )));
            }
            let serial = std::mem::take(&mut device.serial);
            device.fingerprint.clear();
            append_entry(&mut state.revoked, &serial);
            Ok(())
        })?;

        warn!("Withdrew keypair {} of device {}", fingerprint, device_id);
        Ok(())
    }

    /// Delete a device, revoking its certificate and ending its sessions
    pub async fn delete_device(&self, device_id: Uuid) -> GateResult<Device> {
        let (device, sessions) = self.store.update(|state| {
            let index = state
                .devices
                .iter()
                .position(|d| d.id == device_id)
                .ok_or_else(|| GateError::NotFound(format!("device {}", device_id)))?;

            let sessions: Vec<Placed> = state
                .sessions
                .iter()
                .filter(|s| s.device_id == device_id)
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
                .map(|s| place(state, s))
                .collect();
            state.sessions.retain(|s| s.device_id != device_id);

            let device = state.devices.remove(index);
            if !device.serial.is_empty() {
                append_entry(&mut state.revoked, &device.serial);
            }
            Ok((device, sessions))
        })?;

        for (session, group) in sessions {
            self.kill(&session.common_name).await;
            if let Some(group) = group {
                self.compiler.remove_session_jump(&session.virtual_ip, &group).await;
            }
        }

        info!("Deleted device {} ({})", device.name, device_id);
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::compiler::{chain_name, CLIENTS_CHAIN};
    use crate::firewall::MemoryFilter;
    use crate::model::{Protocol, RuleAction};
    use crate::settings::{keys, MemorySettings};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        filter: Arc<MemoryFilter>,
        access: AccessService,
        group: Group,
        user: User,
        device: Device,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(MemorySettings::with([(keys::VPN_SUBNET, "10.8.0.0/24")]));
        let filter = Arc::new(MemoryFilter::new());
        let compiler = Arc::new(FirewallCompiler::new(filter.clone(), settings.clone(), "filter"));
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
        let access = AccessService::new(store, compiler.clone(), PkiEngine::new(settings));

        compiler.create_base_chains().await;

        let group = Group::new("staff");
        access.save_group(group.clone()).await.unwrap();
        let user = User::new("alice@example.com", group.id);
        access.save_user(user.clone()).await.unwrap();
        let device = access.add_device(user.id, "laptop").unwrap();

        Fixture { _dir: dir, filter, access, group, user, device }
    }

    fn session(device: &Device, ip: &str) -> Session {
        Session {
            common_name: "alice@example.com:laptop".into(),
            device_id: device.id,
            platform: "linux".into(),
            virtual_ip: ip.into(),
            remote_addr: "203.0.113.9:51000".into(),
            connected_at: Utc::now(),
        }
    }

    fn clients(f: &Fixture) -> Vec<String> {
        f.filter
            .rules("filter", CLIENTS_CHAIN)
            .unwrap_or_default()
            .iter()
            .map(|r| r.join(" "))
            .collect()
    }

    #[tokio::test]
    async fn test_session_lifecycle_drives_jump_rule() {
        let f = fixture().await;
        let chain = chain_name(&f.group.id);

        f.access.create_session(session(&f.device, "10.8.0.2")).await.unwrap();
        assert_eq!(clients(&f), vec![format!("-s 10.8.0.2 -j {}", chain)]);

        assert!(f.access.delete_session("alice@example.com:laptop").await.unwrap().is_some());
        assert!(f.access.delete_session("alice@example.com:laptop").await.unwrap().is_none());
        assert!(clients(&f).is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_stale_session() {
        let f = fixture().await;
        f.access.create_session(session(&f.device, "10.8.0.2")).await.unwrap();
        f.access.create_session(session(&f.device, "10.8.0.3")).await.unwrap();

        let state = f.access.store().load().unwrap();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions[0].virtual_ip, "10.8.0.3");
        assert_eq!(clients(&f).len(), 1);
        assert!(clients(&f)[0].starts_with("-s 10.8.0.3 "));
    }

    #[tokio::test]
    async fn test_rule_changes_rebuild_chain() {
        let f = fixture().await;
        let chain = chain_name(&f.group.id);

        let rule = FirewallRule::new(f.group.id, RuleAction::Accept).protocol(Protocol::Tcp).port("443");
        f.access.save_rule(rule.clone()).await.unwrap();
        assert_eq!(f.filter.rules("filter", &chain).unwrap().len(), 2);

        let invalid = FirewallRule::new(f.group.id, RuleAction::Accept).port("22");
        assert!(f.access.save_rule(invalid).await.is_err());

        f.access.delete_rule(rule.id).await.unwrap();
        let rules = f.filter.rules("filter", &chain).unwrap();
        assert_eq!(rules, vec![vec!["-j".to_string(), "DROP".to_string()]]);
    }

    #[tokio::test]
    async fn test_disabling_group_ends_sessions_and_chain() {
        let f = fixture().await;
        f.access.create_session(session(&f.device, "10.8.0.2")).await.unwrap();

        let mut group = f.group.clone();
        group.is_enabled = false;
        f.access.save_group(group).await.unwrap();

        assert!(f.access.store().load().unwrap().sessions.is_empty());
        assert!(f.filter.rules("filter", &chain_name(&f.group.id)).is_none());
        assert!(clients(&f).is_empty());
    }

    #[tokio::test]
    async fn test_group_change_repoints_sessions() {
        let f = fixture().await;
        let other = Group::new("contractors");
        f.access.save_group(other.clone()).await.unwrap();
        f.access.create_session(session(&f.device, "10.8.0.2")).await.unwrap();

        let mut user = f.user.clone();
        user.group_id = other.id;
        f.access.save_user(user).await.unwrap();

        assert_eq!(clients(&f), vec![format!("-s 10.8.0.2 -j {}", chain_name(&other.id))]);
    }

    #[tokio::test]
    async fn test_deactivating_user_ends_sessions() {
        let f = fixture().await;
        f.access.create_session(session(&f.device, "10.8.0.2")).await.unwrap();

        let mut user = f.user.clone();
        user.is_enabled = false;
        f.access.save_user(user).await.unwrap();
        assert!(clients(&f).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let f = fixture().await;
        let twin = User::new("ALICE@example.com", f.group.id);
        assert!(matches!(f.access.save_user(twin).await, Err(GateError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_group_with_members_cannot_be_deleted() {
        let f = fixture().await;
        assert!(f.access.delete_group(f.group.id).await.is_err());

        let empty = Group::new("empty");
        f.access.save_group(empty.clone()).await.unwrap();
        f.access.delete_group(empty.id).await.unwrap();
        assert!(f.filter.rules("filter", &chain_name(&empty.id)).is_none());
    }

    #[tokio::test]
    async fn test_delete_device_revokes_serial() {
        let f = fixture().await;
        f.access
            .store()
            .update(|state| {
                let device = state.device_mut(f.device.id).unwrap();
                device.serial = "4242".into();
                device.fingerprint = "aa:bb".into();
                Ok(())
            })
            .unwrap();
        f.access.create_session(session(&f.device, "10.8.0.2")).await.unwrap();

        let deleted = f.access.delete_device(f.device.id).await.unwrap();
        assert_eq!(deleted.serial, "4242");

        let state = f.access.store().load().unwrap();
        assert!(state.devices.is_empty());
        assert!(state.sessions.is_empty());
        assert_eq!(state.revoked.len(), 1);
        assert_eq!(state.revoked[0].serial, "4242");
        assert!(clients(&f).is_empty());
    }

    #[tokio::test]
    async fn test_unissued_device_delete_revokes_nothing() {
        let f = fixture().await;
        f.access.delete_device(f.device.id).await.unwrap();
        assert!(f.access.store().load().unwrap().revoked.is_empty());
        assert!(matches!(f.access.delete_device(f.device.id).await, Err(GateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_withdrawn_keypair_can_be_reissued() {
        let f = fixture().await;
        f.access.pki.create_certificate_authority().unwrap();

        let first = f.access.issue_device_keypair(f.device.id).unwrap();
        assert!(matches!(f.access.issue_device_keypair(f.device.id), Err(GateError::AlreadyExists(_))));

        f.access.withdraw_device_keypair(f.device.id, &first).unwrap();
        let state = f.access.store().load().unwrap();
        assert!(!state.device(f.device.id).unwrap().is_issued());
        assert_eq!(state.revoked.len(), 1);
        assert_eq!(state.revoked[0].serial, first.serial().unwrap());

        let second = f.access.issue_device_keypair(f.device.id).unwrap();
        assert!(f.access.withdraw_device_keypair(f.device.id, &first).is_err());
        let state = f.access.store().load().unwrap();
        assert_eq!(state.device(f.device.id).unwrap().fingerprint, second.fingerprint().unwrap());
    }

    #[tokio::test]
    async fn test_add_device_validation() {
        let f = fixture().await;
        assert!(f.access.add_device(f.user.id, "a:b").is_err());
        assert!(f.access.add_device(f.user.id, "laptop").is_err());
        assert!(f.access.add_device(Uuid::new_v4(), "phone").is_err());
    }
}
