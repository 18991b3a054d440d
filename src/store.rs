//! Entity state shared between hook processes
//!
//! Hooks are separate short-lived processes, so the state document on disk is
//! the only shared memory. Every mutation runs as a read-modify-write under an
//! exclusive `flock` on a sidecar lock file; readers take a shared lock.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::error::{GateError, GateResult};
use crate::model::{Device, Event, FirewallRule, Group, RevokedEntry, Session, User};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub revoked: Vec<RevokedEntry>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl State {
    pub fn user(&self, id: Uuid) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    /// Case-insensitive lookup by email
    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.users.iter().find(|u| u.email.eq_ignore_ascii_case(email.trim()))
    }

    pub fn group(&self, id: Uuid) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn enabled_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| g.is_enabled)
    }

    /// Rules of a group in insertion order
    pub fn group_rules(&self, group_id: Uuid) -> Vec<FirewallRule> {
        self.rules.iter().filter(|r| r.group_id == group_id).cloned().collect()
    }

    pub fn device(&self, id: Uuid) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_mut(&mut self, id: Uuid) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    /// Case-insensitive lookup by certificate fingerprint
    pub fn device_by_fingerprint(&self, fingerprint: &str) -> Option<&Device> {
        let fingerprint = fingerprint.trim();
        if fingerprint.is_empty() {
            return None;
        }
        self.devices.iter().find(|d| d.fingerprint.eq_ignore_ascii_case(fingerprint))
    }

    pub fn session(&self, common_name: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.common_name == common_name)
    }

    /// Group whose chain a device's sessions jump to
    pub fn group_for_device(&self, device_id: Uuid) -> Option<&Group> {
        let device = self.device(device_id)?;
        let user = self.user(device.user_id)?;
        self.group(user.group_id)
    }

    /// Sessions opened by any device of the given users
    pub fn sessions_of_users(&self, user_ids: &[Uuid]) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| {
                self.device(s.device_id)
                    .map(|d| user_ids.contains(&d.user_id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn record(&mut self, event: Event) {
        self.events.push(event);
    }
}

/// JSON state document guarded by an advisory file lock
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Advisory `flock` on a sidecar file, released on drop
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path, exclusive: bool) -> GateResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        // SAFETY: the descriptor stays open for the lifetime of `file`
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(GateError::Io(std::io::Error::last_os_error()));
        }

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: see acquire
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl StateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = path.with_extension("lock");
        Ok(Self { path, lock_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent snapshot of the current state
    pub fn load(&self) -> GateResult<State> {
        let _lock = FileLock::acquire(&self.lock_path, false)?;
        self.read()
    }

    /// Run a mutation as one locked transaction
    ///
    /// The state is written back only when the closure succeeds.
    pub fn update<T, F>(&self, f: F) -> GateResult<T>
    where
        F: FnOnce(&mut State) -> GateResult<T>,
    {
        let _lock = FileLock::acquire(&self.lock_path, true)?;
        let mut state = self.read()?;
        let result = f(&mut state)?;
        self.write(&state)?;
        Ok(result)
    }

    fn read(&self) -> GateResult<State> {
        if !self.path.exists() {
            return Ok(State::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(State::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| GateError::ParseError(format!("Failed to parse state {:?}: {}", self.path, e)))
    }

    fn write(&self, state: &State) -> GateResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("State written to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleAction;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn seeded(dir: &TempDir) -> (StateStore, Uuid, Uuid) {
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let (user_id, device_id) = store
            .update(|state| {
                let group = Group::new("staff");
                let user = User::new("Alice@Example.com", group.id);
                let mut device = Device::new(user.id, "laptop");
                device.fingerprint = "AA:BB:CC".to_string();
                let ids = (user.id, device.id);
                state.groups.push(group);
                state.users.push(user);
                state.devices.push(device);
                Ok(ids)
            })
            .unwrap();
        (store, user_id, device_id)
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("nested").join("state.json")).unwrap();
        let state = store.load().unwrap();
        assert!(state.users.is_empty());
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn test_lookups() {
        let dir = TempDir::new().unwrap();
        let (store, user_id, device_id) = seeded(&dir);
        let state = store.load().unwrap();

        assert_eq!(state.user_by_email("alice@example.com").map(|u| u.id), Some(user_id));
        assert_eq!(state.device_by_fingerprint("aa:bb:cc").map(|d| d.id), Some(device_id));
        assert!(state.device_by_fingerprint("").is_none());
        assert_eq!(state.group_for_device(device_id).map(|g| g.name.as_str()), Some("staff"));
    }

    #[test]
    fn test_failed_update_is_not_written() {
        let dir = TempDir::new().unwrap();
        let (store, _, _) = seeded(&dir);

        let result: GateResult<()> = store.update(|state| {
            state.groups.clear();
            Err(GateError::NotFound("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.load().unwrap().groups.len(), 1);
    }

    #[test]
    fn test_concurrent_updates_serialise() {
        let dir = TempDir::new().unwrap();
        let (store, _, _) = seeded(&dir);
        let store = Arc::new(store);
        let group_id = store.load().unwrap().groups[0].id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update(|state| {
                            state.rules.push(FirewallRule::new(group_id, RuleAction::Accept));
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.load().unwrap().group_rules(group_id).len(), 8);
    }
}
