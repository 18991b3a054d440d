//! Entities shared by the hooks and the admin side
//!
//! Identities (users, devices), access policy (groups, firewall rules),
//! ephemeral sessions and the append-only revocation and audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::error::{GateError, GateResult};

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub group_id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub mfa_enabled: bool,
    /// Base32 TOTP secret
    #[serde(default)]
    pub mfa_secret: String,
}

impl User {
    pub fn new(email: &str, group_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            group_id,
            name: String::new(),
            is_admin: false,
            is_enabled: true,
            mfa_enabled: false,
            mfa_secret: String::new(),
        }
    }

    /// Whether the user may connect, taking the group flag into account
    pub fn is_active(&self, group: &Group) -> bool {
        self.is_enabled && group.is_enabled
    }

    /// Check a TOTP code against the user's secret
    pub fn verify_mfa_code(&self, code: &str) -> bool {
        let secret = match Secret::Encoded(self.mfa_secret.clone()).to_bytes() {
            Ok(secret) if !secret.is_empty() => secret,
            _ => return false,
        };

        let totp = TOTP::new_unchecked(Algorithm::SHA1, TOTP_DIGITS, TOTP_SKEW, TOTP_STEP, secret);
        totp.check_current(code.trim()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            is_enabled: true,
        }
    }
}

/// Verdict of a firewall rule
///
/// Ordered so that sorting rules in descending order puts `Accept` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Drop,
    Accept,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Accept => "ACCEPT",
            RuleAction::Drop => "DROP",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleAction {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACCEPT" => Ok(RuleAction::Accept),
            "DROP" => Ok(RuleAction::Drop),
            _ => Err(GateError::InvalidParameter(format!("Invalid rule action: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    All,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::All => "all",
        }
    }

    /// Whether destination ports can be matched for this protocol
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "all" => Ok(Protocol::All),
            _ => Err(GateError::InvalidParameter(format!("Invalid protocol: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirewallRule {
    pub id: Uuid,
    pub group_id: Uuid,
    pub action: RuleAction,
    /// IPv4 address or CIDR block
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// Single port, `low:high` range, or a comma-separated list of both
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

impl FirewallRule {
    pub fn new(group_id: Uuid, action: RuleAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            action,
            destination: None,
            protocol: None,
            port: None,
            is_enabled: true,
        }
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn port(mut self, port: &str) -> Self {
        self.port = Some(port.to_string());
        self
    }
}

/// A durable device identity belonging to a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// Certificate fingerprint; empty until a keypair is issued
    #[serde(default)]
    pub fingerprint: String,
    /// Certificate serial (decimal); empty until a keypair is issued
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(user_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            fingerprint: String::new(),
            serial: String::new(),
            last_seen: None,
        }
    }

    pub fn is_issued(&self) -> bool {
        !self.fingerprint.is_empty() || !self.serial.is_empty()
    }

    /// Certificate common name, `<email>:<device name>`
    pub fn common_name(&self, user: &User) -> String {
        format!("{}:{}", user.email, self.name)
    }
}

/// One active connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub common_name: String,
    pub device_id: Uuid,
    #[serde(default)]
    pub platform: String,
    pub virtual_ip: String,
    /// `address:port` the client connected from
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    /// Whole seconds since the session was created
    pub fn duration_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.connected_at).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevokedEntry {
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
}

/// Audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    pub user_id: Uuid,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: &str, user_id: Uuid, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            user_id,
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}

/// Format a duration as `42s`, `5m 07s` or `2h 05m 07s`
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        return format!("{}s", secs);
    }

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else {
        format!("{}m {:02}s", mins, secs)
    }
}

/// Validate a rule before it is stored
pub fn validate_rule(rule: &FirewallRule) -> GateResult<()> {
    if let Some(destination) = &rule.destination {
        crate::validation::validate_destination(destination)?;
    }
    if let Some(port) = &rule.port {
        match rule.protocol {
            Some(protocol) if protocol.has_ports() => crate::validation::validate_port_spec(port)?,
            _ => {
                return Err(GateError::InvalidParameter(
                    "Ports require the tcp or udp protocol".to_string(),
                ))
            }
        }
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_action_ordering() {
        let mut actions = vec![RuleAction::Drop, RuleAction::Accept, RuleAction::Drop];
        actions.sort_by(|a, b| b.cmp(a));
        assert_eq!(actions, vec![RuleAction::Accept, RuleAction::Drop, RuleAction::Drop]);
        assert_eq!("accept".parse::<RuleAction>().unwrap(), RuleAction::Accept);
        assert!("REJECT".parse::<RuleAction>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let rule = FirewallRule::new(Uuid::new_v4(), RuleAction::Accept)
            .protocol(Protocol::Tcp)
            .port("22");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["action"], "ACCEPT");
        assert_eq!(json["protocol"], "tcp");
    }

    #[test]
    fn test_rule_validation() {
        let group = Uuid::new_v4();
        assert!(validate_rule(&FirewallRule::new(group, RuleAction::Drop)).is_ok());
        assert!(validate_rule(
            &FirewallRule::new(group, RuleAction::Accept)
                .destination("10.0.0.0/8")
                .protocol(Protocol::Udp)
                .port("53")
        )
        .is_ok());
        assert!(validate_rule(&FirewallRule::new(group, RuleAction::Accept).port("22")).is_err());
        assert!(validate_rule(
            &FirewallRule::new(group, RuleAction::Accept).protocol(Protocol::All).port("22")
        )
        .is_err());
        assert!(validate_rule(&FirewallRule::new(group, RuleAction::Accept).destination("nope")).is_err());
    }

    #[test]
    fn test_user_activity() {
        let mut group = Group::new("staff");
        let mut user = User::new("alice@example.com", group.id);
        assert!(user.is_active(&group));

        group.is_enabled = false;
        assert!(!user.is_active(&group));

        group.is_enabled = true;
        user.is_enabled = false;
        assert!(!user.is_active(&group));
    }

    #[test]
    fn test_mfa_code() {
        let mut user = User::new("alice@example.com", Uuid::new_v4());
        user.mfa_secret = "JBSWY3DPEHPK3PXP".to_string();

        let secret = Secret::Encoded(user.mfa_secret.clone()).to_bytes().unwrap();
        let totp = TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, secret);
        let code = totp.generate_current().unwrap();

        assert!(user.verify_mfa_code(&code));
        assert!(!user.verify_mfa_code("not-a-code"));

        user.mfa_secret.clear();
        assert!(!user.verify_mfa_code(&code));
    }

    #[test]
    fn test_device_common_name() {
        let user = User::new("alice@example.com", Uuid::new_v4());
        let device = Device::new(user.id, "laptop");
        assert_eq!(device.common_name(&user), "alice@example.com:laptop");
        assert!(!device.is_issued());
    }

    #[test]
    fn test_session_duration() {
        let now = Utc::now();
        let session = Session {
            common_name: "alice@example.com:laptop".into(),
            device_id: Uuid::new_v4(),
            platform: "linux".into(),
            virtual_ip: "10.8.0.2".into(),
            remote_addr: "203.0.113.9:51000".into(),
            connected_at: now - Duration::seconds(3725),
        };
        assert_eq!(session.duration_secs(now), 3725);
        assert_eq!(format_duration(session.duration_secs(now)), "1h 02m 05s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(60), "1m 00s");
        assert_eq!(format_duration(427), "7m 07s");
        assert_eq!(format_duration(36000), "10h 00m 00s");
    }
}
