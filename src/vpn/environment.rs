//! Hook environment contract
//!
//! OpenVPN passes client details to its scripts through environment
//! variables with fixed names.

use crate::error::{GateError, GateResult};

pub const USERNAME: &str = "username";
pub const PASSWORD: &str = "password";
pub const COMMON_NAME: &str = "common_name";
pub const PLATFORM: &str = "IV_PLAT";
pub const TLS_DIGEST: &str = "tls_digest_0";
pub const VIRTUAL_IP: &str = "ifconfig_pool_remote_ip";
pub const TRUSTED_IP: &str = "trusted_ip";
pub const TRUSTED_PORT: &str = "trusted_port";

fn required<F>(lookup: &F, name: &str) -> GateResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GateError::InvalidParameter(format!("environment variable '{}' is not set", name)))
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// `client-authenticate` input
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequest {
    pub username: String,
    /// Carries the second-factor code, may be empty
    pub password: String,
}

impl AuthRequest {
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> GateResult<Self> {
        Ok(Self {
            username: required(&lookup, USERNAME)?,
            password: lookup(PASSWORD).unwrap_or_default(),
        })
    }

    pub fn from_env() -> GateResult<Self> {
        Self::from_lookup(process_env)
    }
}

/// `client-connect` input
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub common_name: String,
    pub platform: String,
    /// SHA-1 digest of the client certificate
    pub fingerprint: String,
    pub virtual_ip: String,
    pub trusted_ip: String,
    pub trusted_port: String,
}

impl ConnectRequest {
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> GateResult<Self> {
        Ok(Self {
            common_name: required(&lookup, COMMON_NAME)?,
            platform: lookup(PLATFORM).unwrap_or_default(),
            fingerprint: required(&lookup, TLS_DIGEST)?,
            virtual_ip: required(&lookup, VIRTUAL_IP)?,
            trusted_ip: required(&lookup, TRUSTED_IP)?,
            trusted_port: lookup(TRUSTED_PORT).unwrap_or_default(),
        })
    }

    pub fn from_env() -> GateResult<Self> {
        Self::from_lookup(process_env)
    }

    /// `address:port` the client connected from
    pub fn remote_addr(&self) -> String {
        if self.trusted_port.is_empty() {
            self.trusted_ip.clone()
        } else {
            format!("{}:{}", self.trusted_ip, self.trusted_port)
        }
    }
}

/// `client-disconnect` input
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectRequest {
    pub common_name: String,
    pub trusted_ip: String,
}

impl DisconnectRequest {
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> GateResult<Self> {
        Ok(Self {
            common_name: required(&lookup, COMMON_NAME)?,
            trusted_ip: lookup(TRUSTED_IP).unwrap_or_default(),
        })
    }

    pub fn from_env() -> GateResult<Self> {
        Self::from_lookup(process_env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_connect_request() {
        let request = ConnectRequest::from_lookup(lookup_from(&[
            (COMMON_NAME, "alice@example.com:laptop"),
            (PLATFORM, "linux"),
            (TLS_DIGEST, "aa:bb"),
            (VIRTUAL_IP, "10.8.0.2"),
            (TRUSTED_IP, "203.0.113.9"),
            (TRUSTED_PORT, "51000"),
        ]))
        .unwrap();
        assert_eq!(request.remote_addr(), "203.0.113.9:51000");
        assert_eq!(request.platform, "linux");
    }

    #[test]
    fn test_missing_required_variable() {
        let err = ConnectRequest::from_lookup(lookup_from(&[(COMMON_NAME, "x")])).unwrap_err();
        assert!(matches!(err, GateError::InvalidParameter(_)));

        let auth = AuthRequest::from_lookup(lookup_from(&[(USERNAME, "alice@example.com")])).unwrap();
        assert_eq!(auth.password, "");
        assert!(AuthRequest::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    #[serial]
    fn test_from_process_environment() {
        std::env::set_var(COMMON_NAME, "bob@example.com:phone");
        std::env::set_var(TRUSTED_IP, "198.51.100.7");
        let request = DisconnectRequest::from_env().unwrap();
        std::env::remove_var(COMMON_NAME);
        std::env::remove_var(TRUSTED_IP);

        assert_eq!(request.common_name, "bob@example.com:phone");
        assert_eq!(request.trusted_ip, "198.51.100.7");
    }
}
