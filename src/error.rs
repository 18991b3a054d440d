//! Error types for vpngate

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// External command exited unsuccessfully
    #[error("Command '{cmd}' failed{}: {stderr}", .code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Missing CA, missing required setting, unreadable config
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Key generation, signing or PEM handling failed
    #[error("PKI error: {0}")]
    Pki(String),
    /// The daemon control endpoint could not be used
    #[error("Control socket error: {0}")]
    ControlSocket(String),
    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    /// A client was refused by a hook; terminal, never retried
    #[error("Access rejected: {0}")]
    AccessRejected(String),
    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl GateError {
    /// Whether this error is a deliberate refusal of a client
    pub fn is_rejection(&self) -> bool {
        matches!(self, GateError::AccessRejected(_))
    }
}

impl From<openssl::error::ErrorStack> for GateError {
    fn from(error: openssl::error::ErrorStack) -> Self {
        GateError::Pki(error.to_string())
    }
}

impl From<rcgen::Error> for GateError {
    fn from(error: rcgen::Error) -> Self {
        GateError::Pki(error.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(error: serde_json::Error) -> Self {
        GateError::ParseError(error.to_string())
    }
}

impl From<toml::de::Error> for GateError {
    fn from(error: toml::de::Error) -> Self {
        GateError::ParseError(error.to_string())
    }
}

impl From<toml::ser::Error> for GateError {
    fn from(error: toml::ser::Error) -> Self {
        GateError::ParseError(error.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = GateError::CommandFailed {
            cmd: "iptables -t filter -N X".to_string(),
            code: Some(1),
            stderr: "Chain already exists.".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command 'iptables -t filter -N X' failed with code 1: Chain already exists."
        );

        let err = GateError::CommandFailed {
            cmd: "iptables".to_string(),
            code: None,
            stderr: "killed".to_string(),
        };
        assert_eq!(err.to_string(), "Command 'iptables' failed: killed");
    }

    #[test]
    fn test_is_rejection() {
        assert!(GateError::AccessRejected("unknown device".into()).is_rejection());
        assert!(!GateError::ConfigError("no CA".into()).is_rejection());
    }
}
