//! Error types for vpnctl

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// An external command (package manager, service supervisor, ip, wg,
    /// iptables) exited non-zero
    #[error("{step} failed: command '{cmd}'{}: {stderr}", .code.map(|c| format!(" exited with code {}", c)).unwrap_or_default())]
    ExternalFailure {
        step: String,
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    /// External command did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol, peer or user row absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Another lifecycle operation is in flight for the same protocol
    #[error("Busy: {0}")]
    Busy(String),

    /// Address or key collision
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Credential check or access gate refused
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data store error
    #[error("Store error: {0}")]
    Store(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),
}

impl VpnError {
    /// Prefix the failing step onto an external failure so callers can tell
    /// which part of a multi-step operation broke.
    pub fn in_step(self, step: &str) -> Self {
        match self {
            VpnError::ExternalFailure { step: inner, cmd, code, stderr } => VpnError::ExternalFailure {
                step: format!("{}: {}", step, inner),
                cmd,
                code,
                stderr,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(error: serde_json::Error) -> Self {
        VpnError::Parse(error.to_string())
    }
}

impl From<toml::de::Error> for VpnError {
    fn from(error: toml::de::Error) -> Self {
        VpnError::Config(error.to_string())
    }
}

pub type VpnResult<T> = Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_failure_display() {
        let err = VpnError::ExternalFailure {
            step: "bring link up".to_string(),
            cmd: "ip link set up dev wg0".to_string(),
            code: Some(2),
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bring link up failed"));
        assert!(msg.contains("exited with code 2"));
        assert!(msg.contains("Operation not permitted"));
    }

    #[test]
    fn test_in_step_prefixes_external_failures_only() {
        let err = VpnError::ExternalFailure {
            step: "create interface".to_string(),
            cmd: "ip link add dev wg0 type wireguard".to_string(),
            code: None,
            stderr: String::new(),
        }
        .in_step("enable wireguard");
        match err {
            VpnError::ExternalFailure { step, .. } => assert_eq!(step, "enable wireguard: create interface"),
            other => panic!("unexpected error: {}", other),
        }

        let err = VpnError::NotFound("peer".to_string()).in_step("enable wireguard");
        assert!(matches!(err, VpnError::NotFound(_)));
    }
}
