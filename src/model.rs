//! Persisted rows: protocol instances, peers, users and the access matrix

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::VpnError;

/// Supported tunnel technologies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    WireGuard,
    OpenVpn,
    Pptp,
    L2tp,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::WireGuard, Protocol::OpenVpn, Protocol::Pptp, Protocol::L2tp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::WireGuard => "wireguard",
            Protocol::OpenVpn => "openvpn",
            Protocol::Pptp => "pptp",
            Protocol::L2tp => "l2tp",
        }
    }

    /// Whether this protocol carries per-peer cryptographic identities that
    /// are pushed into a kernel interface.
    pub fn has_peers(&self) -> bool {
        matches!(self, Protocol::WireGuard)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wireguard" | "wg" => Ok(Protocol::WireGuard),
            "openvpn" | "ovpn" => Ok(Protocol::OpenVpn),
            "pptp" => Ok(Protocol::Pptp),
            "l2tp" | "l2tp-ipsec" => Ok(Protocol::L2tp),
            other => Err(VpnError::InvalidParameter(format!("Unknown protocol: {}", other))),
        }
    }
}

/// One row per protocol instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub protocol: Protocol,
    /// Single source of truth for "should be live"
    pub enabled: bool,
    pub listen_port: u16,
    /// Virtual subnet in CIDR form, e.g. "10.8.0.0/24"
    pub subnet: String,
    pub dns: Vec<String>,
    /// Secret material: WireGuard private key, L2TP pre-shared secret
    pub private_key: Option<String>,
    /// Public identity derived from the secret (WireGuard public key)
    pub public_key: Option<String>,
    /// Externally reachable address or hostname handed to clients
    pub server_address: String,
    pub config_path: PathBuf,
    /// Kernel interface (wg0, tun0) or interface pattern (ppp+)
    pub interface: String,
    /// Highest host address ever allocated
    #[serde(default)]
    pub allocation_cursor: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProtocolConfig {
    pub fn dns_list(&self) -> String {
        self.dns.join(", ")
    }

    /// Public endpoint in `host:port` form for client configs
    pub fn endpoint(&self) -> String {
        let host = if self.server_address.is_empty() {
            "YOUR_SERVER_IP"
        } else {
            self.server_address.as_str()
        };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.listen_port)
        } else {
            format!("{}:{}", host, self.listen_port)
        }
    }
}

/// A provisioned client identity scoped to one protocol instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub protocol: Protocol,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub public_key: String,
    /// Issued to the peer; kept so the client config can be regenerated
    pub private_key: String,
    pub preshared_key: String,
    /// Comma separated CIDR list, normally a single /32
    pub allowed_ips: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    pub enabled: bool,
    #[serde(default)]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// VPN end-user account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnUser {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub enabled: bool,
    #[serde(default)]
    pub last_connection: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Join row (user, protocol) -> allowed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolAccess {
    pub user_id: String,
    pub protocol: Protocol,
    pub enabled: bool,
}

/// Equality filter for peer queries
#[derive(Debug, Clone, Default)]
pub struct PeerFilter {
    pub protocol: Option<Protocol>,
    pub enabled: Option<bool>,
    pub owner: Option<String>,
}

impl PeerFilter {
    pub fn protocol(protocol: Protocol) -> Self {
        Self { protocol: Some(protocol), ..Default::default() }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn owner(owner: &str) -> Self {
        Self { owner: Some(owner.to_string()), ..Default::default() }
    }

    pub fn matches(&self, peer: &Peer) -> bool {
        self.protocol.map_or(true, |p| peer.protocol == p)
            && self.enabled.map_or(true, |e| peer.enabled == e)
            && self.owner.as_ref().map_or(true, |o| peer.owner.as_deref() == Some(o.as_str()))
    }
}
