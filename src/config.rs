//! Configuration management for vpnctl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::allocator::ReusePolicy;
use crate::error::{VpnError, VpnResult};
use crate::model::Protocol;
use crate::validation;

/// Main vpnctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub paths: ConfigPaths,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub allocation: AllocationSettings,
    #[serde(default)]
    pub protocols: ProtocolDefaultsTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Host filesystem root every protocol file is resolved under
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// JSON state file used by the file-backed store
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Uplink interface tunnel traffic is masqueraded onto
    #[serde(default = "default_uplink")]
    pub uplink_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Bound for ip/wg/iptables/systemctl invocations (seconds)
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
    /// Bound for package installation (seconds)
    #[serde(default = "default_install_secs")]
    pub install_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationSettings {
    #[serde(default)]
    pub reuse: ReusePolicy,
}

/// Per-protocol defaults applied when a protocol row is first created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDefaults {
    pub listen_port: u16,
    pub subnet: String,
    #[serde(default)]
    pub dns: Vec<String>,
    pub interface: String,
    /// Primary config file, relative to `paths.root`
    pub config_path: PathBuf,
    #[serde(default)]
    pub server_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDefaultsTable {
    #[serde(default = "default_wireguard")]
    pub wireguard: ProtocolDefaults,
    #[serde(default = "default_openvpn")]
    pub openvpn: ProtocolDefaults,
    #[serde(default = "default_pptp")]
    pub pptp: ProtocolDefaults,
    #[serde(default = "default_l2tp")]
    pub l2tp: ProtocolDefaults,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/vpnctl/state.json")
}

fn default_uplink() -> String {
    "eth0".to_string()
}

fn default_command_secs() -> u64 {
    30
}

fn default_install_secs() -> u64 {
    600
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()]
}

fn default_wireguard() -> ProtocolDefaults {
    ProtocolDefaults {
        listen_port: 51820,
        subnet: "10.8.0.0/24".to_string(),
        dns: default_dns(),
        interface: "wg0".to_string(),
        config_path: PathBuf::from("etc/wireguard/wg0.conf"),
        server_address: String::new(),
    }
}

fn default_openvpn() -> ProtocolDefaults {
    ProtocolDefaults {
        listen_port: 1194,
        subnet: "10.9.0.0/24".to_string(),
        dns: default_dns(),
        interface: "tun0".to_string(),
        config_path: PathBuf::from("etc/openvpn/server.conf"),
        server_address: String::new(),
    }
}

fn default_pptp() -> ProtocolDefaults {
    ProtocolDefaults {
        listen_port: 1723,
        subnet: "10.10.0.0/24".to_string(),
        dns: default_dns(),
        interface: "ppp+".to_string(),
        config_path: PathBuf::from("etc/pptpd.conf"),
        server_address: String::new(),
    }
}

fn default_l2tp() -> ProtocolDefaults {
    ProtocolDefaults {
        listen_port: 1701,
        subnet: "10.11.0.0/24".to_string(),
        dns: default_dns(),
        interface: "ppp+".to_string(),
        config_path: PathBuf::from("etc/xl2tpd/xl2tpd.conf"),
        server_address: String::new(),
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            root: default_root(),
            state_file: default_state_file(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { uplink_interface: default_uplink() }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            install_secs: default_install_secs(),
        }
    }
}

impl Default for ProtocolDefaultsTable {
    fn default() -> Self {
        Self {
            wireguard: default_wireguard(),
            openvpn: default_openvpn(),
            pptp: default_pptp(),
            l2tp: default_l2tp(),
        }
    }
}

impl ProtocolDefaultsTable {
    pub fn get(&self, protocol: Protocol) -> &ProtocolDefaults {
        match protocol {
            Protocol::WireGuard => &self.wireguard,
            Protocol::OpenVpn => &self.openvpn,
            Protocol::Pptp => &self.pptp,
            Protocol::L2tp => &self.l2tp,
        }
    }

    pub fn get_mut(&mut self, protocol: Protocol) -> &mut ProtocolDefaults {
        match protocol {
            Protocol::WireGuard => &mut self.wireguard,
            Protocol::OpenVpn => &mut self.openvpn,
            Protocol::Pptp => &mut self.pptp,
            Protocol::L2tp => &mut self.l2tp,
        }
    }
}

impl Timeouts {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }
}

impl OrchestratorConfig {
    /// Configuration rooted at `root`, used for staging trees and tests
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let mut config = Self::default();
        config.paths.root = root.as_ref().to_path_buf();
        config.paths.state_file = root.as_ref().join("var/lib/vpnctl/state.json");
        config
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::Config(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| VpnError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject settings that would produce broken commands or files
    pub fn validate(&self) -> VpnResult<()> {
        validation::validate_interface_name(&self.network.uplink_interface)
            .map_err(|e| VpnError::Config(format!("network.uplink_interface: {}", e)))?;

        if self.timeouts.command_secs == 0 || self.timeouts.install_secs == 0 {
            return Err(VpnError::Config("timeouts must be greater than zero".to_string()));
        }

        for protocol in Protocol::ALL {
            let defaults = self.protocols.get(protocol);
            let ctx = |e: VpnError| VpnError::Config(format!("protocols.{}: {}", protocol, e));

            validation::validate_subnet(&defaults.subnet).map_err(ctx)?;
            validation::validate_port(defaults.listen_port).map_err(ctx)?;
            for server in &defaults.dns {
                validation::validate_ip_address(server).map_err(ctx)?;
            }
            if !defaults.server_address.is_empty() {
                validation::validate_hostname(&defaults.server_address).map_err(ctx)?;
            }
            // ppp+ is an iptables wildcard, not a device we create
            let iface = defaults.interface.trim_end_matches('+');
            validation::validate_interface_name(iface).map_err(ctx)?;
        }

        Ok(())
    }

    /// Resolve a host path under the configured root
    pub fn host_path<P: AsRef<Path>>(&self, relative: P) -> PathBuf {
        let relative = relative.as_ref();
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        self.paths.root.join(relative)
    }
}
