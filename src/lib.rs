//! vpnctl - VPN Protocol Orchestration Library
//!
//! Async library for running VPN servers on a single node:
//! - Protocol lifecycle (install, initialize, enable, disable, status)
//!   for WireGuard, OpenVPN, PPTP and L2TP/IPsec
//! - WireGuard kernel interface control and live peer management
//! - Address allocation inside each protocol subnet
//! - Forwarding and masquerade rules per protocol
//! - VPN user accounts with per-protocol access control
//! - Client configuration and QR code generation
//!
//! All host interaction goes through small traits ([`CommandRunner`],
//! [`PackageInstaller`], [`ServiceSupervisor`], [`Store`]) that the
//! [`Orchestrator`] receives at construction.

pub mod error;
pub mod validation;
pub mod config;
pub mod model;
pub mod exec;
pub mod files;
pub mod system;
pub mod store;
pub mod keys;
pub mod credentials;
pub mod allocator;
pub mod render;
pub mod interface;
pub mod firewall;
pub mod protocol;
pub mod peers;
pub mod users;
pub mod lifecycle;
pub mod orchestrator;

// Re-export commonly used types
pub use error::{VpnError, VpnResult};
pub use config::OrchestratorConfig;
pub use model::{Peer, PeerFilter, Protocol, ProtocolAccess, ProtocolConfig, VpnUser};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use system::{AptInstaller, PackageInstaller, ServiceSupervisor, Systemd};
pub use store::{JsonStore, MemoryStore, Store};
pub use keys::KeyPair;
pub use allocator::ReusePolicy;
pub use render::ClientConfig;
pub use interface::{InterfaceController, LinkState, PeerStats};
pub use firewall::FirewallBinder;
pub use protocol::{BackendContext, BackendRegistry, ProtocolBackend};
pub use peers::PeerManager;
pub use users::{UserManager, UserStats};
pub use lifecycle::{LifecycleManager, ProtocolStatus};
pub use orchestrator::{Orchestrator, VpnStatistics};
