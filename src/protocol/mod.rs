//! Protocol backends
//!
//! Each supported tunnel technology is a driver behind [`ProtocolBackend`]:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   LifecycleManager (one slot each)  │
//! └──────────────┬──────────────────────┘
//!                │
//!    ┌───────────┼───────────┬──────────┐
//!    │           │           │          │
//!    ▼           ▼           ▼          ▼
//! ┌──────┐   ┌──────┐   ┌──────┐   ┌──────┐
//! │  WG  │   │ OVPN │   │ PPTP │   │ L2TP │  <- Backend Drivers
//! └──────┘   └──────┘   └──────┘   └──────┘
//! ```
//!
//! WireGuard owns a kernel interface. The other three are daemons driven
//! through the service supervisor, so their backends only know which
//! packages, services and files they need.

pub mod l2tp;
pub mod openvpn;
pub mod pptp;
pub mod wireguard;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::{VpnError, VpnResult};
use crate::exec::{CommandRunner, CommandSpec};
use crate::files;
use crate::interface::InterfaceController;
use crate::model::{Peer, Protocol, ProtocolConfig};
use crate::store::Store;

/// A file to write on initialize or peer change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub contents: String,
    pub mode: u32,
}

impl RenderedFile {
    pub fn new(path: PathBuf, contents: String, mode: u32) -> Self {
        Self { path, contents, mode }
    }
}

/// What each backend needs from the host
#[derive(Clone)]
pub struct BackendContext {
    pub config: Arc<OrchestratorConfig>,
    pub runner: Arc<dyn CommandRunner>,
}

impl BackendContext {
    pub fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.config.timeouts.command())
    }
}

/// Common interface of the four protocol drivers
#[async_trait]
pub trait ProtocolBackend: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// System packages the protocol needs
    fn packages(&self) -> Vec<String>;

    /// Supervised daemons, in start order. Empty for interface protocols.
    fn services(&self) -> Vec<String> {
        Vec::new()
    }

    /// The kernel interface this protocol drives, if any
    fn interface(&self) -> Option<Arc<InterfaceController>> {
        None
    }

    /// Whether the server identity needed to go live exists
    fn has_identity(&self, _cfg: &ProtocolConfig) -> bool {
        true
    }

    /// Fill in derived or missing secret material. Existing secrets are kept
    /// and everything derived from them is recomputed. Returns whether the
    /// row changed.
    fn ensure_identity(&self, _cfg: &mut ProtocolConfig) -> VpnResult<bool> {
        Ok(false)
    }

    /// Every configuration file for the current row and peers
    fn render_files(&self, cfg: &ProtocolConfig, peers: &[Peer]) -> VpnResult<Vec<RenderedFile>>;

    /// One-time host preparation beyond plain files
    async fn prepare(&self, _cfg: &ProtocolConfig) -> VpnResult<()> {
        Ok(())
    }

    /// Connected clients right now
    async fn session_count(&self, cfg: &ProtocolConfig) -> VpnResult<u32>;
}

/// Factory for the backend of `protocol`
pub fn create_backend(
    protocol: Protocol,
    ctx: BackendContext,
    interface: Option<Arc<InterfaceController>>,
) -> VpnResult<Arc<dyn ProtocolBackend>> {
    Ok(match protocol {
        Protocol::WireGuard => {
            let interface = match interface {
                Some(iface) => iface,
                None => Arc::new(InterfaceController::new(
                    &ctx.config.protocols.wireguard.interface,
                    ctx.runner.clone(),
                    ctx.config.timeouts.command(),
                )?),
            };
            Arc::new(wireguard::WireGuardBackend::new(interface))
        }
        Protocol::OpenVpn => Arc::new(openvpn::OpenVpnBackend::new(ctx)),
        Protocol::Pptp => Arc::new(pptp::PptpBackend::new(ctx)),
        Protocol::L2tp => Arc::new(l2tp::L2tpBackend::new(ctx)),
    })
}

/// One backend per protocol, shared by the lifecycle and peer managers
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<Protocol, Arc<dyn ProtocolBackend>>,
}

impl BackendRegistry {
    pub fn new(ctx: BackendContext) -> VpnResult<Self> {
        let mut backends = HashMap::new();
        for protocol in Protocol::ALL {
            backends.insert(protocol, create_backend(protocol, ctx.clone(), None)?);
        }
        Ok(Self { backends })
    }

    /// Replace one backend, e.g. with a driver bound to a custom interface
    pub fn with_backend(mut self, backend: Arc<dyn ProtocolBackend>) -> Self {
        self.backends.insert(backend.protocol(), backend);
        self
    }

    pub fn get(&self, protocol: Protocol) -> VpnResult<Arc<dyn ProtocolBackend>> {
        self.backends
            .get(&protocol)
            .cloned()
            .ok_or_else(|| VpnError::NotSupported(format!("No backend for {}", protocol)))
    }
}

/// Write every rendered file with its own permissions
pub async fn write_files(rendered: &[RenderedFile]) -> VpnResult<()> {
    for file in rendered {
        debug!("Writing {:?} ({:o})", file.path, file.mode);
        files::write_secure_config(&file.path, &file.contents, file.mode).await?;
    }
    Ok(())
}

/// The persisted row for `protocol`, created from defaults on first access
pub(crate) async fn load_or_create(
    store: &dyn Store,
    config: &OrchestratorConfig,
    protocol: Protocol,
) -> VpnResult<ProtocolConfig> {
    store.get_or_insert_protocol(default_protocol_config(config, protocol)).await
}

/// Fresh row for `protocol` from the configured defaults
pub fn default_protocol_config(config: &OrchestratorConfig, protocol: Protocol) -> ProtocolConfig {
    let defaults = config.protocols.get(protocol);
    let now = Utc::now();
    ProtocolConfig {
        protocol,
        enabled: false,
        listen_port: defaults.listen_port,
        subnet: defaults.subnet.clone(),
        dns: defaults.dns.clone(),
        private_key: None,
        public_key: None,
        server_address: defaults.server_address.clone(),
        config_path: config.host_path(&defaults.config_path),
        interface: defaults.interface.clone(),
        allocation_cursor: None,
        created_at: now,
        updated_at: now,
    }
}

/// Count ppp links whose local address is the server address of `subnet`.
/// pptpd and xl2tpd both create pppN devices; the local end tells them apart.
pub(crate) async fn count_ppp_sessions(ctx: &BackendContext, subnet: &str) -> VpnResult<u32> {
    let local = crate::allocator::server_address(subnet)?.addr().to_string();
    let out = ctx.runner.run(&ctx.command("ip").args(["-json", "address", "show", "type", "ppp"])).await?;
    if !out.success() || out.stdout.trim().is_empty() {
        return Ok(0);
    }

    let json: serde_json::Value = serde_json::from_str(&out.stdout)?;
    let count = json
        .as_array()
        .map(|links| {
            links
                .iter()
                .filter(|link| {
                    link.get("addr_info")
                        .and_then(|v| v.as_array())
                        .map(|addrs| addrs.iter().any(|a| a.get("local").and_then(|v| v.as_str()) == Some(local.as_str())))
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0);

    Ok(count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedRunner;
    use crate::exec::CommandOutput;

    #[test]
    fn test_default_rows_use_config_and_root() {
        let config = OrchestratorConfig::with_root("/srv/stage");
        let row = default_protocol_config(&config, Protocol::L2tp);
        assert_eq!(row.listen_port, 1701);
        assert_eq!(row.subnet, "10.11.0.0/24");
        assert_eq!(row.config_path, PathBuf::from("/srv/stage/etc/xl2tpd/xl2tpd.conf"));
        assert!(!row.enabled);
        assert!(row.private_key.is_none());
    }

    #[test]
    fn test_factory_covers_every_protocol() {
        let ctx = BackendContext {
            config: Arc::new(OrchestratorConfig::default()),
            runner: Arc::new(ScriptedRunner::succeeding()),
        };
        for protocol in Protocol::ALL {
            let backend = create_backend(protocol, ctx.clone(), None).unwrap();
            assert_eq!(backend.protocol(), protocol);
            assert!(!backend.packages().is_empty());
            assert_eq!(backend.interface().is_some(), protocol == Protocol::WireGuard);
            assert_eq!(backend.services().is_empty(), protocol == Protocol::WireGuard);
        }
    }

    #[tokio::test]
    async fn test_load_or_create_inserts_once() {
        let store = crate::store::MemoryStore::new();
        let config = OrchestratorConfig::default();
        let mut row = load_or_create(&store, &config, Protocol::Pptp).await.unwrap();
        row.listen_port = 1800;
        store.put_protocol(&row).await.unwrap();

        let again = load_or_create(&store, &config, Protocol::Pptp).await.unwrap();
        assert_eq!(again.listen_port, 1800);
    }

    #[tokio::test]
    async fn test_write_files_applies_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let rendered = vec![
            RenderedFile::new(dir.path().join("a/public.conf"), "a".to_string(), 0o644),
            RenderedFile::new(dir.path().join("b/secret.conf"), "b".to_string(), 0o600),
        ];
        write_files(&rendered).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("b/secret.conf")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(dir.path().join("a/public.conf")).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_ppp_sessions_are_split_by_local_address() {
        let json = r#"[
            {"ifname":"ppp0","addr_info":[{"family":"inet","local":"10.10.0.1","address":"10.10.0.100","prefixlen":32}]},
            {"ifname":"ppp1","addr_info":[{"family":"inet","local":"10.11.0.1","address":"10.11.0.100","prefixlen":32}]},
            {"ifname":"ppp2","addr_info":[{"family":"inet","local":"10.10.0.1","address":"10.10.0.101","prefixlen":32}]}
        ]"#;
        let ctx = BackendContext {
            config: Arc::new(OrchestratorConfig::default()),
            runner: Arc::new(ScriptedRunner::new(move |_| CommandOutput::ok(json))),
        };
        assert_eq!(count_ppp_sessions(&ctx, "10.10.0.0/24").await.unwrap(), 2);
        assert_eq!(count_ppp_sessions(&ctx, "10.11.0.0/24").await.unwrap(), 1);
    }
}
