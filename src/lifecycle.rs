//! Protocol lifecycle: install, initialize, enable, disable and status
//!
//! The persisted `enabled` flag is the intended state; the OS (interface
//! link state or service activity) is the observed state. `status` reports
//! both and flags drift, `enable` and `disable` converge them. At most one
//! lifecycle operation runs per protocol; a second one fails with `Busy`
//! instead of queueing.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocator;
use crate::config::OrchestratorConfig;
use crate::error::{VpnError, VpnResult};
use crate::firewall::FirewallBinder;
use crate::interface::LinkState;
use crate::model::{Protocol, ProtocolConfig};
use crate::peers::PeerManager;
use crate::protocol::{default_protocol_config, load_or_create, write_files, BackendRegistry, ProtocolBackend};
use crate::store::{ProtocolEdit, Store};
use crate::system::{PackageInstaller, ServiceSupervisor};

/// Point-in-time view of one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolStatus {
    pub protocol: Protocol,
    pub installed: bool,
    /// Persisted intent
    pub enabled: bool,
    /// Observed from the OS
    pub running: bool,
    pub session_count: u32,
    pub last_error: Option<String>,
    /// `enabled` and `running` disagree
    pub drift: bool,
}

#[derive(Default)]
struct Slot {
    busy: Mutex<()>,
    last_error: Mutex<Option<String>>,
}

pub struct LifecycleManager {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn Store>,
    backends: BackendRegistry,
    installer: Arc<dyn PackageInstaller>,
    supervisor: Arc<dyn ServiceSupervisor>,
    firewall: Arc<FirewallBinder>,
    peers: Arc<PeerManager>,
    slots: HashMap<Protocol, Slot>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<dyn Store>,
        backends: BackendRegistry,
        installer: Arc<dyn PackageInstaller>,
        supervisor: Arc<dyn ServiceSupervisor>,
        firewall: Arc<FirewallBinder>,
        peers: Arc<PeerManager>,
    ) -> Self {
        let slots = Protocol::ALL.iter().map(|p| (*p, Slot::default())).collect();
        Self {
            config,
            store,
            backends,
            installer,
            supervisor,
            firewall,
            peers,
            slots,
        }
    }

    /// The persisted row, created from defaults on first access
    pub async fn protocol_config(&self, protocol: Protocol) -> VpnResult<ProtocolConfig> {
        load_or_create(self.store.as_ref(), &self.config, protocol).await
    }

    /// Report intent and observation. Never changes persisted state.
    pub async fn status(&self, protocol: Protocol) -> VpnResult<ProtocolStatus> {
        let backend = self.backends.get(protocol)?;
        let cfg = match self.store.get_protocol(protocol).await? {
            Some(cfg) => cfg,
            None => default_protocol_config(&self.config, protocol),
        };

        let installed = self.is_installed(backend.as_ref()).await;
        let running = self.is_running(backend.as_ref()).await;
        let session_count = if running {
            backend.session_count(&cfg).await.unwrap_or_else(|e| {
                debug!("Could not count {} sessions: {}", protocol, e);
                0
            })
        } else {
            0
        };

        Ok(ProtocolStatus {
            protocol,
            installed,
            enabled: cfg.enabled,
            running,
            session_count,
            last_error: self.slot(protocol)?.last_error.lock().await.clone(),
            drift: cfg.enabled != running,
        })
    }

    /// Status of every protocol, gathered concurrently
    pub async fn statuses(&self) -> VpnResult<Vec<ProtocolStatus>> {
        join_all(Protocol::ALL.iter().map(|p| self.status(*p)))
            .await
            .into_iter()
            .collect()
    }

    /// Install the protocol's packages. Already installed packages are left
    /// alone, so repeating this is harmless.
    pub async fn install(&self, protocol: Protocol) -> VpnResult<()> {
        let slot = self.slot(protocol)?;
        let _busy = Self::acquire(slot, protocol)?;
        let backend = self.backends.get(protocol)?;

        info!("Installing {} ({})", protocol, backend.packages().join(", "));
        let result = self.installer.ensure_installed(&backend.packages()).await;
        self.record(slot, protocol, result).await
    }

    /// Create secrets and write configuration files. Existing secrets are
    /// kept.
    pub async fn initialize(&self, protocol: Protocol) -> VpnResult<ProtocolConfig> {
        let slot = self.slot(protocol)?;
        let _busy = Self::acquire(slot, protocol)?;
        let backend = self.backends.get(protocol)?;

        let result = self.initialize_locked(backend.as_ref()).await;
        self.record(slot, protocol, result).await
    }

    /// Bring the protocol live and persist `enabled = true`
    pub async fn enable(&self, protocol: Protocol) -> VpnResult<()> {
        let slot = self.slot(protocol)?;
        let _busy = Self::acquire(slot, protocol)?;
        let backend = self.backends.get(protocol)?;

        let result = self.enable_locked(backend.as_ref()).await;
        self.record(slot, protocol, result).await
    }

    /// Take the protocol down and persist `enabled = false`
    pub async fn disable(&self, protocol: Protocol) -> VpnResult<()> {
        let slot = self.slot(protocol)?;
        let _busy = Self::acquire(slot, protocol)?;
        let backend = self.backends.get(protocol)?;

        let result = self.disable_locked(backend.as_ref()).await;
        self.record(slot, protocol, result).await
    }

    /// Re-enable every protocol persisted as enabled that is not running,
    /// e.g. after a reboot. One failure does not stop the others.
    pub async fn restore(&self) -> VpnResult<Vec<(Protocol, VpnResult<()>)>> {
        let mut outcomes = Vec::new();
        for protocol in Protocol::ALL {
            let Some(cfg) = self.store.get_protocol(protocol).await? else {
                continue;
            };
            if !cfg.enabled {
                continue;
            }
            let backend = self.backends.get(protocol)?;
            if self.is_running(backend.as_ref()).await {
                debug!("{} already running", protocol);
                continue;
            }

            info!("Restoring {}", protocol);
            let result = self.enable(protocol).await;
            if let Err(e) = &result {
                error!("Failed to restore {}: {}", protocol, e);
            }
            outcomes.push((protocol, result));
        }
        Ok(outcomes)
    }

    // === Helper functions ===

    fn slot(&self, protocol: Protocol) -> VpnResult<&Slot> {
        self.slots
            .get(&protocol)
            .ok_or_else(|| VpnError::NotSupported(format!("Unknown protocol {}", protocol)))
    }

    fn acquire(slot: &Slot, protocol: Protocol) -> VpnResult<tokio::sync::MutexGuard<'_, ()>> {
        slot.busy
            .try_lock()
            .map_err(|_| VpnError::Busy(format!("Another {} operation is in progress", protocol)))
    }

    /// Remember the outcome for `status`
    async fn record<T>(&self, slot: &Slot, protocol: Protocol, result: VpnResult<T>) -> VpnResult<T> {
        let mut last_error = slot.last_error.lock().await;
        match &result {
            Ok(_) => *last_error = None,
            Err(e) => {
                warn!("{} operation failed: {}", protocol, e);
                *last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn is_installed(&self, backend: &dyn ProtocolBackend) -> bool {
        let packages = backend.packages();
        join_all(packages.iter().map(|p| self.installer.is_installed(p)))
            .await
            .into_iter()
            .all(|installed| installed)
    }

    async fn is_running(&self, backend: &dyn ProtocolBackend) -> bool {
        if let Some(iface) = backend.interface() {
            return matches!(iface.probe().await, Ok(LinkState::Up));
        }
        let services = backend.services();
        if services.is_empty() {
            return false;
        }
        join_all(services.iter().map(|s| self.supervisor.is_active(s)))
            .await
            .into_iter()
            .all(|active| active)
    }

    async fn initialize_locked(&self, backend: &dyn ProtocolBackend) -> VpnResult<ProtocolConfig> {
        let protocol = backend.protocol();
        let mut cfg = self.protocol_config(protocol).await?;

        if backend.ensure_identity(&mut cfg)? {
            let (private_key, public_key) = (cfg.private_key.clone(), cfg.public_key.clone());
            cfg = self
                .store
                .update_protocol(
                    protocol,
                    Box::new(move |row: &mut ProtocolConfig| {
                        row.private_key = private_key;
                        row.public_key = public_key;
                        row.updated_at = Utc::now();
                    }),
                )
                .await?;
            info!("Created server identity for {}", protocol);
        }

        backend.prepare(&cfg).await?;

        let peers = if protocol.has_peers() {
            self.peers.list_peers(protocol).await?.into_iter().filter(|p| p.enabled).collect()
        } else {
            Vec::new()
        };
        write_files(&backend.render_files(&cfg, &peers)?).await?;

        if self.is_running(backend).await {
            self.reload_running(backend)
                .await
                .map_err(|e| e.in_step(&format!("initialize {}", protocol)))?;
        }

        info!("{} initialized", protocol);
        Ok(cfg)
    }

    async fn enable_locked(&self, backend: &dyn ProtocolBackend) -> VpnResult<()> {
        let protocol = backend.protocol();
        let mut cfg = self.protocol_config(protocol).await?;

        if self.is_running(backend).await {
            return Err(VpnError::InvalidState(format!("{} is already running", protocol)));
        }
        if !self.is_installed(backend).await {
            return Err(VpnError::InvalidState(format!(
                "{} is not installed (needs {})",
                protocol,
                backend.packages().join(", ")
            )));
        }
        if !backend.has_identity(&cfg) {
            cfg = self.initialize_locked(backend).await?;
        }

        if backend.interface().is_some() {
            self.bring_up_interface(backend, &cfg).await?;
        } else {
            self.start_services(backend, &cfg).await?;
        }

        let mark_enabled: ProtocolEdit = Box::new(|row: &mut ProtocolConfig| {
            row.enabled = true;
            row.updated_at = Utc::now();
        });
        if let Err(e) = self.store.update_protocol(protocol, mark_enabled).await {
            warn!("Could not persist {} as enabled, taking it down again", protocol);
            self.teardown(backend, &cfg).await;
            return Err(e);
        }

        info!("{} enabled", protocol);
        Ok(())
    }

    async fn bring_up_interface(&self, backend: &dyn ProtocolBackend, cfg: &ProtocolConfig) -> VpnResult<()> {
        let Some(iface) = backend.interface() else {
            return Err(VpnError::InvalidState(format!("{} has no interface", cfg.protocol)));
        };
        let private_key = cfg
            .private_key
            .as_deref()
            .ok_or_else(|| VpnError::InvalidState(format!("{} has no private key", cfg.protocol)))?;

        iface
            .up(cfg.listen_port, private_key, allocator::server_address(&cfg.subnet)?)
            .await
            .map_err(|e| e.in_step(&format!("enable {}", cfg.protocol)))?;

        if let Err(e) = self.firewall.bind(iface.name(), &cfg.subnet).await {
            if let Err(down) = iface.down().await {
                warn!("Rollback of {} failed: {}", iface.name(), down);
            }
            return Err(e.in_step(&format!("enable {}", cfg.protocol)));
        }

        if let Err(e) = self.peers.repush(cfg.protocol).await {
            self.teardown(backend, cfg).await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_services(&self, backend: &dyn ProtocolBackend, cfg: &ProtocolConfig) -> VpnResult<()> {
        write_files(&backend.render_files(cfg, &[])?).await?;

        let mut started = Vec::new();
        if let Err(e) = self.start_and_bind(backend, cfg, &mut started).await {
            for service in started.iter().rev() {
                self.stop_service(service).await;
            }
            return Err(e.in_step(&format!("enable {}", cfg.protocol)));
        }
        Ok(())
    }

    /// Start services in order, verify them, then bind NAT. `started`
    /// collects what needs stopping if anything fails.
    async fn start_and_bind(
        &self,
        backend: &dyn ProtocolBackend,
        cfg: &ProtocolConfig,
        started: &mut Vec<String>,
    ) -> VpnResult<()> {
        for service in backend.services() {
            self.supervisor.enable(&service).await?;
            started.push(service.clone());
            self.supervisor.start(&service).await?;
        }
        for service in backend.services() {
            if !self.supervisor.is_active(&service).await {
                return Err(VpnError::ExternalFailure {
                    step: format!("verify {}", service),
                    cmd: format!("systemctl is-active {}", service),
                    code: None,
                    stderr: "service did not become active".to_string(),
                });
            }
        }
        self.firewall.bind(&cfg.interface, &cfg.subnet).await
    }

    async fn disable_locked(&self, backend: &dyn ProtocolBackend) -> VpnResult<()> {
        let protocol = backend.protocol();
        let cfg = self.protocol_config(protocol).await?;
        let running = self.is_running(backend).await;

        if !running && !cfg.enabled {
            return Err(VpnError::InvalidState(format!("{} is not enabled", protocol)));
        }
        if !running {
            warn!("{} is enabled but not running, reconciling", protocol);
        }

        self.firewall.unbind(&self.interface_of(backend, &cfg), &cfg.subnet).await;
        if let Some(iface) = backend.interface() {
            iface.down().await.map_err(|e| e.in_step(&format!("disable {}", protocol)))?;
        } else {
            for service in backend.services().iter().rev() {
                self.stop_service(service).await;
            }
        }

        self.store
            .update_protocol(
                protocol,
                Box::new(|row: &mut ProtocolConfig| {
                    row.enabled = false;
                    row.updated_at = Utc::now();
                }),
            )
            .await?;
        info!("{} disabled", protocol);
        Ok(())
    }

    /// Make a running protocol pick up rewritten files. Daemons are
    /// restarted; an interface gets every enabled peer pushed again.
    async fn reload_running(&self, backend: &dyn ProtocolBackend) -> VpnResult<()> {
        let protocol = backend.protocol();
        if backend.interface().is_some() {
            let loaded = self.peers.repush(protocol).await?;
            info!("Re-synced {} live {} peers", loaded, protocol);
            return Ok(());
        }
        for service in backend.services() {
            self.supervisor.restart(&service).await?;
        }
        info!("Restarted {} services", protocol);
        Ok(())
    }

    /// Best-effort reversal of a partial enable
    async fn teardown(&self, backend: &dyn ProtocolBackend, cfg: &ProtocolConfig) {
        self.firewall.unbind(&self.interface_of(backend, cfg), &cfg.subnet).await;
        if let Some(iface) = backend.interface() {
            if let Err(e) = iface.down().await {
                warn!("Rollback of {} failed: {}", iface.name(), e);
            }
        } else {
            for service in backend.services().iter().rev() {
                self.stop_service(service).await;
            }
        }
    }

    async fn stop_service(&self, service: &str) {
        if let Err(e) = self.supervisor.stop(service).await {
            warn!("Failed to stop {}: {}", service, e);
        }
        if let Err(e) = self.supervisor.disable(service).await {
            warn!("Failed to disable {}: {}", service, e);
        }
    }

    fn interface_of(&self, backend: &dyn ProtocolBackend, cfg: &ProtocolConfig) -> String {
        backend
            .interface()
            .map(|iface| iface.name().to_string())
            .unwrap_or_else(|| cfg.interface.clone())
    }
}
