//! Peer provisioning for interface protocols
//!
//! A peer row and its live presence on the interface are kept in step:
//! when the protocol is up, every create, delete, enable, disable or key
//! rotation touches the device first and the store second, undoing the
//! device change if the store write fails. While the protocol is down only
//! the store changes, and the enabled peers are pushed on the next enable.

use chrono::Utc;
use ipnet::IpNet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator;
use crate::config::OrchestratorConfig;
use crate::error::{VpnError, VpnResult};
use crate::interface::{InterfaceController, PeerStats};
use crate::keys::{self, KeyPair};
use crate::model::{Peer, PeerFilter, Protocol, ProtocolConfig};
use crate::protocol::{load_or_create, write_files, BackendRegistry, ProtocolBackend};
use crate::render;
use crate::store::{ProtocolEdit, Store};
use crate::validation::{sanitize_config_value, validate_allowed_ips, validate_name, validate_subnet};

pub struct PeerManager {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn Store>,
    backends: BackendRegistry,
    /// Serializes address allocation per protocol
    allocation: HashMap<Protocol, Mutex<()>>,
}

impl PeerManager {
    pub fn new(config: Arc<OrchestratorConfig>, store: Arc<dyn Store>, backends: BackendRegistry) -> Self {
        let allocation = Protocol::ALL.iter().map(|p| (*p, Mutex::new(()))).collect();
        Self {
            config,
            store,
            backends,
            allocation,
        }
    }

    /// Provision a peer. Without `allowed_ips` the next free host address
    /// of the protocol subnet is assigned as a /32.
    pub async fn create_peer(
        &self,
        protocol: Protocol,
        name: &str,
        allowed_ips: Option<&str>,
        owner: Option<&str>,
    ) -> VpnResult<Peer> {
        let backend = self.peer_backend(protocol)?;
        validate_name(name)?;

        // Held through the live push; repush takes it too
        let _guard = self.allocation_guard(protocol).await;

        let cfg = load_or_create(self.store.as_ref(), &self.config, protocol).await?;
        let existing = self.store.list_peers(&PeerFilter::protocol(protocol)).await?;

        let (allowed, allocated) = match allowed_ips {
            Some(list) => (self.explicit_allowed_ips(list, &existing)?, None),
            None => {
                let subnet = validate_subnet(&cfg.subnet)?;
                let used = allocator::used_addresses(&subnet, existing.iter().map(|p| p.allowed_ips.as_str()));
                let address = allocator::next_available_address(
                    &cfg.subnet,
                    &used,
                    self.config.allocation.reuse,
                    cfg.allocation_cursor,
                )?;
                (address.to_string(), Some(address.addr()))
            }
        };

        let pair = KeyPair::generate();
        let now = Utc::now();
        let peer = Peer {
            id: Uuid::new_v4().to_string(),
            protocol,
            name: name.trim().to_string(),
            description: None,
            public_key: pair.public_key,
            private_key: pair.private_key,
            preshared_key: keys::generate_preshared_key(),
            allowed_ips: allowed,
            endpoint: None,
            persistent_keepalive: Some(render::CLIENT_KEEPALIVE),
            enabled: true,
            owner: owner.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_peer(&peer).await?;

        if let Some(address) = allocated {
            let advance: ProtocolEdit = Box::new(move |row: &mut ProtocolConfig| {
                if row.allocation_cursor.map_or(true, |cursor| address > cursor) {
                    row.allocation_cursor = Some(address);
                    row.updated_at = now;
                }
            });
            if let Err(e) = self.store.update_protocol(protocol, advance).await {
                warn!("Failed to record allocation cursor for {}: {}", protocol, e);
            }
        }

        if let Some(iface) = self.live_interface(backend.as_ref()).await {
            if let Err(e) = iface.add_peer(&peer).await {
                warn!("Pushing peer '{}' to {} failed, discarding it: {}", peer.name, iface.name(), e);
                if let Err(cleanup) = self.store.delete_peer(&peer.id).await {
                    warn!("Failed to discard peer {}: {}", peer.id, cleanup);
                }
                return Err(e);
            }
        }

        self.sync_config_file_quietly(protocol).await;
        info!("Created {} peer '{}' at {}", protocol, peer.name, peer.allowed_ips);
        Ok(peer)
    }

    /// Delete a peer. If the live removal fails the row is kept.
    pub async fn delete_peer(&self, id: &str) -> VpnResult<()> {
        let peer = self.get_peer(id).await?;
        let backend = self.backends.get(peer.protocol)?;

        if let Some(iface) = self.live_interface(backend.as_ref()).await {
            iface.remove_peer(&peer.public_key).await?;
        }
        self.store.delete_peer(id).await?;

        self.sync_config_file_quietly(peer.protocol).await;
        info!("Deleted {} peer '{}'", peer.protocol, peer.name);
        Ok(())
    }

    pub async fn get_peer(&self, id: &str) -> VpnResult<Peer> {
        self.store
            .get_peer(id)
            .await?
            .ok_or_else(|| VpnError::NotFound(format!("Peer {}", id)))
    }

    pub async fn get_peer_by_public_key(&self, protocol: Protocol, public_key: &str) -> VpnResult<Peer> {
        self.store
            .find_peer_by_public_key(protocol, public_key)
            .await?
            .ok_or_else(|| VpnError::NotFound(format!("{} peer with key {}", protocol, public_key)))
    }

    pub async fn list_peers(&self, protocol: Protocol) -> VpnResult<Vec<Peer>> {
        self.store.list_peers(&PeerFilter::protocol(protocol)).await
    }

    pub async fn peers_by_owner(&self, owner: &str) -> VpnResult<Vec<Peer>> {
        self.store.list_peers(&PeerFilter::owner(owner)).await
    }

    /// Rename or re-describe a peer. Keys and addresses stay as they are.
    pub async fn update_peer(&self, id: &str, name: Option<&str>, description: Option<&str>) -> VpnResult<Peer> {
        let mut peer = self.get_peer(id).await?;
        if let Some(name) = name {
            validate_name(name)?;
            peer.name = name.trim().to_string();
        }
        if let Some(description) = description {
            let description = sanitize_config_value(description)?;
            peer.description = if description.trim().is_empty() { None } else { Some(description) };
        }
        peer.updated_at = Utc::now();
        self.store.update_peer(&peer).await?;
        self.sync_config_file_quietly(peer.protocol).await;
        Ok(peer)
    }

    /// Flip the enabled flag, adding or removing the peer on a live device
    pub async fn set_peer_enabled(&self, id: &str, enabled: bool) -> VpnResult<Peer> {
        let mut peer = self.get_peer(id).await?;
        if peer.enabled == enabled {
            return Ok(peer);
        }
        let backend = self.backends.get(peer.protocol)?;
        let live = self.live_interface(backend.as_ref()).await;

        if let Some(iface) = &live {
            if enabled {
                iface.add_peer(&peer).await?;
            } else {
                iface.remove_peer(&peer.public_key).await?;
            }
        }

        peer.enabled = enabled;
        peer.updated_at = Utc::now();
        if let Err(e) = self.store.update_peer(&peer).await {
            if let Some(iface) = &live {
                let undo = if enabled {
                    iface.remove_peer(&peer.public_key).await.map(|_| ())
                } else {
                    iface.add_peer(&peer).await
                };
                if let Err(undo) = undo {
                    warn!("Could not restore live state of peer {}: {}", peer.id, undo);
                }
            }
            return Err(e);
        }

        self.sync_config_file_quietly(peer.protocol).await;
        info!("Peer '{}' {}", peer.name, if enabled { "enabled" } else { "disabled" });
        Ok(peer)
    }

    /// Issue a fresh key pair and pre-shared key. The address is kept, the
    /// old client config stops working.
    pub async fn rotate_keys(&self, id: &str) -> VpnResult<Peer> {
        let old = self.get_peer(id).await?;
        let backend = self.peer_backend(old.protocol)?;

        let pair = KeyPair::generate();
        let mut rotated = old.clone();
        rotated.public_key = pair.public_key;
        rotated.private_key = pair.private_key;
        rotated.preshared_key = keys::generate_preshared_key();
        rotated.updated_at = Utc::now();

        let live = if old.enabled {
            self.live_interface(backend.as_ref()).await
        } else {
            None
        };

        if let Some(iface) = &live {
            iface.remove_peer(&old.public_key).await?;
            if let Err(e) = iface.add_peer(&rotated).await {
                if let Err(undo) = iface.add_peer(&old).await {
                    warn!("Could not restore peer {} after failed rotation: {}", old.id, undo);
                }
                return Err(e);
            }
        }

        if let Err(e) = self.store.update_peer(&rotated).await {
            if let Some(iface) = &live {
                let undo = match iface.remove_peer(&rotated.public_key).await {
                    Ok(_) => iface.add_peer(&old).await,
                    Err(e) => Err(e),
                };
                if let Err(undo) = undo {
                    warn!("Could not restore peer {} after failed rotation: {}", old.id, undo);
                }
            }
            return Err(e);
        }

        self.sync_config_file_quietly(old.protocol).await;
        info!("Rotated keys of peer '{}'", rotated.name);
        Ok(rotated)
    }

    /// Client configuration text for one peer
    pub async fn generate_client_config(&self, id: &str) -> VpnResult<String> {
        let peer = self.get_peer(id).await?;
        let cfg = self.protocol_row(peer.protocol).await?;
        render::wireguard_client_config(&cfg, &peer)
    }

    /// Client configuration as an SVG QR code
    pub async fn generate_qr_svg(&self, id: &str) -> VpnResult<String> {
        render::qr_svg(&self.generate_client_config(id).await?)
    }

    /// Client configuration as a terminal QR code
    pub async fn generate_qr_text(&self, id: &str) -> VpnResult<String> {
        render::qr_text(&self.generate_client_config(id).await?)
    }

    /// Live counters; empty while the protocol is down
    pub async fn peer_stats(&self, protocol: Protocol) -> VpnResult<Vec<PeerStats>> {
        let backend = self.peer_backend(protocol)?;
        let Some(iface) = self.live_interface(backend.as_ref()).await else {
            return Ok(Vec::new());
        };
        let known = self.list_peers(protocol).await?;
        iface.stats(&known).await
    }

    /// Push every enabled peer to a freshly raised interface. Returns how
    /// many made it; individual failures are logged by the interface.
    pub async fn repush(&self, protocol: Protocol) -> VpnResult<usize> {
        let backend = self.peer_backend(protocol)?;
        let Some(iface) = backend.interface() else {
            return Ok(0);
        };
        let _guard = self.allocation_guard(protocol).await;
        let peers = self.store.list_peers(&PeerFilter::protocol(protocol).enabled(true)).await?;
        let loaded = iface.load_peers(&peers).await?;
        if loaded < peers.len() {
            warn!("{} of {} {} peers could not be pushed", peers.len() - loaded, peers.len(), protocol);
        }
        self.sync_config_file_quietly(protocol).await;
        Ok(loaded)
    }

    /// Rewrite the server config file from the current rows. Skipped until
    /// the protocol has its server identity.
    pub async fn sync_config_file(&self, protocol: Protocol) -> VpnResult<bool> {
        let backend = self.backends.get(protocol)?;
        let Some(cfg) = self.store.get_protocol(protocol).await? else {
            return Ok(false);
        };
        if !backend.has_identity(&cfg) {
            debug!("{} has no server identity yet, not writing {:?}", protocol, cfg.config_path);
            return Ok(false);
        }
        let peers = self.store.list_peers(&PeerFilter::protocol(protocol).enabled(true)).await?;
        write_files(&backend.render_files(&cfg, &peers)?).await?;
        Ok(true)
    }

    // === Helper functions ===

    async fn allocation_guard(&self, protocol: Protocol) -> Option<MutexGuard<'_, ()>> {
        match self.allocation.get(&protocol) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    async fn sync_config_file_quietly(&self, protocol: Protocol) {
        if let Err(e) = self.sync_config_file(protocol).await {
            warn!("Failed to rewrite {} configuration: {}", protocol, e);
        }
    }

    fn peer_backend(&self, protocol: Protocol) -> VpnResult<Arc<dyn ProtocolBackend>> {
        if !protocol.has_peers() {
            return Err(VpnError::NotSupported(format!("{} does not manage peers", protocol)));
        }
        self.backends.get(protocol)
    }

    async fn protocol_row(&self, protocol: Protocol) -> VpnResult<ProtocolConfig> {
        load_or_create(self.store.as_ref(), &self.config, protocol).await
    }

    /// The device to mirror changes into, if it is up right now
    async fn live_interface(&self, backend: &dyn ProtocolBackend) -> Option<Arc<InterfaceController>> {
        let iface = backend.interface()?;
        if iface.is_up().await {
            Some(iface)
        } else {
            None
        }
    }

    fn explicit_allowed_ips(&self, list: &str, existing: &[Peer]) -> VpnResult<String> {
        let requested = validate_allowed_ips(list)?;
        for peer in existing {
            let theirs: Vec<IpNet> = match validate_allowed_ips(&peer.allowed_ips) {
                Ok(nets) => nets,
                Err(_) => continue,
            };
            if allocator::overlaps(&requested, &theirs) {
                return Err(VpnError::Conflict(format!(
                    "{} overlaps peer '{}' ({})",
                    list, peer.name, peer.allowed_ips
                )));
            }
        }
        Ok(requested.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", "))
    }
}
