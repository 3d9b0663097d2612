//! Persistence contract for protocol rows, peers, users and access rows
//!
//! The orchestrator only talks to [`Store`]. Two implementations ship with
//! the crate: [`MemoryStore`] for tests and embedding, and [`JsonStore`]
//! which keeps the whole state in one JSON document on disk.

mod json;
mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{VpnError, VpnResult};
use crate::model::{Peer, PeerFilter, Protocol, ProtocolAccess, ProtocolConfig, VpnUser};

/// In-place edit of a protocol row, see [`Store::update_protocol`]
pub type ProtocolEdit = Box<dyn FnOnce(&mut ProtocolConfig) + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    // Protocol rows
    async fn get_protocol(&self, protocol: Protocol) -> VpnResult<Option<ProtocolConfig>>;
    /// Return the existing row, or insert `default` and return it
    async fn get_or_insert_protocol(&self, default: ProtocolConfig) -> VpnResult<ProtocolConfig>;
    async fn put_protocol(&self, config: &ProtocolConfig) -> VpnResult<()>;
    /// Apply `edit` to the stored row while holding the store's write side
    /// and return the row as written. Two callers editing different fields
    /// never overwrite each other. Fails with `NotFound` when no row exists.
    async fn update_protocol(&self, protocol: Protocol, edit: ProtocolEdit) -> VpnResult<ProtocolConfig>;

    // Peers
    /// Fails with `Conflict` on a duplicate id or a public key already used
    /// within the same protocol
    async fn insert_peer(&self, peer: &Peer) -> VpnResult<()>;
    async fn get_peer(&self, id: &str) -> VpnResult<Option<Peer>>;
    async fn find_peer_by_public_key(&self, protocol: Protocol, public_key: &str) -> VpnResult<Option<Peer>>;
    async fn update_peer(&self, peer: &Peer) -> VpnResult<()>;
    /// Returns whether a row was removed
    async fn delete_peer(&self, id: &str) -> VpnResult<bool>;
    /// Matching peers ordered by creation time
    async fn list_peers(&self, filter: &PeerFilter) -> VpnResult<Vec<Peer>>;

    // Users
    async fn insert_user(&self, user: &VpnUser) -> VpnResult<()>;
    async fn get_user(&self, id: &str) -> VpnResult<Option<VpnUser>>;
    async fn get_user_by_username(&self, username: &str) -> VpnResult<Option<VpnUser>>;
    async fn update_user(&self, user: &VpnUser) -> VpnResult<()>;
    /// Removes the user and its access rows
    async fn delete_user(&self, id: &str) -> VpnResult<bool>;
    async fn list_users(&self) -> VpnResult<Vec<VpnUser>>;

    // Access matrix
    async fn upsert_access(&self, access: &ProtocolAccess) -> VpnResult<()>;
    async fn get_access(&self, user_id: &str, protocol: Protocol) -> VpnResult<Option<ProtocolAccess>>;
    async fn list_access(&self, user_id: &str) -> VpnResult<Vec<ProtocolAccess>>;
}

/// Relational state shared by both store implementations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Tables {
    protocols: Vec<ProtocolConfig>,
    peers: BTreeMap<String, Peer>,
    users: BTreeMap<String, VpnUser>,
    access: Vec<ProtocolAccess>,
}

impl Tables {
    fn get_protocol(&self, protocol: Protocol) -> Option<ProtocolConfig> {
        self.protocols.iter().find(|c| c.protocol == protocol).cloned()
    }

    fn get_or_insert_protocol(&mut self, default: ProtocolConfig) -> ProtocolConfig {
        match self.get_protocol(default.protocol) {
            Some(existing) => existing,
            None => {
                self.protocols.push(default.clone());
                default
            }
        }
    }

    fn put_protocol(&mut self, config: &ProtocolConfig) {
        match self.protocols.iter_mut().find(|c| c.protocol == config.protocol) {
            Some(row) => *row = config.clone(),
            None => self.protocols.push(config.clone()),
        }
    }

    fn update_protocol(&mut self, protocol: Protocol, edit: ProtocolEdit) -> VpnResult<ProtocolConfig> {
        let row = self
            .protocols
            .iter_mut()
            .find(|c| c.protocol == protocol)
            .ok_or_else(|| VpnError::NotFound(format!("Protocol {}", protocol)))?;
        edit(row);
        Ok(row.clone())
    }

    fn key_taken(&self, peer: &Peer) -> bool {
        self.peers
            .values()
            .any(|p| p.id != peer.id && p.protocol == peer.protocol && p.public_key == peer.public_key)
    }

    fn insert_peer(&mut self, peer: &Peer) -> VpnResult<()> {
        if self.peers.contains_key(&peer.id) {
            return Err(VpnError::Conflict(format!("Peer {} already exists", peer.id)));
        }
        if self.key_taken(peer) {
            return Err(VpnError::Conflict(format!(
                "Public key already registered for {}",
                peer.protocol
            )));
        }
        self.peers.insert(peer.id.clone(), peer.clone());
        Ok(())
    }

    fn get_peer(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).cloned()
    }

    fn find_peer_by_public_key(&self, protocol: Protocol, public_key: &str) -> Option<Peer> {
        self.peers
            .values()
            .find(|p| p.protocol == protocol && p.public_key == public_key)
            .cloned()
    }

    fn update_peer(&mut self, peer: &Peer) -> VpnResult<()> {
        if !self.peers.contains_key(&peer.id) {
            return Err(VpnError::NotFound(format!("Peer {}", peer.id)));
        }
        if self.key_taken(peer) {
            return Err(VpnError::Conflict(format!(
                "Public key already registered for {}",
                peer.protocol
            )));
        }
        self.peers.insert(peer.id.clone(), peer.clone());
        Ok(())
    }

    fn delete_peer(&mut self, id: &str) -> bool {
        self.peers.remove(id).is_some()
    }

    fn list_peers(&self, filter: &PeerFilter) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().filter(|p| filter.matches(p)).cloned().collect();
        peers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    fn insert_user(&mut self, user: &VpnUser) -> VpnResult<()> {
        if self.users.contains_key(&user.id) {
            return Err(VpnError::Conflict(format!("User {} already exists", user.id)));
        }
        if self.users.values().any(|u| u.username == user.username) {
            return Err(VpnError::Conflict(format!("Username '{}' is taken", user.username)));
        }
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn get_user(&self, id: &str) -> Option<VpnUser> {
        self.users.get(id).cloned()
    }

    fn get_user_by_username(&self, username: &str) -> Option<VpnUser> {
        self.users.values().find(|u| u.username == username).cloned()
    }

    fn update_user(&mut self, user: &VpnUser) -> VpnResult<()> {
        if !self.users.contains_key(&user.id) {
            return Err(VpnError::NotFound(format!("User {}", user.id)));
        }
        if self.users.values().any(|u| u.id != user.id && u.username == user.username) {
            return Err(VpnError::Conflict(format!("Username '{}' is taken", user.username)));
        }
        self.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn delete_user(&mut self, id: &str) -> bool {
        let removed = self.users.remove(id).is_some();
        if removed {
            self.access.retain(|a| a.user_id != id);
        }
        removed
    }

    fn list_users(&self) -> Vec<VpnUser> {
        let mut users: Vec<VpnUser> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    fn upsert_access(&mut self, access: &ProtocolAccess) -> VpnResult<()> {
        if !self.users.contains_key(&access.user_id) {
            return Err(VpnError::NotFound(format!("User {}", access.user_id)));
        }
        match self
            .access
            .iter_mut()
            .find(|a| a.user_id == access.user_id && a.protocol == access.protocol)
        {
            Some(row) => row.enabled = access.enabled,
            None => self.access.push(access.clone()),
        }
        Ok(())
    }

    fn get_access(&self, user_id: &str, protocol: Protocol) -> Option<ProtocolAccess> {
        self.access
            .iter()
            .find(|a| a.user_id == user_id && a.protocol == protocol)
            .cloned()
    }

    fn list_access(&self, user_id: &str) -> Vec<ProtocolAccess> {
        let mut rows: Vec<ProtocolAccess> = self.access.iter().filter(|a| a.user_id == user_id).cloned().collect();
        rows.sort_by_key(|a| a.protocol);
        rows
    }
}

/// Implements every [`Store`] method by delegating to [`Tables`] through a
/// `read` and a `mutate` accessor on the implementing type.
macro_rules! delegate_store {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl $crate::store::Store for $ty {
            async fn get_protocol(&self, protocol: Protocol) -> VpnResult<Option<ProtocolConfig>> {
                Ok(self.read(|t| t.get_protocol(protocol)).await)
            }

            async fn get_or_insert_protocol(&self, default: ProtocolConfig) -> VpnResult<ProtocolConfig> {
                if let Some(existing) = self.read(|t| t.get_protocol(default.protocol)).await {
                    return Ok(existing);
                }
                self.mutate(move |t| Ok(t.get_or_insert_protocol(default))).await
            }

            async fn put_protocol(&self, config: &ProtocolConfig) -> VpnResult<()> {
                self.mutate(|t| {
                    t.put_protocol(config);
                    Ok(())
                })
                .await
            }

            async fn update_protocol(
                &self,
                protocol: Protocol,
                edit: $crate::store::ProtocolEdit,
            ) -> VpnResult<ProtocolConfig> {
                self.mutate(move |t| t.update_protocol(protocol, edit)).await
            }

            async fn insert_peer(&self, peer: &Peer) -> VpnResult<()> {
                self.mutate(|t| t.insert_peer(peer)).await
            }

            async fn get_peer(&self, id: &str) -> VpnResult<Option<Peer>> {
                Ok(self.read(|t| t.get_peer(id)).await)
            }

            async fn find_peer_by_public_key(&self, protocol: Protocol, public_key: &str) -> VpnResult<Option<Peer>> {
                Ok(self.read(|t| t.find_peer_by_public_key(protocol, public_key)).await)
            }

            async fn update_peer(&self, peer: &Peer) -> VpnResult<()> {
                self.mutate(|t| t.update_peer(peer)).await
            }

            async fn delete_peer(&self, id: &str) -> VpnResult<bool> {
                if self.read(|t| t.get_peer(id)).await.is_none() {
                    return Ok(false);
                }
                self.mutate(|t| Ok(t.delete_peer(id))).await
            }

            async fn list_peers(&self, filter: &PeerFilter) -> VpnResult<Vec<Peer>> {
                Ok(self.read(|t| t.list_peers(filter)).await)
            }

            async fn insert_user(&self, user: &VpnUser) -> VpnResult<()> {
                self.mutate(|t| t.insert_user(user)).await
            }

            async fn get_user(&self, id: &str) -> VpnResult<Option<VpnUser>> {
                Ok(self.read(|t| t.get_user(id)).await)
            }

            async fn get_user_by_username(&self, username: &str) -> VpnResult<Option<VpnUser>> {
                Ok(self.read(|t| t.get_user_by_username(username)).await)
            }

            async fn update_user(&self, user: &VpnUser) -> VpnResult<()> {
                self.mutate(|t| t.update_user(user)).await
            }

            async fn delete_user(&self, id: &str) -> VpnResult<bool> {
                if self.read(|t| t.get_user(id)).await.is_none() {
                    return Ok(false);
                }
                self.mutate(|t| Ok(t.delete_user(id))).await
            }

            async fn list_users(&self) -> VpnResult<Vec<VpnUser>> {
                Ok(self.read(|t| t.list_users()).await)
            }

            async fn upsert_access(&self, access: &ProtocolAccess) -> VpnResult<()> {
                self.mutate(|t| t.upsert_access(access)).await
            }

            async fn get_access(&self, user_id: &str, protocol: Protocol) -> VpnResult<Option<ProtocolAccess>> {
                Ok(self.read(|t| t.get_access(user_id, protocol)).await)
            }

            async fn list_access(&self, user_id: &str) -> VpnResult<Vec<ProtocolAccess>> {
                Ok(self.read(|t| t.list_access(user_id)).await)
            }
        }
    };
}

pub(crate) use delegate_store;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    pub fn protocol_row(protocol: Protocol) -> ProtocolConfig {
        let now = Utc::now();
        ProtocolConfig {
            protocol,
            enabled: false,
            listen_port: 51820,
            subnet: "10.8.0.0/24".to_string(),
            dns: vec!["1.1.1.1".to_string()],
            private_key: None,
            public_key: None,
            server_address: String::new(),
            config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            interface: "wg0".to_string(),
            allocation_cursor: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn peer(id: &str, public_key: &str) -> Peer {
        let now = Utc::now();
        Peer {
            id: id.to_string(),
            protocol: Protocol::WireGuard,
            name: format!("peer-{}", id),
            description: None,
            public_key: public_key.to_string(),
            private_key: "priv".to_string(),
            preshared_key: "psk".to_string(),
            allowed_ips: "10.8.0.2/32".to_string(),
            endpoint: None,
            persistent_keepalive: None,
            enabled: true,
            owner: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user(id: &str, username: &str) -> VpnUser {
        VpnUser {
            id: id.to_string(),
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password_hash: "hash".to_string(),
            enabled: true,
            last_connection: None,
            created_at: Utc::now(),
        }
    }

    /// Behaviour every store must share
    pub async fn exercise_contract(store: &dyn Store) {
        // protocol rows
        assert!(store.get_protocol(Protocol::WireGuard).await.unwrap().is_none());
        let row = store.get_or_insert_protocol(protocol_row(Protocol::WireGuard)).await.unwrap();
        let mut other = protocol_row(Protocol::WireGuard);
        other.listen_port = 1;
        assert_eq!(store.get_or_insert_protocol(other).await.unwrap().listen_port, row.listen_port);
        let mut enabled = row.clone();
        enabled.enabled = true;
        store.put_protocol(&enabled).await.unwrap();
        assert!(store.get_protocol(Protocol::WireGuard).await.unwrap().unwrap().enabled);

        let updated = store
            .update_protocol(
                Protocol::WireGuard,
                Box::new(|c: &mut ProtocolConfig| c.allocation_cursor = Some("10.8.0.9".parse().unwrap())),
            )
            .await
            .unwrap();
        assert!(updated.enabled);
        let stored = store.get_protocol(Protocol::WireGuard).await.unwrap().unwrap();
        assert!(stored.enabled);
        assert_eq!(stored.allocation_cursor, updated.allocation_cursor);
        assert!(matches!(
            store.update_protocol(Protocol::Pptp, Box::new(|c: &mut ProtocolConfig| c.enabled = true)).await,
            Err(VpnError::NotFound(_))
        ));
        assert!(store.get_protocol(Protocol::Pptp).await.unwrap().is_none());

        // peers
        store.insert_peer(&peer("a", "KEY_A")).await.unwrap();
        assert!(matches!(store.insert_peer(&peer("a", "KEY_X")).await, Err(VpnError::Conflict(_))));
        assert!(matches!(store.insert_peer(&peer("b", "KEY_A")).await, Err(VpnError::Conflict(_))));
        let mut ovpn_peer = peer("c", "KEY_A");
        ovpn_peer.protocol = Protocol::OpenVpn;
        store.insert_peer(&ovpn_peer).await.unwrap();

        let found = store.find_peer_by_public_key(Protocol::WireGuard, "KEY_A").await.unwrap().unwrap();
        assert_eq!(found.id, "a");

        let mut renamed = found.clone();
        renamed.name = "renamed".to_string();
        renamed.owner = Some("u1".to_string());
        store.update_peer(&renamed).await.unwrap();
        assert_eq!(store.get_peer("a").await.unwrap().unwrap().name, "renamed");
        assert!(matches!(store.update_peer(&peer("zz", "KEY_Z")).await, Err(VpnError::NotFound(_))));

        assert_eq!(store.list_peers(&PeerFilter::default()).await.unwrap().len(), 2);
        assert_eq!(store.list_peers(&PeerFilter::protocol(Protocol::WireGuard)).await.unwrap().len(), 1);
        assert_eq!(store.list_peers(&PeerFilter::owner("u1")).await.unwrap().len(), 1);
        assert!(store
            .list_peers(&PeerFilter::protocol(Protocol::WireGuard).enabled(false))
            .await
            .unwrap()
            .is_empty());

        assert!(store.delete_peer("a").await.unwrap());
        assert!(!store.delete_peer("a").await.unwrap());

        // users and access
        store.insert_user(&user("u1", "alice")).await.unwrap();
        assert!(matches!(store.insert_user(&user("u2", "alice")).await, Err(VpnError::Conflict(_))));
        assert_eq!(store.get_user_by_username("alice").await.unwrap().unwrap().id, "u1");

        let access = ProtocolAccess { user_id: "u1".to_string(), protocol: Protocol::Pptp, enabled: false };
        store.upsert_access(&access).await.unwrap();
        store.upsert_access(&ProtocolAccess { enabled: true, ..access.clone() }).await.unwrap();
        assert_eq!(store.list_access("u1").await.unwrap().len(), 1);
        assert!(store.get_access("u1", Protocol::Pptp).await.unwrap().unwrap().enabled);
        assert!(matches!(
            store.upsert_access(&ProtocolAccess { user_id: "ghost".to_string(), ..access }).await,
            Err(VpnError::NotFound(_))
        ));

        assert!(store.delete_user("u1").await.unwrap());
        assert!(store.list_access("u1").await.unwrap().is_empty());
        assert!(store.list_users().await.unwrap().is_empty());
    }
}
