//! Composition root
//!
//! ```text
//!              ┌──────────────────────────┐
//!              │       Orchestrator       │
//!              └──┬──────────┬─────────┬──┘
//!                 │          │         │
//!                 ▼          ▼         ▼
//!          ┌───────────┐ ┌───────┐ ┌───────┐
//!          │ Lifecycle │→│ Peers │ │ Users │
//!          └─────┬─────┘ └───┬───┘ └───┬───┘
//!                │           │         │
//!     ┌──────────┼───────────┤         │
//!     ▼          ▼           ▼         ▼
//! ┌────────┐ ┌────────┐ ┌─────────┐ ┌───────┐
//! │Firewall│ │Backends│ │Interface│ │ Store │
//! └────────┘ └────────┘ └─────────┘ └───────┘
//! ```
//!
//! Everything is built from explicit collaborators; there is no global
//! state, so tests can wire in fakes for the command runner, installer,
//! supervisor and store.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::OrchestratorConfig;
use crate::error::{VpnError, VpnResult};
use crate::exec::CommandRunner;
use crate::firewall::FirewallBinder;
use crate::lifecycle::LifecycleManager;
use crate::model::{Peer, Protocol};
use crate::peers::PeerManager;
use crate::protocol::{BackendContext, BackendRegistry};
use crate::store::Store;
use crate::system::{PackageInstaller, ServiceSupervisor};
use crate::users::UserManager;

/// Node-wide counters
///
/// Connections are the live session counts the protocols report. Byte
/// counters come from interface peers only; the PPP daemons expose none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VpnStatistics {
    pub total_connections: u32,
    /// Protocols observed running
    pub active_protocols: u32,
    /// Received by the server, summed over live peers
    pub total_bytes_in: u64,
    /// Sent by the server, summed over live peers
    pub total_bytes_out: u64,
    /// Every protocol, zero when down
    pub connections_by_protocol: BTreeMap<Protocol, u32>,
}

pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn Store>,
    lifecycle: LifecycleManager,
    peers: Arc<PeerManager>,
    users: UserManager,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Store>,
        runner: Arc<dyn CommandRunner>,
        installer: Arc<dyn PackageInstaller>,
        supervisor: Arc<dyn ServiceSupervisor>,
    ) -> VpnResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let backends = BackendRegistry::new(BackendContext {
            config: config.clone(),
            runner: runner.clone(),
        })?;
        let firewall = Arc::new(FirewallBinder::new(
            runner,
            &config.network.uplink_interface,
            config.timeouts.command(),
        )?);
        let peers = Arc::new(PeerManager::new(config.clone(), store.clone(), backends.clone()));
        let lifecycle = LifecycleManager::new(
            config.clone(),
            store.clone(),
            backends,
            installer,
            supervisor,
            firewall,
            peers.clone(),
        );
        let users = UserManager::new(store.clone());

        Ok(Self {
            config,
            store,
            lifecycle,
            peers,
            users,
        })
    }

    /// Use a different bcrypt cost for new password hashes
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.users = UserManager::new(self.store.clone()).with_hash_cost(cost);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn users(&self) -> &UserManager {
        &self.users
    }

    /// Create a peer on behalf of a user. The user must exist, be enabled
    /// and have access to `protocol`.
    pub async fn provision_peer(&self, user_id: &str, protocol: Protocol, name: &str) -> VpnResult<Peer> {
        let user = match self.users.get_user(user_id).await {
            Ok(user) => user,
            Err(VpnError::NotFound(_)) => {
                return Err(VpnError::Unauthorized(format!("Unknown user {}", user_id)));
            }
            Err(e) => return Err(e),
        };
        if !user.enabled {
            return Err(VpnError::Unauthorized(format!("User '{}' is disabled", user.username)));
        }
        if !self.users.has_protocol_access(&user.id, protocol).await? {
            return Err(VpnError::Unauthorized(format!(
                "User '{}' has no {} access",
                user.username, protocol
            )));
        }

        let peer = self.peers.create_peer(protocol, name, None, Some(&user.id)).await?;
        info!("Provisioned {} peer '{}' for '{}'", protocol, peer.name, user.username);
        Ok(peer)
    }

    /// Delete a user together with every peer it owns
    pub async fn delete_user(&self, user_id: &str) -> VpnResult<()> {
        self.users.get_user(user_id).await?;
        for peer in self.peers.peers_by_owner(user_id).await? {
            self.peers.delete_peer(&peer.id).await?;
        }
        self.users.delete_user(user_id).await
    }

    /// Aggregate status and live peer counters across every protocol
    pub async fn statistics(&self) -> VpnResult<VpnStatistics> {
        let mut stats = VpnStatistics::default();
        for status in self.lifecycle.statuses().await? {
            stats.connections_by_protocol.insert(status.protocol, status.session_count);
            if !status.running {
                continue;
            }
            stats.active_protocols += 1;
            stats.total_connections += status.session_count;

            if status.protocol.has_peers() {
                let peers = self.peers.peer_stats(status.protocol).await?;
                debug!("{} live {} peers", peers.len(), status.protocol);
                for peer in peers {
                    stats.total_bytes_in = stats.total_bytes_in.saturating_add(peer.rx_bytes);
                    stats.total_bytes_out = stats.total_bytes_out.saturating_add(peer.tx_bytes);
                }
            }
        }
        Ok(stats)
    }

    /// Start-up reconciliation: bring back every protocol persisted as
    /// enabled. Returns the protocols that failed.
    pub async fn restore(&self) -> VpnResult<Vec<(Protocol, VpnError)>> {
        Ok(self
            .lifecycle
            .restore()
            .await?
            .into_iter()
            .filter_map(|(protocol, result)| result.err().map(|e| (protocol, e)))
            .collect())
    }
}
