//! WireGuard driver

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{ProtocolBackend, RenderedFile};
use crate::error::VpnResult;
use crate::interface::{InterfaceController, LinkState};
use crate::keys::KeyPair;
use crate::model::{Peer, Protocol, ProtocolConfig};
use crate::render;

/// A peer counts as connected when it completed a handshake this recently
const SESSION_WINDOW_SECS: i64 = 180;

pub struct WireGuardBackend {
    interface: Arc<InterfaceController>,
}

impl WireGuardBackend {
    pub fn new(interface: Arc<InterfaceController>) -> Self {
        Self { interface }
    }
}

#[async_trait]
impl ProtocolBackend for WireGuardBackend {
    fn protocol(&self) -> Protocol {
        Protocol::WireGuard
    }

    fn packages(&self) -> Vec<String> {
        vec!["wireguard".to_string(), "wireguard-tools".to_string()]
    }

    fn interface(&self) -> Option<Arc<InterfaceController>> {
        Some(self.interface.clone())
    }

    fn has_identity(&self, cfg: &ProtocolConfig) -> bool {
        cfg.private_key.is_some() && cfg.public_key.is_some()
    }

    fn ensure_identity(&self, cfg: &mut ProtocolConfig) -> VpnResult<bool> {
        let pair = match cfg.private_key.as_deref() {
            Some(private) => KeyPair::from_private(private)?,
            None => {
                debug!("Generating WireGuard server key pair");
                KeyPair::generate()
            }
        };

        let changed = cfg.private_key.as_deref() != Some(pair.private_key.as_str())
            || cfg.public_key.as_deref() != Some(pair.public_key.as_str());
        cfg.private_key = Some(pair.private_key);
        cfg.public_key = Some(pair.public_key);
        Ok(changed)
    }

    fn render_files(&self, cfg: &ProtocolConfig, peers: &[Peer]) -> VpnResult<Vec<RenderedFile>> {
        Ok(vec![RenderedFile::new(
            cfg.config_path.clone(),
            render::wireguard_server_config(cfg, peers)?,
            0o600,
        )])
    }

    async fn session_count(&self, _cfg: &ProtocolConfig) -> VpnResult<u32> {
        if self.interface.probe().await? != LinkState::Up {
            return Ok(0);
        }
        let active = self
            .interface
            .active_sessions(chrono::Duration::seconds(SESSION_WINDOW_SECS))
            .await?;
        Ok(active as u32)
    }
}
