//! PPTP driver (pptpd)

use async_trait::async_trait;

use super::{count_ppp_sessions, BackendContext, ProtocolBackend, RenderedFile};
use crate::error::VpnResult;
use crate::model::{Peer, Protocol, ProtocolConfig};
use crate::render;

pub struct PptpBackend {
    ctx: BackendContext,
}

impl PptpBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolBackend for PptpBackend {
    fn protocol(&self) -> Protocol {
        Protocol::Pptp
    }

    fn packages(&self) -> Vec<String> {
        vec!["pptpd".to_string()]
    }

    fn services(&self) -> Vec<String> {
        vec!["pptpd".to_string()]
    }

    fn render_files(&self, cfg: &ProtocolConfig, _peers: &[Peer]) -> VpnResult<Vec<RenderedFile>> {
        let options = self.ctx.config.host_path("etc/ppp/pptpd-options");
        Ok(vec![
            RenderedFile::new(cfg.config_path.clone(), render::pptpd_config(cfg, &options)?, 0o644),
            RenderedFile::new(options, render::pptpd_options(cfg), 0o644),
        ])
    }

    async fn session_count(&self, cfg: &ProtocolConfig) -> VpnResult<u32> {
        count_ppp_sessions(&self.ctx, &cfg.subnet).await
    }
}
