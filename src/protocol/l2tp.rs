//! L2TP/IPsec driver (strongSwan + xl2tpd)

use async_trait::async_trait;
use tracing::debug;

use super::{count_ppp_sessions, BackendContext, ProtocolBackend, RenderedFile};
use crate::error::VpnResult;
use crate::keys;
use crate::model::{Peer, Protocol, ProtocolConfig};
use crate::render;

const PSK_LEN: usize = 32;

pub struct L2tpBackend {
    ctx: BackendContext,
}

impl L2tpBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolBackend for L2tpBackend {
    fn protocol(&self) -> Protocol {
        Protocol::L2tp
    }

    fn packages(&self) -> Vec<String> {
        vec!["xl2tpd".to_string(), "strongswan".to_string()]
    }

    /// IPsec has to be up before L2TP sessions can arrive
    fn services(&self) -> Vec<String> {
        vec!["strongswan".to_string(), "xl2tpd".to_string()]
    }

    fn has_identity(&self, cfg: &ProtocolConfig) -> bool {
        cfg.private_key.is_some()
    }

    fn ensure_identity(&self, cfg: &mut ProtocolConfig) -> VpnResult<bool> {
        if cfg.private_key.is_some() {
            return Ok(false);
        }
        debug!("Generating IPsec pre-shared key");
        cfg.private_key = Some(keys::generate_secret(PSK_LEN));
        Ok(true)
    }

    fn render_files(&self, cfg: &ProtocolConfig, _peers: &[Peer]) -> VpnResult<Vec<RenderedFile>> {
        let options = self.ctx.config.host_path("etc/ppp/options.xl2tpd");
        Ok(vec![
            RenderedFile::new(cfg.config_path.clone(), render::xl2tpd_config(cfg, &options)?, 0o644),
            RenderedFile::new(options, render::xl2tpd_options(cfg), 0o644),
            RenderedFile::new(self.ctx.config.host_path("etc/ipsec.conf"), render::ipsec_config(cfg), 0o644),
            RenderedFile::new(self.ctx.config.host_path("etc/ipsec.secrets"), render::ipsec_secrets(cfg)?, 0o600),
        ])
    }

    async fn session_count(&self, cfg: &ProtocolConfig) -> VpnResult<u32> {
        count_ppp_sessions(&self.ctx, &cfg.subnet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::exec::testing::ScriptedRunner;
    use crate::protocol::default_protocol_config;
    use std::sync::Arc;

    #[test]
    fn test_secret_is_generated_once_and_kept_private() {
        let config = Arc::new(OrchestratorConfig::with_root("/srv/stage"));
        let l2tp = L2tpBackend::new(BackendContext { config: config.clone(), runner: Arc::new(ScriptedRunner::succeeding()) });
        let mut row = default_protocol_config(&config, Protocol::L2tp);

        assert!(render::ipsec_secrets(&row).is_err());
        assert!(l2tp.ensure_identity(&mut row).unwrap());
        let secret = row.private_key.clone().unwrap();
        assert!(!l2tp.ensure_identity(&mut row).unwrap());
        assert_eq!(row.private_key.as_deref(), Some(secret.as_str()));

        let files = l2tp.render_files(&row, &[]).unwrap();
        assert_eq!(files.len(), 4);
        let secrets = files.iter().find(|f| f.path.ends_with("ipsec.secrets")).unwrap();
        assert_eq!(secrets.mode, 0o600);
        assert!(secrets.contents.contains(&secret));
    }
}
