//! OpenVPN driver
//!
//! The server runs as the `openvpn@server` unit. Certificates come from an
//! easy-rsa PKI that is bootstrapped once and left alone afterwards.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use super::{BackendContext, ProtocolBackend, RenderedFile};
use crate::error::VpnResult;
use crate::exec::run_checked;
use crate::files;
use crate::model::{Peer, Protocol, ProtocolConfig};
use crate::render;

const EASYRSA: &str = "/usr/share/easy-rsa/easyrsa";
const PKI_FILES: [&str; 4] = ["ca.crt", "issued/server.crt", "private/server.key", "dh.pem"];

pub struct OpenVpnBackend {
    ctx: BackendContext,
}

impl OpenVpnBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }

    fn pki_dir(&self) -> PathBuf {
        self.ctx.config.host_path("etc/openvpn/easy-rsa/pki")
    }

    fn status_path(&self) -> PathBuf {
        self.ctx.config.host_path("var/log/openvpn/status.log")
    }

    fn pki_complete(&self) -> bool {
        let pki = self.pki_dir();
        PKI_FILES.iter().all(|f| pki.join(f).exists())
    }

    async fn easyrsa(&self, args: &[&str], step: &str) -> VpnResult<()> {
        let pki = self.pki_dir();
        let spec = self
            .ctx
            .command(EASYRSA)
            .args(args.iter().copied())
            .env("EASYRSA_PKI", &pki.to_string_lossy())
            .env("EASYRSA_BATCH", "1")
            .env("EASYRSA_REQ_CN", "vpnctl-ca")
            .timeout(self.ctx.config.timeouts.install());
        run_checked(self.ctx.runner.as_ref(), &spec, step).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolBackend for OpenVpnBackend {
    fn protocol(&self) -> Protocol {
        Protocol::OpenVpn
    }

    fn packages(&self) -> Vec<String> {
        vec!["openvpn".to_string(), "easy-rsa".to_string()]
    }

    fn services(&self) -> Vec<String> {
        vec!["openvpn@server".to_string()]
    }

    /// The server cannot start without its certificates
    fn has_identity(&self, _cfg: &ProtocolConfig) -> bool {
        self.pki_complete()
    }

    fn render_files(&self, cfg: &ProtocolConfig, _peers: &[Peer]) -> VpnResult<Vec<RenderedFile>> {
        let text = render::openvpn_server_config(cfg, &self.pki_dir(), &self.status_path())?;
        Ok(vec![RenderedFile::new(cfg.config_path.clone(), text, 0o644)])
    }

    /// Build CA, server certificate and DH parameters unless a PKI exists
    async fn prepare(&self, _cfg: &ProtocolConfig) -> VpnResult<()> {
        let pki = self.pki_dir();
        if self.pki_complete() {
            info!("OpenVPN PKI already present at {:?}", pki);
            return Ok(());
        }

        if let Some(parent) = pki.parent() {
            files::ensure_directory_exists(parent).await?;
        }

        info!("Bootstrapping OpenVPN PKI at {:?}", pki);
        self.easyrsa(&["init-pki"], "initialize PKI").await?;
        self.easyrsa(&["build-ca", "nopass"], "build CA").await?;
        self.easyrsa(&["build-server-full", "server", "nopass"], "issue server certificate").await?;
        self.easyrsa(&["gen-dh"], "generate DH parameters").await?;
        Ok(())
    }

    /// Client rows in the version 2 status file
    async fn session_count(&self, _cfg: &ProtocolConfig) -> VpnResult<u32> {
        let Some(status) = files::read_optional(&self.status_path()).await? else {
            return Ok(0);
        };
        Ok(status.lines().filter(|l| l.starts_with("CLIENT_LIST,")).count() as u32)
    }
}
