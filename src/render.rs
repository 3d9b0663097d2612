//! Configuration text generation
//!
//! Pure functions from persisted rows to file contents. Nothing here touches
//! the filesystem or spawns processes.

use qrcode::render::svg;
use qrcode::QrCode;
use std::fmt::Write as _;
use std::path::Path;

use crate::allocator;
use crate::error::{VpnError, VpnResult};
use crate::model::{Peer, ProtocolConfig};

/// Route-everything client setting
pub const CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0, ::/0";

/// Keepalive handed to clients so NAT mappings stay open
pub const CLIENT_KEEPALIVE: u16 = 25;

const HEADER: &str = "# Managed by vpnctl. Local changes are overwritten.\n";

fn require_private_key(cfg: &ProtocolConfig) -> VpnResult<&str> {
    cfg.private_key
        .as_deref()
        .ok_or_else(|| VpnError::InvalidState(format!("{} has not been initialized", cfg.protocol)))
}

fn require_public_key(cfg: &ProtocolConfig) -> VpnResult<&str> {
    cfg.public_key
        .as_deref()
        .ok_or_else(|| VpnError::InvalidState(format!("{} has not been initialized", cfg.protocol)))
}

/// `wg0.conf`: interface block plus one block per enabled peer
pub fn wireguard_server_config(cfg: &ProtocolConfig, peers: &[Peer]) -> VpnResult<String> {
    let private_key = require_private_key(cfg)?;
    let address = allocator::server_address(&cfg.subnet)?;

    let mut out = String::from(HEADER);
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "Address = {}", address);
    let _ = writeln!(out, "ListenPort = {}", cfg.listen_port);
    let _ = writeln!(out, "PrivateKey = {}", private_key);

    for peer in peers.iter().filter(|p| p.enabled) {
        let _ = writeln!(out);
        let _ = writeln!(out, "# {} ({})", peer.name, peer.id);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        let _ = writeln!(out, "PresharedKey = {}", peer.preshared_key);
        let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips);
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
    }

    Ok(out)
}

/// Client side WireGuard configuration for `peer`
pub fn wireguard_client_config(cfg: &ProtocolConfig, peer: &Peer) -> VpnResult<String> {
    let server_public_key = require_public_key(cfg)?;

    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", peer.private_key);
    let _ = writeln!(out, "Address = {}", peer.allowed_ips);
    if !cfg.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", cfg.dns_list());
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", server_public_key);
    let _ = writeln!(out, "PresharedKey = {}", peer.preshared_key);
    let _ = writeln!(out, "Endpoint = {}", cfg.endpoint());
    let _ = writeln!(out, "AllowedIPs = {}", CLIENT_ALLOWED_IPS);
    let _ = writeln!(out, "PersistentKeepalive = {}", CLIENT_KEEPALIVE);
    Ok(out)
}

/// A parsed client configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientConfig {
    pub private_key: String,
    pub address: String,
    pub dns: Vec<String>,
    pub server_public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: String,
    pub allowed_ips: String,
    pub persistent_keepalive: Option<u16>,
}

impl ClientConfig {
    /// Parse an INI style WireGuard client config with one `[Peer]`
    pub fn parse(content: &str) -> VpnResult<Self> {
        let mut config = ClientConfig::default();
        let mut section = String::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].to_string();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(VpnError::Parse(format!("Malformed line: {}", line)));
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();

            match (section.as_str(), key.as_str()) {
                ("Interface", "privatekey") => config.private_key = value,
                ("Interface", "address") => config.address = value,
                ("Interface", "dns") => {
                    config.dns = value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
                }
                ("Peer", "publickey") => config.server_public_key = value,
                ("Peer", "presharedkey") => config.preshared_key = Some(value),
                ("Peer", "endpoint") => config.endpoint = value,
                ("Peer", "allowedips") => config.allowed_ips = value,
                ("Peer", "persistentkeepalive") => {
                    config.persistent_keepalive = Some(
                        value.parse().map_err(|_| VpnError::Parse(format!("Invalid keepalive: {}", value)))?,
                    )
                }
                _ => {}
            }
        }

        if config.private_key.is_empty() || config.server_public_key.is_empty() {
            return Err(VpnError::Parse("Client config is missing a key".to_string()));
        }

        Ok(config)
    }
}

/// OpenVPN `server.conf`
///
/// `pki_dir` and `status_path` are host paths; the server keeps a version 2
/// status file there which session counting reads back.
pub fn openvpn_server_config(cfg: &ProtocolConfig, pki_dir: &Path, status_path: &Path) -> VpnResult<String> {
    let net = crate::validation::validate_subnet(&cfg.subnet)?;
    let pki = pki_dir.display();

    let mut out = String::from(HEADER);
    let _ = writeln!(out, "port {}", cfg.listen_port);
    let _ = writeln!(out, "proto udp");
    let _ = writeln!(out, "dev {}", cfg.interface);
    let _ = writeln!(out, "ca {}/ca.crt", pki);
    let _ = writeln!(out, "cert {}/issued/server.crt", pki);
    let _ = writeln!(out, "key {}/private/server.key", pki);
    let _ = writeln!(out, "dh {}/dh.pem", pki);
    let _ = writeln!(out, "topology subnet");
    let _ = writeln!(out, "server {} {}", net.network(), net.netmask());
    let _ = writeln!(out, "push \"redirect-gateway def1 bypass-dhcp\"");
    for server in &cfg.dns {
        let _ = writeln!(out, "push \"dhcp-option DNS {}\"", server);
    }
    let _ = writeln!(out, "keepalive 10 120");
    let _ = writeln!(out, "persist-key");
    let _ = writeln!(out, "persist-tun");
    let _ = writeln!(out, "status {} 10", status_path.display());
    let _ = writeln!(out, "status-version 2");
    let _ = writeln!(out, "verb 3");
    Ok(out)
}

/// `pptpd.conf`
pub fn pptpd_config(cfg: &ProtocolConfig, options_path: &Path) -> VpnResult<String> {
    let local = allocator::server_address(&cfg.subnet)?;
    let (start, end) = allocator::client_pool(&cfg.subnet)?;

    let mut out = String::from(HEADER);
    let _ = writeln!(out, "option {}", options_path.display());
    let _ = writeln!(out, "logwtmp");
    let _ = writeln!(out, "localip {}", local.addr());
    let _ = writeln!(out, "remoteip {}-{}", start, end.octets()[3]);
    Ok(out)
}

/// `ppp/pptpd-options`
pub fn pptpd_options(cfg: &ProtocolConfig) -> String {
    let mut out = String::from(HEADER);
    for line in ["name pptpd", "refuse-pap", "refuse-chap", "refuse-mschap", "require-mschap-v2", "require-mppe-128"] {
        let _ = writeln!(out, "{}", line);
    }
    for server in &cfg.dns {
        let _ = writeln!(out, "ms-dns {}", server);
    }
    for line in ["proxyarp", "lock", "nobsdcomp", "novj", "novjccomp", "nologfd"] {
        let _ = writeln!(out, "{}", line);
    }
    out
}

/// `xl2tpd.conf`
pub fn xl2tpd_config(cfg: &ProtocolConfig, options_path: &Path) -> VpnResult<String> {
    let local = allocator::server_address(&cfg.subnet)?;
    let (start, end) = allocator::client_pool(&cfg.subnet)?;

    let mut out = String::from(HEADER);
    let _ = writeln!(out, "[global]");
    let _ = writeln!(out, "port = {}", cfg.listen_port);
    let _ = writeln!(out);
    let _ = writeln!(out, "[lns default]");
    let _ = writeln!(out, "ip range = {}-{}", start, end);
    let _ = writeln!(out, "local ip = {}", local.addr());
    let _ = writeln!(out, "require chap = yes");
    let _ = writeln!(out, "refuse pap = yes");
    let _ = writeln!(out, "require authentication = yes");
    let _ = writeln!(out, "name = L2TPServer");
    let _ = writeln!(out, "pppoptfile = {}", options_path.display());
    let _ = writeln!(out, "length bit = yes");
    Ok(out)
}

/// `ppp/options.xl2tpd`
pub fn xl2tpd_options(cfg: &ProtocolConfig) -> String {
    let mut out = String::from(HEADER);
    let _ = writeln!(out, "ipcp-accept-local");
    let _ = writeln!(out, "ipcp-accept-remote");
    for server in &cfg.dns {
        let _ = writeln!(out, "ms-dns {}", server);
    }
    for line in [
        "noccp",
        "auth",
        "mtu 1280",
        "mru 1280",
        "proxyarp",
        "lcp-echo-failure 4",
        "lcp-echo-interval 30",
        "connect-delay 5000",
        "require-mschap-v2",
    ] {
        let _ = writeln!(out, "{}", line);
    }
    out
}

/// strongSwan `ipsec.conf` for L2TP transport mode with a pre-shared key
pub fn ipsec_config(cfg: &ProtocolConfig) -> String {
    let mut out = String::from(HEADER);
    let _ = writeln!(out, "config setup");
    let _ = writeln!(out, "    uniqueids=no");
    let _ = writeln!(out);
    let _ = writeln!(out, "conn L2TP-PSK");
    let _ = writeln!(out, "    keyexchange=ikev1");
    let _ = writeln!(out, "    authby=secret");
    let _ = writeln!(out, "    type=transport");
    let _ = writeln!(out, "    left=%defaultroute");
    let _ = writeln!(out, "    leftprotoport=17/{}", cfg.listen_port);
    let _ = writeln!(out, "    right=%any");
    let _ = writeln!(out, "    rightprotoport=17/%any");
    let _ = writeln!(out, "    ike=aes256-sha1-modp2048,aes128-sha1-modp2048!");
    let _ = writeln!(out, "    esp=aes256-sha1,aes128-sha1!");
    let _ = writeln!(out, "    auto=add");
    out
}

/// `ipsec.secrets` holding the L2TP pre-shared key
pub fn ipsec_secrets(cfg: &ProtocolConfig) -> VpnResult<String> {
    let secret = require_private_key(cfg)?;
    Ok(format!("{}%any %any : PSK \"{}\"\n", HEADER, secret))
}

/// QR code of `text` as an SVG document
pub fn qr_svg(text: &str) -> VpnResult<String> {
    let code = QrCode::new(text.as_bytes()).map_err(|e| VpnError::InvalidParameter(format!("QR encoding failed: {}", e)))?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

/// QR code of `text` drawn with block characters for a terminal
pub fn qr_text(text: &str) -> VpnResult<String> {
    let code = QrCode::new(text.as_bytes()).map_err(|e| VpnError::InvalidParameter(format!("QR encoding failed: {}", e)))?;
    Ok(code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build())
}
