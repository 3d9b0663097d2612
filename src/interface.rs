//! WireGuard kernel interface control
//!
//! One [`InterfaceController`] owns one named device. All transitions go
//! through `ip` and `wg` via the command runner; key material is written to
//! the child's stdin and never appears on a command line.

use chrono::{DateTime, TimeZone, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{VpnError, VpnResult};
use crate::exec::{run_checked, CommandRunner, CommandSpec};
use crate::model::Peer;
use crate::validation;

/// OS view of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Absent,
    Down,
    Up,
}

/// Live counters for one known peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStats {
    pub peer_id: String,
    pub name: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: String,
    pub latest_handshake: Option<DateTime<Utc>>,
    /// Coarse relative form of `latest_handshake`, empty when never seen
    pub last_handshake: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Default)]
struct InterfaceState {
    up: bool,
    /// public key -> allowed ips, mirror of what the device holds
    peers: HashMap<String, String>,
}

/// Interface controller
pub struct InterfaceController {
    name: String,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    state: Mutex<InterfaceState>,
}

impl InterfaceController {
    pub fn new(name: &str, runner: Arc<dyn CommandRunner>, timeout: Duration) -> VpnResult<Self> {
        validation::validate_interface_name(name)?;
        Ok(Self {
            name: name.to_string(),
            runner,
            timeout,
            state: Mutex::new(InterfaceState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create, key, address and raise the device
    pub async fn up(&self, listen_port: u16, private_key: &str, address: Ipv4Net) -> VpnResult<()> {
        validation::validate_port(listen_port)?;
        validation::validate_wg_key(private_key)?;

        let mut state = self.state.lock().await;
        if state.up {
            return Err(VpnError::InvalidState(format!("{} is already up", self.name)));
        }

        if self.probe_link().await? != LinkState::Absent {
            warn!("Removing stale interface {}", self.name);
            self.run(&["ip", "link", "delete", "dev", self.name.as_str()], "remove stale interface").await?;
        }

        self.run(&["ip", "link", "add", "dev", self.name.as_str(), "type", "wireguard"], "create interface").await?;

        if let Err(e) = self.configure(listen_port, private_key, address).await {
            warn!("Bringing up {} failed, deleting it: {}", self.name, e);
            if let Err(cleanup) = self.run(&["ip", "link", "delete", "dev", self.name.as_str()], "delete interface").await {
                warn!("Rollback of {} failed: {}", self.name, cleanup);
            }
            return Err(e);
        }

        state.up = true;
        state.peers.clear();
        info!("Interface {} is up on port {}", self.name, listen_port);
        Ok(())
    }

    async fn configure(&self, listen_port: u16, private_key: &str, address: Ipv4Net) -> VpnResult<()> {
        let port = listen_port.to_string();
        let spec = self
            .spec(&["wg", "set", self.name.as_str(), "listen-port", &port, "private-key", "/dev/stdin"])
            .stdin(format!("{}\n", private_key.trim()));
        run_checked(self.runner.as_ref(), &spec, "set private key").await?;

        let address = address.to_string();
        self.run(&["ip", "address", "add", &address, "dev", self.name.as_str()], "assign address").await?;
        self.run(&["ip", "link", "set", "up", "dev", self.name.as_str()], "bring link up").await?;
        Ok(())
    }

    /// Push a batch of peers after `up`. Individual failures are logged and
    /// skipped; the number of peers now live is returned.
    pub async fn load_peers(&self, peers: &[Peer]) -> VpnResult<usize> {
        let mut state = self.state.lock().await;
        if !state.up {
            return Err(VpnError::InvalidState(format!("{} is down", self.name)));
        }

        let mut loaded = 0;
        for peer in peers {
            match self.push_peer(peer).await {
                Ok(()) => {
                    state.peers.insert(peer.public_key.clone(), peer.allowed_ips.clone());
                    loaded += 1;
                }
                Err(e) => warn!("Skipping peer {} ({}): {}", peer.name, peer.id, e),
            }
        }

        info!("Loaded {}/{} peers into {}", loaded, peers.len(), self.name);
        Ok(loaded)
    }

    /// Lower and delete the device
    pub async fn down(&self) -> VpnResult<()> {
        let mut state = self.state.lock().await;

        if self.probe_link().await? != LinkState::Absent {
            if let Err(e) = self.run(&["ip", "link", "set", "down", "dev", self.name.as_str()], "bring link down").await {
                warn!("{}", e);
            }
            self.run(&["ip", "link", "delete", "dev", self.name.as_str()], "delete interface").await?;
        }

        state.up = false;
        state.peers.clear();
        info!("Interface {} is down", self.name);
        Ok(())
    }

    /// Whether the device is up. A device left up by an earlier process is
    /// adopted and its peer list read back into the cache.
    pub async fn is_up(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.up {
            return true;
        }

        match self.probe_link().await {
            Ok(LinkState::Up) => match self.dump().await {
                Ok(rows) => {
                    debug!("Adopting live interface {}", self.name);
                    state.up = true;
                    state.peers = rows.into_iter().map(|r| (r.public_key, r.allowed_ips)).collect();
                    true
                }
                Err(e) => {
                    debug!("Could not read {}: {}", self.name, e);
                    false
                }
            },
            _ => false,
        }
    }

    /// OS link state, for drift detection
    pub async fn probe(&self) -> VpnResult<LinkState> {
        self.probe_link().await
    }

    pub async fn add_peer(&self, peer: &Peer) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        if !state.up {
            return Err(VpnError::InvalidState(format!("{} is down", self.name)));
        }

        self.push_peer(peer).await?;
        state.peers.insert(peer.public_key.clone(), peer.allowed_ips.clone());
        debug!("Added peer {} to {}", peer.name, self.name);
        Ok(())
    }

    /// Remove a peer. Returns whether the device held it.
    pub async fn remove_peer(&self, public_key: &str) -> VpnResult<bool> {
        validation::validate_wg_key(public_key)?;

        let mut state = self.state.lock().await;
        if !state.up {
            return Ok(false);
        }

        let out = run_checked(self.runner.as_ref(), &self.spec(&["wg", "show", self.name.as_str(), "peers"]), "list peers").await?;
        if !out.stdout.lines().any(|l| l.trim() == public_key) {
            state.peers.remove(public_key);
            return Ok(false);
        }

        self.run(&["wg", "set", self.name.as_str(), "peer", public_key, "remove"], "remove peer").await?;
        state.peers.remove(public_key);
        debug!("Removed peer {} from {}", public_key, self.name);
        Ok(true)
    }

    /// Number of peers the cache believes are live
    pub async fn live_peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Live statistics for the peers in `known`. Device peers without a
    /// matching row are skipped.
    pub async fn stats(&self, known: &[Peer]) -> VpnResult<Vec<PeerStats>> {
        // Not while up/down/add/remove is mid-flight
        let _state = self.state.lock().await;
        let rows = self.dump().await?;
        let now = Utc::now();

        let stats = rows
            .into_iter()
            .filter_map(|row| {
                let peer = known.iter().find(|p| p.public_key == row.public_key)?;
                Some(PeerStats {
                    peer_id: peer.id.clone(),
                    name: peer.name.clone(),
                    public_key: row.public_key,
                    endpoint: row.endpoint,
                    allowed_ips: peer.allowed_ips.clone(),
                    last_handshake: row.latest_handshake.map(|t| format_handshake(now, t)).unwrap_or_default(),
                    latest_handshake: row.latest_handshake,
                    rx_bytes: row.rx_bytes,
                    tx_bytes: row.tx_bytes,
                })
            })
            .collect();

        Ok(stats)
    }

    /// Peers with a handshake inside `window`
    pub async fn active_sessions(&self, window: chrono::Duration) -> VpnResult<usize> {
        let _state = self.state.lock().await;
        let cutoff = Utc::now() - window;
        Ok(self
            .dump()
            .await?
            .iter()
            .filter(|row| row.latest_handshake.map_or(false, |t| t >= cutoff))
            .count())
    }

    // === Helper functions ===

    async fn push_peer(&self, peer: &Peer) -> VpnResult<()> {
        validation::validate_wg_key(&peer.public_key)?;
        let allowed = validation::validate_allowed_ips(&peer.allowed_ips)?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut spec = self
            .spec(&["wg", "set", self.name.as_str(), "peer", &peer.public_key, "preshared-key", "/dev/stdin", "allowed-ips"])
            .arg(allowed)
            .stdin(format!("{}\n", peer.preshared_key.trim()));
        if let Some(endpoint) = &peer.endpoint {
            spec = spec.arg("endpoint").arg(endpoint.as_str());
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            spec = spec.arg("persistent-keepalive").arg(keepalive.to_string());
        }

        run_checked(self.runner.as_ref(), &spec, "add peer").await?;
        Ok(())
    }

    async fn probe_link(&self) -> VpnResult<LinkState> {
        let spec = self.spec(&["ip", "-json", "link", "show", "dev", self.name.as_str()]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Ok(LinkState::Absent);
        }
        parse_link_state(&out.stdout)
    }

    async fn dump(&self) -> VpnResult<Vec<DumpRow>> {
        let out = run_checked(self.runner.as_ref(), &self.spec(&["wg", "show", self.name.as_str(), "dump"]), "read statistics").await?;
        Ok(parse_dump(&out.stdout))
    }

    fn spec(&self, argv: &[&str]) -> CommandSpec {
        CommandSpec::new(argv[0]).args(argv[1..].iter().copied()).timeout(self.timeout)
    }

    async fn run(&self, argv: &[&str], step: &str) -> VpnResult<()> {
        run_checked(self.runner.as_ref(), &self.spec(argv), step).await?;
        Ok(())
    }
}

/// Link state from `ip -json link show` output
fn parse_link_state(json: &str) -> VpnResult<LinkState> {
    let value: serde_json::Value = serde_json::from_str(json)?;

    let Some(link) = value.as_array().and_then(|arr| arr.first()) else {
        return Ok(LinkState::Absent);
    };

    let up = link
        .get("flags")
        .and_then(|v| v.as_array())
        .map(|flags| flags.iter().any(|f| f.as_str() == Some("UP")))
        .unwrap_or(false);

    Ok(if up { LinkState::Up } else { LinkState::Down })
}

#[derive(Debug, Clone, PartialEq)]
struct DumpRow {
    public_key: String,
    endpoint: Option<String>,
    allowed_ips: String,
    latest_handshake: Option<DateTime<Utc>>,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Peer rows of `wg show <if> dump`. The first line describes the interface
/// itself and is skipped; malformed lines are ignored.
fn parse_dump(output: &str) -> Vec<DumpRow> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            let handshake: i64 = fields[4].parse().ok()?;
            Some(DumpRow {
                public_key: fields[0].to_string(),
                endpoint: Some(fields[2]).filter(|e| *e != "(none)").map(str::to_string),
                allowed_ips: fields[3].to_string(),
                latest_handshake: if handshake > 0 { Utc.timestamp_opt(handshake, 0).single() } else { None },
                rx_bytes: fields[5].parse().ok()?,
                tx_bytes: fields[6].parse().ok()?,
            })
        })
        .collect()
}

/// Coarse relative time: "N seconds/minutes/hours/days ago"
pub fn format_handshake(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86_400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86_400)
    }
}
