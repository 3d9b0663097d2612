//! Shared fakes for the integration tests
//!
//! `FakeHost` answers `ip`, `wg`, `sysctl` and `iptables` the way a Linux
//! host would, keeping just enough state (links, WireGuard peers, firewall
//! rules) for the orchestrator to observe its own changes.

#![allow(dead_code)]

use async_trait::async_trait;
use libvpnctl::{
    CommandOutput, CommandRunner, CommandSpec, JsonStore, Orchestrator, OrchestratorConfig, PackageInstaller,
    ServiceSupervisor, Store, VpnError, VpnResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
pub struct Link {
    pub up: bool,
    pub addresses: Vec<String>,
    /// public key -> allowed ips
    pub peers: BTreeMap<String, String>,
    /// public key -> (latest handshake, rx, tx)
    pub traffic: BTreeMap<String, (i64, u64, u64)>,
}

#[derive(Debug, Default)]
struct HostState {
    links: HashMap<String, Link>,
    rules: BTreeSet<String>,
    failures: Vec<String>,
    history: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command whose command line contains `pattern`
    pub fn fail_on(&self, pattern: &str) {
        self.state.lock().unwrap().failures.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.state.lock().unwrap().links.get(name).cloned()
    }

    /// Simulate someone deleting the device behind our back
    pub fn remove_link(&self, name: &str) {
        self.state.lock().unwrap().links.remove(name);
    }

    /// Make a peer look connected with the given counters
    pub fn set_traffic(&self, name: &str, public_key: &str, handshake: i64, rx: u64, tx: u64) {
        if let Some(link) = self.state.lock().unwrap().links.get_mut(name) {
            link.traffic.insert(public_key.to_string(), (handshake, rx, tx));
        }
    }

    /// Drop a peer from the device without telling the orchestrator
    pub fn forget_peer(&self, name: &str, public_key: &str) {
        if let Some(link) = self.state.lock().unwrap().links.get_mut(name) {
            link.peers.remove(public_key);
        }
    }

    pub fn rules(&self) -> Vec<String> {
        self.state.lock().unwrap().rules.iter().cloned().collect()
    }

    pub fn history(&self) -> Vec<String> {
        self.state.lock().unwrap().history.clone()
    }

    fn respond(state: &mut HostState, spec: &CommandSpec) -> CommandOutput {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match spec.program.as_str() {
            "ip" => Self::ip(state, &args),
            "wg" => Self::wg(state, &args),
            "sysctl" => CommandOutput::ok(""),
            "iptables" => Self::iptables(state, &args),
            other => CommandOutput::failed(127, &format!("{}: command not found", other)),
        }
    }

    fn ip(state: &mut HostState, args: &[&str]) -> CommandOutput {
        match args {
            ["-json", "link", "show", "dev", name] => match state.links.get(*name) {
                Some(link) => {
                    let flags = if link.up { r#"["POINTOPOINT","NOARP","UP","LOWER_UP"]"# } else { r#"["POINTOPOINT","NOARP"]"# };
                    CommandOutput::ok(&format!(r#"[{{"ifindex":7,"ifname":"{}","flags":{},"mtu":1420}}]"#, name, flags))
                }
                None => CommandOutput::failed(1, &format!("Device \"{}\" does not exist.", name)),
            },
            ["-json", "address", "show", "type", "ppp"] => CommandOutput::ok("[]"),
            ["link", "add", "dev", name, "type", "wireguard"] => {
                if state.links.contains_key(*name) {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists");
                }
                state.links.insert(name.to_string(), Link::default());
                CommandOutput::ok("")
            }
            ["link", "delete", "dev", name] => match state.links.remove(*name) {
                Some(_) => CommandOutput::ok(""),
                None => CommandOutput::failed(1, "Cannot find device"),
            },
            ["link", "set", dir, "dev", name] => match state.links.get_mut(*name) {
                Some(link) => {
                    link.up = *dir == "up";
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, "Cannot find device"),
            },
            ["address", "add", addr, "dev", name] => match state.links.get_mut(*name) {
                Some(link) => {
                    link.addresses.push(addr.to_string());
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, "Cannot find device"),
            },
            _ => CommandOutput::failed(1, "unsupported ip invocation"),
        }
    }

    fn wg(state: &mut HostState, args: &[&str]) -> CommandOutput {
        let Some(name) = args.get(1) else {
            return CommandOutput::failed(1, "usage");
        };
        let Some(link) = state.links.get_mut(*name) else {
            return CommandOutput::failed(1, "Unable to access interface: No such device");
        };

        match args {
            ["set", _, "listen-port", ..] => CommandOutput::ok(""),
            ["set", _, "peer", key, "remove"] => {
                link.peers.remove(*key);
                CommandOutput::ok("")
            }
            ["set", _, "peer", key, rest @ ..] => {
                let allowed = rest
                    .iter()
                    .position(|a| *a == "allowed-ips")
                    .and_then(|i| rest.get(i + 1))
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                link.peers.insert(key.to_string(), allowed);
                CommandOutput::ok("")
            }
            ["show", _, "peers"] => {
                let keys: Vec<&str> = link.peers.keys().map(String::as_str).collect();
                CommandOutput::ok(&format!("{}\n", keys.join("\n")))
            }
            ["show", _, "dump"] => {
                let mut out = String::from("cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n");
                for (key, allowed) in &link.peers {
                    let (handshake, rx, tx) = link.traffic.get(key).copied().unwrap_or_default();
                    out.push_str(&format!("{}\t(none)\t(none)\t{}\t{}\t{}\t{}\t25\n", key, allowed, handshake, rx, tx));
                }
                CommandOutput::ok(&out)
            }
            _ => CommandOutput::failed(1, "unsupported wg invocation"),
        }
    }

    fn iptables(state: &mut HostState, args: &[&str]) -> CommandOutput {
        // -t <table> <action> <chain> <spec...>
        let ["-t", table, action, chain, spec @ ..] = args else {
            return CommandOutput::failed(2, "bad iptables invocation");
        };
        let rule = format!("{} {} {}", table, chain, spec.join(" "));
        match *action {
            "-C" if state.rules.contains(&rule) => CommandOutput::ok(""),
            "-C" => CommandOutput::failed(1, "Bad rule (does a matching rule exist in that chain?)."),
            "-A" => {
                state.rules.insert(rule);
                CommandOutput::ok("")
            }
            "-D" if state.rules.remove(&rule) => CommandOutput::ok(""),
            "-D" => CommandOutput::failed(1, "Bad rule (does a matching rule exist in that chain?)."),
            _ => CommandOutput::failed(2, "unknown action"),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, spec: &CommandSpec) -> VpnResult<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        let line = spec.display();
        state.history.push(line.clone());
        if state.failures.iter().any(|p| line.contains(p.as_str())) {
            return Ok(CommandOutput::failed(1, "simulated failure"));
        }
        Ok(Self::respond(&mut state, spec))
    }
}

/// Package installer that remembers what it installed
#[derive(Debug, Default)]
pub struct FakeInstaller {
    installed: Mutex<BTreeSet<String>>,
    pub install_runs: Mutex<Vec<Vec<String>>>,
    fail: Mutex<bool>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_installed(names: &[&str]) -> Self {
        let installer = Self::default();
        installer.installed.lock().unwrap().extend(names.iter().map(|n| n.to_string()));
        installer
    }

    pub fn fail_installs(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn ensure_installed(&self, names: &[String]) -> VpnResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(VpnError::Timeout("'apt-get install -y' did not finish within 600s".to_string()));
        }
        let mut installed = self.installed.lock().unwrap();
        let missing: Vec<String> = names.iter().filter(|n| !installed.contains(*n)).cloned().collect();
        installed.extend(missing.iter().cloned());
        self.install_runs.lock().unwrap().push(missing);
        Ok(())
    }

    async fn is_installed(&self, name: &str) -> bool {
        self.installed.lock().unwrap().contains(name)
    }
}

/// Service supervisor that tracks which units are active
#[derive(Debug, Default)]
pub struct FakeSupervisor {
    active: Mutex<BTreeSet<String>>,
    enabled: Mutex<BTreeSet<String>>,
    /// Units that start "successfully" but never become active
    dead_on_arrival: Mutex<BTreeSet<String>>,
    restarts: Mutex<Vec<String>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn never_activates(&self, service: &str) {
        self.dead_on_arrival.lock().unwrap().insert(service.to_string());
    }

    pub fn active(&self) -> Vec<String> {
        self.active.lock().unwrap().iter().cloned().collect()
    }

    pub fn enabled(&self) -> Vec<String> {
        self.enabled.lock().unwrap().iter().cloned().collect()
    }

    /// Units restarted so far, in order
    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceSupervisor for FakeSupervisor {
    async fn enable(&self, service: &str) -> VpnResult<()> {
        self.enabled.lock().unwrap().insert(service.to_string());
        Ok(())
    }

    async fn start(&self, service: &str) -> VpnResult<()> {
        if !self.dead_on_arrival.lock().unwrap().contains(service) {
            self.active.lock().unwrap().insert(service.to_string());
        }
        Ok(())
    }

    async fn stop(&self, service: &str) -> VpnResult<()> {
        self.active.lock().unwrap().remove(service);
        Ok(())
    }

    async fn restart(&self, service: &str) -> VpnResult<()> {
        self.restarts.lock().unwrap().push(service.to_string());
        self.start(service).await
    }

    async fn disable(&self, service: &str) -> VpnResult<()> {
        self.enabled.lock().unwrap().remove(service);
        Ok(())
    }

    async fn is_active(&self, service: &str) -> bool {
        self.active.lock().unwrap().contains(service)
    }
}

/// Every package any protocol needs
pub const ALL_PACKAGES: &[&str] = &["wireguard", "wireguard-tools", "openvpn", "easy-rsa", "pptpd", "xl2tpd", "strongswan"];

pub struct Harness {
    pub orch: Orchestrator,
    pub host: Arc<FakeHost>,
    pub installer: Arc<FakeInstaller>,
    pub supervisor: Arc<FakeSupervisor>,
    pub config: OrchestratorConfig,
}

/// Orchestrator over a JSON store under `root` with every package installed
pub async fn harness(root: &Path) -> Harness {
    harness_with(root, Arc::new(FakeHost::new()), Arc::new(FakeInstaller::with_installed(ALL_PACKAGES))).await
}

pub async fn harness_with(root: &Path, host: Arc<FakeHost>, installer: Arc<FakeInstaller>) -> Harness {
    let runner: Arc<dyn CommandRunner> = host.clone();
    harness_over(root, runner, host, installer).await
}

/// Like [`harness_with`] but commands go through `runner`, which is expected
/// to end up at `host`
pub async fn harness_over(
    root: &Path,
    runner: Arc<dyn CommandRunner>,
    host: Arc<FakeHost>,
    installer: Arc<FakeInstaller>,
) -> Harness {
    let mut config = OrchestratorConfig::with_root(root);
    config.protocols.wireguard.server_address = "vpn.example.com".to_string();
    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&config.paths.state_file).await.unwrap());
    let supervisor = Arc::new(FakeSupervisor::new());
    let orch = Orchestrator::new(config.clone(), store, runner, installer.clone(), supervisor.clone())
        .unwrap()
        .with_hash_cost(4);
    Harness { orch, host, installer, supervisor, config }
}
