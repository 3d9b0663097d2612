//! vpnctl - VPN server control tool
//!
//! Installs, configures and supervises WireGuard, OpenVPN, PPTP and
//! L2TP/IPsec servers and manages WireGuard peers and VPN users.
//!
//! # Usage
//!
//! ```bash
//! # Bring up WireGuard
//! sudo vpnctl install wireguard
//! sudo vpnctl enable wireguard
//!
//! # Add a peer and print its client config as a QR code
//! sudo vpnctl peer add laptop
//! sudo vpnctl peer qr <peer-id>
//!
//! # Show every protocol
//! vpnctl status
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libvpnctl::{
    AptInstaller, JsonStore, KeyPair, Orchestrator, OrchestratorConfig, Peer, Protocol, ProtocolStatus,
    Systemd, SystemRunner, VpnStatistics, VpnUser,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "/etc/vpnctl/vpnctl.toml";

#[derive(Parser)]
#[command(name = "vpnctl")]
#[command(version)]
#[command(about = "VPN server control - WireGuard, OpenVPN, PPTP and L2TP/IPsec", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to /etc/vpnctl/vpnctl.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format: text, json
    #[arg(short = 'o', long, default_value = "text", global = true)]
    output: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show protocol status (all protocols when none given)
    Status { protocol: Option<Protocol> },
    /// Install the system packages of a protocol
    Install { protocol: Protocol },
    /// Create server secrets and write configuration files
    Init { protocol: Protocol },
    /// Bring a protocol live
    Enable { protocol: Protocol },
    /// Take a protocol down
    Disable { protocol: Protocol },
    /// Re-enable every protocol that is marked enabled but not running
    Restore,
    /// Connection and traffic totals across protocols
    Stats,
    /// Peer management
    #[command(subcommand)]
    Peer(PeerCommands),
    /// VPN user management
    #[command(subcommand)]
    User(UserCommands),
    /// Print the effective configuration as TOML
    ShowConfig,
    /// Generate a WireGuard key pair
    Genkey,
}

#[derive(Subcommand)]
enum PeerCommands {
    /// Create a peer
    Add {
        name: String,
        #[arg(short, long, default_value = "wireguard")]
        protocol: Protocol,
        /// Explicit allowed addresses instead of the next free /32
        #[arg(long)]
        allowed_ips: Option<String>,
        /// Owning user (username)
        #[arg(long)]
        owner: Option<String>,
    },
    /// List peers
    List {
        #[arg(short, long, default_value = "wireguard")]
        protocol: Protocol,
    },
    /// Show one peer
    Show { id: String },
    /// Delete a peer
    Rm { id: String },
    /// Enable a peer
    Enable { id: String },
    /// Disable a peer
    Disable { id: String },
    /// Issue new keys for a peer
    Rotate { id: String },
    /// Rename or describe a peer
    Set {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Print or save the client configuration
    Config {
        id: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Print the client configuration as a QR code
    Qr {
        id: String,
        /// SVG instead of terminal blocks
        #[arg(long)]
        svg: bool,
    },
    /// Live traffic and handshake statistics
    Stats {
        #[arg(short, long, default_value = "wireguard")]
        protocol: Protocol,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Add {
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "VPNCTL_PASSWORD")]
        password: String,
    },
    /// List users
    List,
    /// Show one user and its protocol access
    Show { username: String },
    /// Delete a user and every peer it owns
    Rm { username: String },
    /// Enable a user
    Enable { username: String },
    /// Disable a user
    Disable { username: String },
    /// Change a password
    Passwd {
        username: String,
        #[arg(long, env = "VPNCTL_PASSWORD")]
        password: String,
    },
    /// Grant or revoke protocol access (shows access when no flag is given)
    Access {
        username: String,
        #[arg(long)]
        grant: Vec<Protocol>,
        #[arg(long)]
        revoke: Vec<Protocol>,
    },
    /// Check a password
    Verify {
        username: String,
        #[arg(long, env = "VPNCTL_PASSWORD")]
        password: String,
    },
    /// Create a peer for a user, subject to its access rights
    Provision {
        username: String,
        name: String,
        #[arg(short, long, default_value = "wireguard")]
        protocol: Protocol,
    },
    /// Account counters
    Stats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vpnctl={},libvpnctl={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            OrchestratorConfig::load(DEFAULT_CONFIG_PATH).with_context(|| format!("loading {}", DEFAULT_CONFIG_PATH))
        }
        None => {
            debug!("No configuration file, using defaults");
            Ok(OrchestratorConfig::default())
        }
    }
}

async fn build(config: OrchestratorConfig) -> Result<Orchestrator> {
    let store = JsonStore::open(&config.paths.state_file)
        .await
        .with_context(|| format!("opening state file {}", config.paths.state_file.display()))?;
    let runner = Arc::new(SystemRunner::new());
    let installer = Arc::new(AptInstaller::new(
        runner.clone(),
        config.timeouts.command(),
        config.timeouts.install(),
    ));
    let supervisor = Arc::new(Systemd::new(runner.clone(), config.timeouts.command()));
    Ok(Orchestrator::new(config, Arc::new(store), runner, installer, supervisor)?)
}

/// Host changes need root; warn early instead of failing halfway
fn warn_if_not_root() {
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::geteuid() };
        if uid != 0 {
            warn!("Not running as root - system changes will likely fail");
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let json = match cli.output.as_str() {
        "json" => true,
        "text" => false,
        other => bail!("unknown output format '{}'", other),
    };

    if let Commands::Genkey = cli.command {
        let pair = KeyPair::generate();
        if json {
            print_json(&serde_json::json!({ "private_key": pair.private_key, "public_key": pair.public_key }))?;
        } else {
            println!("PrivateKey = {}", pair.private_key);
            println!("PublicKey = {}", pair.public_key);
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    if let Commands::ShowConfig = cli.command {
        print!("{}", toml::to_string_pretty(&config).context("serializing configuration")?);
        return Ok(());
    }

    let orch = build(config).await?;

    match cli.command {
        Commands::Status { protocol } => {
            let statuses = match protocol {
                Some(p) => vec![orch.lifecycle().status(p).await?],
                None => orch.lifecycle().statuses().await?,
            };
            if json {
                print_json(&statuses)?;
            } else {
                print_statuses(&statuses);
            }
        }
        Commands::Stats => {
            let stats = orch.statistics().await?;
            if json {
                print_json(&stats)?;
            } else {
                print_statistics(&stats);
            }
        }
        Commands::Install { protocol } => {
            warn_if_not_root();
            orch.lifecycle().install(protocol).await?;
            println!("{} installed", protocol);
        }
        Commands::Init { protocol } => {
            warn_if_not_root();
            let cfg = orch.lifecycle().initialize(protocol).await?;
            println!("{} initialized ({})", protocol, cfg.config_path.display());
            if let Some(public_key) = cfg.public_key {
                println!("Server public key: {}", public_key);
            }
        }
        Commands::Enable { protocol } => {
            warn_if_not_root();
            orch.lifecycle().enable(protocol).await?;
            println!("{} enabled", protocol);
        }
        Commands::Disable { protocol } => {
            warn_if_not_root();
            orch.lifecycle().disable(protocol).await?;
            println!("{} disabled", protocol);
        }
        Commands::Restore => {
            warn_if_not_root();
            let failed = orch.restore().await?;
            for (protocol, e) in &failed {
                eprintln!("{}: {}", protocol, e);
            }
            if !failed.is_empty() {
                bail!("{} protocol(s) could not be restored", failed.len());
            }
            info!("Restore complete");
        }
        Commands::Peer(cmd) => handle_peer(&orch, cmd, json).await?,
        Commands::User(cmd) => handle_user(&orch, cmd, json).await?,
        Commands::ShowConfig | Commands::Genkey => {}
    }

    Ok(())
}

async fn handle_peer(orch: &Orchestrator, cmd: PeerCommands, json: bool) -> Result<()> {
    let peers = orch.peers();

    match cmd {
        PeerCommands::Add { name, protocol, allowed_ips, owner } => {
            let owner = match owner {
                Some(username) => Some(orch.users().get_user_by_username(&username).await?.id),
                None => None,
            };
            let peer = peers
                .create_peer(protocol, &name, allowed_ips.as_deref(), owner.as_deref())
                .await?;
            if json {
                print_json(&peer_view(&peer))?;
            } else {
                println!("Created peer '{}' ({}) at {}", peer.name, peer.id, peer.allowed_ips);
            }
        }
        PeerCommands::List { protocol } => {
            let list = peers.list_peers(protocol).await?;
            if json {
                print_json(&list.iter().map(peer_view).collect::<Vec<_>>())?;
            } else {
                println!("{:<36}  {:<20}  {:<18}  {}", "ID", "NAME", "ADDRESS", "ENABLED");
                for peer in list {
                    println!("{:<36}  {:<20}  {:<18}  {}", peer.id, peer.name, peer.allowed_ips, peer.enabled);
                }
            }
        }
        PeerCommands::Show { id } => {
            let peer = peers.get_peer(&id).await?;
            if json {
                print_json(&peer_view(&peer))?;
            } else {
                print_peer(&peer);
            }
        }
        PeerCommands::Rm { id } => {
            peers.delete_peer(&id).await?;
            println!("Peer {} deleted", id);
        }
        PeerCommands::Enable { id } => {
            let peer = peers.set_peer_enabled(&id, true).await?;
            println!("Peer '{}' enabled", peer.name);
        }
        PeerCommands::Disable { id } => {
            let peer = peers.set_peer_enabled(&id, false).await?;
            println!("Peer '{}' disabled", peer.name);
        }
        PeerCommands::Rotate { id } => {
            let peer = peers.rotate_keys(&id).await?;
            println!("Peer '{}' has a new public key: {}", peer.name, peer.public_key);
        }
        PeerCommands::Set { id, name, description } => {
            let peer = peers.update_peer(&id, name.as_deref(), description.as_deref()).await?;
            print_peer(&peer);
        }
        PeerCommands::Config { id, save } => {
            let text = peers.generate_client_config(&id).await?;
            match save {
                Some(path) => {
                    libvpnctl::files::write_secure_config(&path, &text, 0o600)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Client configuration written to {}", path.display());
                }
                None => print!("{}", text),
            }
        }
        PeerCommands::Qr { id, svg } => {
            let code = if svg {
                peers.generate_qr_svg(&id).await?
            } else {
                peers.generate_qr_text(&id).await?
            };
            println!("{}", code);
        }
        PeerCommands::Stats { protocol } => {
            let stats = peers.peer_stats(protocol).await?;
            if json {
                print_json(&stats)?;
            } else if stats.is_empty() {
                println!("No live peers");
            } else {
                println!("{:<20}  {:<22}  {:<18}  {:>12}  {:>12}", "NAME", "ENDPOINT", "HANDSHAKE", "RX", "TX");
                for s in stats {
                    println!(
                        "{:<20}  {:<22}  {:<18}  {:>12}  {:>12}",
                        s.name,
                        s.endpoint.as_deref().unwrap_or("-"),
                        if s.last_handshake.is_empty() { "never" } else { s.last_handshake.as_str() },
                        s.rx_bytes,
                        s.tx_bytes
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_user(orch: &Orchestrator, cmd: UserCommands, json: bool) -> Result<()> {
    let users = orch.users();

    match cmd {
        UserCommands::Add { username, email, password } => {
            let user = users.create_user(&username, &email, &password).await?;
            if json {
                print_json(&user_view(&user))?;
            } else {
                println!("Created user '{}' ({})", user.username, user.id);
            }
        }
        UserCommands::List => {
            let list = users.list_users().await?;
            if json {
                print_json(&list.iter().map(user_view).collect::<Vec<_>>())?;
            } else {
                println!("{:<20}  {:<30}  {:<8}  {}", "USERNAME", "EMAIL", "ENABLED", "LAST CONNECTION");
                for user in list {
                    println!(
                        "{:<20}  {:<30}  {:<8}  {}",
                        user.username,
                        user.email,
                        user.enabled,
                        user.last_connection.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
                    );
                }
            }
        }
        UserCommands::Show { username } => {
            let user = users.get_user_by_username(&username).await?;
            let access = users.get_protocol_access(&user.id).await?;
            if json {
                let mut view = user_view(&user);
                view["access"] = serde_json::to_value(&access)?;
                print_json(&view)?;
            } else {
                println!("Username: {}", user.username);
                println!("ID:       {}", user.id);
                println!("Email:    {}", user.email);
                println!("Enabled:  {}", user.enabled);
                print_access(&access);
            }
        }
        UserCommands::Rm { username } => {
            let user = users.get_user_by_username(&username).await?;
            orch.delete_user(&user.id).await?;
            println!("User '{}' deleted", username);
        }
        UserCommands::Enable { username } => {
            let user = users.get_user_by_username(&username).await?;
            users.set_user_enabled(&user.id, true).await?;
            println!("User '{}' enabled", username);
        }
        UserCommands::Disable { username } => {
            let user = users.get_user_by_username(&username).await?;
            users.set_user_enabled(&user.id, false).await?;
            println!("User '{}' disabled", username);
        }
        UserCommands::Passwd { username, password } => {
            let user = users.get_user_by_username(&username).await?;
            users.update_password(&user.id, &password).await?;
            println!("Password of '{}' changed", username);
        }
        UserCommands::Access { username, grant, revoke } => {
            let user = users.get_user_by_username(&username).await?;
            if !grant.is_empty() || !revoke.is_empty() {
                let mut changes = BTreeMap::new();
                for protocol in grant {
                    changes.insert(protocol, true);
                }
                for protocol in revoke {
                    changes.insert(protocol, false);
                }
                users.update_protocol_access(&user.id, &changes).await?;
            }
            let access = users.get_protocol_access(&user.id).await?;
            if json {
                print_json(&access)?;
            } else {
                print_access(&access);
            }
        }
        UserCommands::Verify { username, password } => {
            let user = users.verify_password(&username, &password).await?;
            users.update_last_connection(&user.id).await?;
            println!("Credentials of '{}' are valid", user.username);
        }
        UserCommands::Provision { username, name, protocol } => {
            let user = users.get_user_by_username(&username).await?;
            let peer = orch.provision_peer(&user.id, protocol, &name).await?;
            if json {
                print_json(&peer_view(&peer))?;
            } else {
                println!("Created peer '{}' ({}) at {} for '{}'", peer.name, peer.id, peer.allowed_ips, username);
            }
        }
        UserCommands::Stats => {
            let stats = users.user_stats().await?;
            if json {
                print_json(&stats)?;
            } else {
                println!("Total:            {}", stats.total);
                println!("Enabled:          {}", stats.enabled);
                println!("Connected (24h):  {}", stats.connected_24h);
            }
        }
    }
    Ok(())
}

// === Output helpers ===

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("JSON serialization error")?);
    Ok(())
}

fn print_statuses(statuses: &[ProtocolStatus]) {
    println!(
        "{:<10}  {:<9}  {:<7}  {:<7}  {:>8}  {}",
        "PROTOCOL", "INSTALLED", "ENABLED", "RUNNING", "SESSIONS", "NOTE"
    );
    for s in statuses {
        let note = match (&s.last_error, s.drift) {
            (Some(e), _) => e.clone(),
            (None, true) => "drift".to_string(),
            (None, false) => String::new(),
        };
        println!(
            "{:<10}  {:<9}  {:<7}  {:<7}  {:>8}  {}",
            s.protocol, s.installed, s.enabled, s.running, s.session_count, note
        );
    }
}

fn print_statistics(stats: &VpnStatistics) {
    println!("Connections:       {}", stats.total_connections);
    println!("Active protocols:  {}", stats.active_protocols);
    println!("Bytes in:          {}", stats.total_bytes_in);
    println!("Bytes out:         {}", stats.total_bytes_out);
    for (protocol, count) in &stats.connections_by_protocol {
        println!("  {:<10} {}", protocol, count);
    }
}

fn print_peer(peer: &Peer) {
    println!("ID:          {}", peer.id);
    println!("Name:        {}", peer.name);
    if let Some(description) = &peer.description {
        println!("Description: {}", description);
    }
    println!("Protocol:    {}", peer.protocol);
    println!("Public key:  {}", peer.public_key);
    println!("Address:     {}", peer.allowed_ips);
    println!("Enabled:     {}", peer.enabled);
    if let Some(owner) = &peer.owner {
        println!("Owner:       {}", owner);
    }
    println!("Created:     {}", peer.created_at.to_rfc3339());
}

fn print_access(access: &BTreeMap<Protocol, bool>) {
    for protocol in Protocol::ALL {
        let allowed = access.get(&protocol).copied().unwrap_or(false);
        println!("  {:<10} {}", protocol, if allowed { "allowed" } else { "denied" });
    }
}

/// Peer without its secrets
fn peer_view(peer: &Peer) -> serde_json::Value {
    serde_json::json!({
        "id": peer.id,
        "protocol": peer.protocol,
        "name": peer.name,
        "description": peer.description,
        "public_key": peer.public_key,
        "allowed_ips": peer.allowed_ips,
        "enabled": peer.enabled,
        "owner": peer.owner,
        "created_at": peer.created_at,
    })
}

/// User without its password hash
fn user_view(user: &VpnUser) -> serde_json::Value {
    serde_json::json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "enabled": user.enabled,
        "last_connection": user.last_connection,
        "created_at": user.created_at,
    })
}
