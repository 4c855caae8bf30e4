//! wiresteward
//!
//! WireGuard IP lease server and agent.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use wiresteward_common::config::{
    load_agent_config, load_server_config, load_server_peer_config, AgentConfigBuilder,
    parse_lease_time, ResolvedAgentConfig, ResolvedServerConfig, ServerConfigBuilder,
    DEFAULT_LEASES_FILE,
};
use wiresteward_lease::auth::load_auth_tokens;
use wiresteward_lease::manager::run_sync_loop;
use wiresteward_lease::server::{resolve_server_public_key, router, serve};
use wiresteward_lease::store::LeaseStore;
use wiresteward_lease::{
    Agent, AgentConfig, AgentDevice, FilePeerSource, FileTokenSource, LeaseConfig, LeaseManager,
    LeaseService, LeaseServiceConfig, ManagedSubnet, MemoryWg, PeerSource, ServerStaticConfig,
    StaticPeer, StaticPeerSource, StaticTokenSource, StaticTokenValidator, SystemClock,
    TokenSource, UnmanagedPeerPolicy, WgControl, WgPublicKey,
};

#[derive(Parser)]
#[command(name = "wiresteward")]
#[command(version)]
#[command(about = "WireGuard IP lease server and agent")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lease server (hands out addresses and reconciles the device)
    Server {
        /// Path to config file (default: ~/.config/wiresteward/server.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// WireGuard device to manage (default: wg0)
        #[arg(long)]
        device: Option<String>,

        /// Subnet leases are drawn from (e.g., 10.90.0.0/24)
        #[arg(long, env = "WGS_USER_PEER_SUBNET")]
        subnet: Option<String>,

        /// Server's own address in the subnet. Defaults to the first host.
        #[arg(long)]
        server_ip: Option<String>,

        /// HTTP listen address (default: 0.0.0.0:8080)
        #[arg(long)]
        listen_address: Option<String>,

        /// Lease file (default: /etc/wiresteward/leases.json)
        #[arg(long, env = "WGS_IP_LEASES_FILENAME")]
        leases_file: Option<PathBuf>,

        /// Lease lifetime, in seconds or as a duration like 12h (default: 43200)
        #[arg(long, env = "WGS_IP_LEASE_TIME", value_parser = parse_lease_time)]
        lease_time_secs: Option<u64>,

        /// Reconciliation interval in seconds (default: 60)
        #[arg(long)]
        sync_interval_secs: Option<u64>,

        /// What to do with device peers without a lease: remove or preserve
        #[arg(long, value_name = "POLICY")]
        unmanaged_peers: Option<String>,

        /// Accepted bearer tokens (repeatable)
        #[arg(long = "auth-tokens", value_name = "TOKEN")]
        auth_tokens: Vec<String>,

        /// File of accepted bearer tokens (one per line, # comments allowed)
        #[arg(long, value_name = "FILE")]
        auth_tokens_file: Option<PathBuf>,

        /// TOML file holding the [server_peer] table
        #[arg(long, env = "WGS_SERVER_PEER_CONFIG_PATH", value_name = "FILE")]
        server_peer_config: Option<PathBuf>,

        /// Keep WireGuard state in memory instead of configuring the kernel
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the agent (requests leases and configures local devices)
    Agent {
        /// Path to config file (default: ~/.config/wiresteward/agent.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bearer token sent to lease servers
        #[arg(long)]
        auth_token: Option<String>,

        /// File holding the bearer token, re-read before every request
        #[arg(long, value_name = "FILE")]
        auth_token_file: Option<PathBuf>,

        /// Bound on token acquisition and lease requests in seconds (default: 10)
        #[arg(long)]
        request_timeout_secs: Option<u64>,

        /// Wait after a failed lease request in seconds (default: 60)
        #[arg(long)]
        retry_interval_secs: Option<u64>,
    },
    /// Print the persisted lease table
    Leases {
        /// Server config file to take leases_file from
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Lease file to read (overrides the config)
        #[arg(long, env = "WGS_IP_LEASES_FILENAME")]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Server {
            config,
            device,
            subnet,
            server_ip,
            listen_address,
            leases_file,
            lease_time_secs,
            sync_interval_secs,
            unmanaged_peers,
            auth_tokens,
            auth_tokens_file,
            server_peer_config,
            dry_run,
        } => {
            let file = load_server_config(config.as_deref())?;
            let server_peer = server_peer_config
                .as_deref()
                .map(load_server_peer_config)
                .transpose()?
                .flatten();
            let resolved = ServerConfigBuilder::new()
                .apply_defaults()
                .apply_config(&file)
                .apply_server_peer(server_peer)
                .apply_cli(
                    device,
                    subnet,
                    server_ip,
                    listen_address,
                    leases_file,
                    lease_time_secs,
                    sync_interval_secs,
                    unmanaged_peers,
                    auth_tokens,
                    auth_tokens_file,
                )
                .build()?;
            run_server(resolved, dry_run).await
        }
        Command::Agent {
            config,
            auth_token,
            auth_token_file,
            request_timeout_secs,
            retry_interval_secs,
        } => {
            let file = load_agent_config(config.as_deref())?;
            let resolved = AgentConfigBuilder::new()
                .apply_defaults()
                .apply_config(&file)
                .apply_cli(
                    auth_token,
                    auth_token_file,
                    request_timeout_secs,
                    retry_interval_secs,
                )
                .build()?;
            run_agent(resolved).await
        }
        Command::Leases { config, file } => {
            let path = match file {
                Some(path) => wiresteward_common::config::expand_tilde(&path),
                None => load_server_config(config.as_deref())?
                    .leases_file
                    .map(|p| wiresteward_common::config::expand_tilde(&p))
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LEASES_FILE)),
            };
            print_leases(&path)
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn kernel_wg() -> Result<Arc<dyn WgControl>> {
    Ok(Arc::new(wiresteward_lease::KernelWg::new()))
}

#[cfg(not(target_os = "linux"))]
fn kernel_wg() -> Result<Arc<dyn WgControl>> {
    anyhow::bail!("Kernel WireGuard control is only supported on Linux (use --dry-run)")
}

fn parse_key(value: &str, what: &str) -> Result<WgPublicKey> {
    value
        .parse()
        .with_context(|| format!("Invalid {} '{}'", what, value))
}

/// Run the lease server.
async fn run_server(config: ResolvedServerConfig, dry_run: bool) -> Result<()> {
    let tokens = load_auth_tokens(&config.auth_tokens, config.auth_tokens_file.as_deref())
        .context("Failed to load authentication tokens")?;
    if tokens.is_empty() {
        anyhow::bail!("Lease server requires at least one authentication token");
    }
    log::info!("Loaded {} authentication token(s)", tokens.len());

    let configured_key = config
        .server_peer
        .public_key
        .as_deref()
        .map(|k| parse_key(k, "server_peer.public_key"))
        .transpose()?;

    let wg: Arc<dyn WgControl> = if dry_run {
        log::warn!("Dry run: WireGuard changes are kept in memory only");
        let memory = MemoryWg::new();
        memory.add_device(&config.device, configured_key, None);
        Arc::new(memory)
    } else {
        kernel_wg()?
    };

    let server_key = resolve_server_public_key(wg.as_ref(), &config.device, configured_key)?;

    let peers: Arc<dyn PeerSource> = match &config.peers_file {
        Some(path) => Arc::new(FilePeerSource::new(path)),
        None => {
            let peers = config
                .peers
                .iter()
                .map(|p| {
                    Ok(StaticPeer {
                        public_key: parse_key(&p.public_key, "peer public_key")?,
                        allowed_ips: p.allowed_ips.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Arc::new(StaticPeerSource::new(peers))
        }
    };

    let subnet = ManagedSubnet::new(config.subnet, config.server_ip)
        .map_err(|e| anyhow::anyhow!("Invalid subnet configuration: {}", e))?;
    let unmanaged_peers: UnmanagedPeerPolicy = config.unmanaged_peers.parse()?;

    let store = LeaseStore::open(&config.leases_file)
        .with_context(|| format!("Cannot load lease file {}", config.leases_file.display()))?;

    log::info!("wiresteward server starting:");
    log::info!("  Device: {}", config.device);
    log::info!("  Subnet: {} ({} leasable)", subnet.network(), subnet.capacity());
    log::info!("  Server IP: {}", subnet.server_ip());
    log::info!("  Server key: {}", server_key);
    log::info!("  Lease time: {:?}", config.lease_time);
    log::info!("  Sync interval: {:?}", config.sync_interval);
    log::info!("  Lease file: {}", config.leases_file.display());
    log::info!("  Unmanaged peers: {:?}", unmanaged_peers);

    let manager = Arc::new(LeaseManager::new(
        LeaseConfig {
            device: config.device.clone(),
            subnet,
            lease_time: config.lease_time,
            unmanaged_peers,
        },
        store,
        Arc::clone(&wg),
        peers,
        Arc::new(SystemClock),
    )?);

    let service = LeaseService::new(
        Arc::clone(&manager),
        Arc::new(StaticTokenValidator::new(tokens)),
        LeaseServiceConfig {
            server_static_config: ServerStaticConfig {
                public_key: server_key,
                endpoint: config.server_peer.endpoint.clone(),
                allowed_ips: config.server_peer.allowed_ips.clone(),
                persistent_keepalive: config.server_peer.persistent_keepalive,
            },
        },
    );

    let listener = TcpListener::bind(config.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_address))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_task = tokio::spawn(run_sync_loop(
        Arc::clone(&manager),
        config.sync_interval,
        shutdown_rx.clone(),
    ));
    let mut server_task = tokio::spawn(serve(listener, router(Arc::new(service)), shutdown_rx));

    tokio::select! {
        result = wait_for_signal() => {
            result?;
            log::info!("Shutdown signal received");
        }
        result = &mut server_task => {
            let _ = shutdown_tx.send(true);
            let _ = sync_task.await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("Lease server failed"),
                Err(e) => Err(e).context("Lease server task failed"),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    server_task
        .await
        .context("Lease server task failed")?
        .context("Lease server failed")?;
    sync_task.await.context("Reconciliation task failed")?;
    log::info!("wiresteward server stopped");
    Ok(())
}

/// Run the agent.
async fn run_agent(config: ResolvedAgentConfig) -> Result<()> {
    let tokens: Arc<dyn TokenSource> = match (&config.auth_token, &config.auth_token_file) {
        (Some(token), _) => Arc::new(StaticTokenSource::new(token.clone())),
        (None, Some(path)) => Arc::new(FileTokenSource::new(path)),
        (None, None) => anyhow::bail!("An auth token is required"),
    };

    let mut devices = Vec::with_capacity(config.devices.len());
    for device in &config.devices {
        let servers = device
            .peer_urls
            .iter()
            .map(|url| {
                url.parse()
                    .with_context(|| format!("Invalid peer url '{}' for {}", url, device.name))
            })
            .collect::<Result<Vec<_>>>()?;
        devices.push(AgentDevice {
            name: device.name.clone(),
            servers,
        });
    }

    let agent = Agent::new(
        AgentConfig {
            devices,
            request_timeout: config.request_timeout,
            retry_interval: config.retry_interval,
        },
        tokens,
        kernel_wg()?,
        Arc::new(SystemClock),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent_task = tokio::spawn(agent.run(shutdown_rx));

    tokio::select! {
        result = wait_for_signal() => {
            result?;
            log::info!("Shutdown signal received");
        }
        result = &mut agent_task => {
            return result.context("Agent task failed")?.context("Agent failed");
        }
    }

    let _ = shutdown_tx.send(true);
    agent_task
        .await
        .context("Agent task failed")?
        .context("Agent failed")?;
    log::info!("wiresteward agent stopped");
    Ok(())
}

/// Print the lease table in `path`.
fn print_leases(path: &Path) -> Result<()> {
    let table = LeaseStore::load(path)
        .with_context(|| format!("Cannot load lease file {}", path.display()))?;
    if table.is_empty() {
        println!("No leases in {}", path.display());
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!("{:<46} {:<18} {:<26} STATE", "PUBLIC KEY", "ADDRESS", "EXPIRES");
    let mut leases: Vec<_> = table.values().collect();
    leases.sort_by_key(|lease| lease.ip_address);
    for lease in leases {
        let state = if lease.is_expired(now) { "expired" } else { "active" };
        println!(
            "{:<46} {:<18} {:<26} {}",
            lease.public_key.to_base64(),
            Ipv4Net::from(lease.ip_address).to_string(),
            lease.expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            state
        );
    }
    Ok(())
}
