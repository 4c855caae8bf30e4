//! Configuration file support for wiresteward.
//!
//! Server and agent each read one TOML file. Values are layered: built-in
//! defaults, then the file, then command-line flags and environment
//! variables. The `Resolved*Config` structs hold the final, validated values.
//!
//! Server example (`~/.config/wiresteward/server.toml`):
//!
//! ```toml
//! device = "wg0"
//! subnet = "10.90.0.0/24"
//! listen_address = "0.0.0.0:8080"
//! leases_file = "/etc/wiresteward/leases.json"
//! auth_tokens_file = "/etc/wiresteward/tokens"
//!
//! [server_peer]
//! endpoint = "vpn.example.com:51820"
//! allowed_ips = ["10.90.0.0/24"]
//! persistent_keepalive = 25
//! ```
//!
//! Agent example (`~/.config/wiresteward/agent.toml`):
//!
//! ```toml
//! auth_token_file = "~/.cache/wiresteward/token"
//!
//! [[devices]]
//! name = "wg-office"
//!
//! [[devices.peers]]
//! url = "https://vpn.example.com"
//! ```

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default WireGuard device managed by the server.
pub const DEFAULT_DEVICE: &str = "wg0";

/// Default HTTP listen address of the lease server.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Default lease file.
pub const DEFAULT_LEASES_FILE: &str = "/etc/wiresteward/leases.json";

/// Default lease lifetime (12 hours).
pub const DEFAULT_LEASE_TIME_SECS: u64 = 12 * 60 * 60;

/// Longest accepted lease lifetime (one year).
pub const MAX_LEASE_TIME_SECS: u64 = 365 * 24 * 60 * 60;

/// Default reconciliation interval.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Default policy for device peers the server does not manage.
pub const DEFAULT_UNMANAGED_PEERS: &str = "remove";

/// Default bound on agent token acquisition and lease requests.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default agent wait after a failed lease request.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;

// ============================================================================
// File Schema
// ============================================================================

/// A statically configured peer (`[[peers]]`).
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub public_key: String,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// What agents are told about the server peer (`[server_peer]`).
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ServerPeerConfig {
    /// Server's WireGuard public key; read from the device when absent.
    pub public_key: Option<String>,
    /// `host:port` agents send WireGuard traffic to.
    pub endpoint: Option<String>,
    /// Ranges agents route through the server.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

/// File holding only a `[server_peer]` table.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ServerPeerFile {
    pub server_peer: Option<ServerPeerConfig>,
}

/// Server configuration file.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ServerFileConfig {
    pub device: Option<String>,
    /// Subnet leases are drawn from (e.g. "10.90.0.0/24").
    pub subnet: Option<String>,
    /// Server's own address in the subnet (defaults to the first host).
    pub server_ip: Option<String>,
    pub listen_address: Option<String>,
    pub leases_file: Option<PathBuf>,
    pub lease_time_secs: Option<u64>,
    pub sync_interval_secs: Option<u64>,
    /// "remove" or "preserve".
    pub unmanaged_peers: Option<String>,
    /// Prefer `auth_tokens_file` in production.
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    pub auth_tokens_file: Option<PathBuf>,
    /// TOML file of `[[peers]]`, re-read on every reconciliation pass.
    pub peers_file: Option<PathBuf>,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    pub server_peer: Option<ServerPeerConfig>,
}

/// One peer server of an agent device (`[[devices.peers]]`).
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AgentPeerConfig {
    pub url: String,
}

/// One agent device (`[[devices]]`).
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AgentDeviceConfig {
    pub name: String,
    #[serde(default)]
    pub peers: Vec<AgentPeerConfig>,
}

/// Agent configuration file.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AgentFileConfig {
    pub auth_token: Option<String>,
    /// Re-read before every request.
    pub auth_token_file: Option<PathBuf>,
    pub request_timeout_secs: Option<u64>,
    pub retry_interval_secs: Option<u64>,
    #[serde(default)]
    pub devices: Vec<AgentDeviceConfig>,
}

// ============================================================================
// Validation
// ============================================================================

fn parse_cidr(value: &str, field_name: &str) -> Result<IpNet> {
    value.trim().parse::<IpNet>().with_context(|| {
        format!(
            "Invalid {} '{}'. Expected format: 10.0.0.0/24",
            field_name, value
        )
    })
}

fn parse_subnet(value: &str) -> Result<Ipv4Net> {
    let subnet = value.trim().parse::<Ipv4Net>().with_context(|| {
        format!(
            "Invalid subnet '{}'. Expected an IPv4 CIDR such as 10.90.0.0/24",
            value
        )
    })?;
    Ok(subnet.trunc())
}

fn parse_server_ip(value: &str, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
    let ip: Ipv4Addr = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid server_ip '{}'", value))?;
    if !subnet.contains(&ip) {
        anyhow::bail!("server_ip {} is not within subnet {}", ip, subnet);
    }
    if ip == subnet.network() {
        anyhow::bail!("server_ip {} is the network address of {}", ip, subnet);
    }
    if subnet.prefix_len() < 31 && ip == subnet.broadcast() {
        anyhow::bail!("server_ip {} is the broadcast address of {}", ip, subnet);
    }
    Ok(ip)
}

/// Validate that a string is a `host:port` address.
fn validate_host_port(value: &str, field_name: &str) -> Result<()> {
    let (host, port) = value.rsplit_once(':').ok_or_else(|| {
        anyhow::anyhow!(
            "{} '{}' missing port. Expected format: host:port",
            field_name,
            value
        )
    })?;
    if host.trim_matches(|c| c == '[' || c == ']').is_empty() {
        anyhow::bail!("{} '{}' missing host", field_name, value);
    }
    port.parse::<u16>()
        .with_context(|| format!("{} '{}' has an invalid port", field_name, value))?;
    Ok(())
}

/// Validate that a string is an http:// or https:// URL with a host.
fn validate_http_url(value: &str, field_name: &str) -> Result<()> {
    let url = url::Url::parse(value).with_context(|| {
        format!(
            "Invalid {} '{}'. Expected format: http(s)://host[:port][/path]",
            field_name, value
        )
    })?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        anyhow::bail!(
            "Invalid {} scheme '{}'. Must be http or https",
            field_name,
            scheme
        );
    }
    if url.host_str().map_or(true, str::is_empty) {
        anyhow::bail!("{} '{}' missing host", field_name, value);
    }
    Ok(())
}

fn positive_secs(value: u64, field_name: &str) -> Result<Duration> {
    if value == 0 {
        anyhow::bail!("{} must be greater than zero", field_name);
    }
    Ok(Duration::from_secs(value))
}

/// Parse a lease time given either as whole seconds (`43200`) or as a
/// duration string (`12h`, `30m`, `1h 30m`).
pub fn parse_lease_time(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }
    let duration = humantime::parse_duration(value)
        .map_err(|e| format!("invalid lease time '{}': {}", value, e))?;
    if duration.subsec_nanos() != 0 {
        return Err(format!("lease time '{}' must be whole seconds", value));
    }
    Ok(duration.as_secs())
}

// ============================================================================
// Config Loading
// ============================================================================

/// Expand tilde (~) in paths to the user's home directory.
///
/// - `~/...` expands to the user's home directory
/// - `~` alone expands to the home directory
/// - Other paths are returned unchanged
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Load configuration from a TOML file.
fn load_config<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_config_path(file: &str) -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("wiresteward").join(file))
}

/// Load an explicitly given config file, or the default one if it exists.
///
/// An explicit path must exist. A missing default file yields defaults only.
fn load_or_default<T>(path: Option<&Path>, default_file: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match path {
        Some(p) => load_config(&expand_tilde(p)),
        None => match default_config_path(default_file) {
            Some(p) if p.exists() => load_config(&p),
            _ => Ok(T::default()),
        },
    }
}

/// Load server configuration (default: ~/.config/wiresteward/server.toml).
pub fn load_server_config(path: Option<&Path>) -> Result<ServerFileConfig> {
    load_or_default(path, "server.toml")
}

/// Load agent configuration (default: ~/.config/wiresteward/agent.toml).
pub fn load_agent_config(path: Option<&Path>) -> Result<AgentFileConfig> {
    load_or_default(path, "agent.toml")
}

/// Load a file holding a `[server_peer]` table.
pub fn load_server_peer_config(path: &Path) -> Result<Option<ServerPeerConfig>> {
    let file: ServerPeerFile = load_config(&expand_tilde(path))?;
    Ok(file.server_peer)
}

// ============================================================================
// Server
// ============================================================================

/// A statically configured peer, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPeer {
    pub public_key: String,
    pub allowed_ips: Vec<IpNet>,
}

/// Server peer metadata, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServerPeer {
    pub public_key: Option<String>,
    pub endpoint: String,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

/// Resolved server configuration (all values finalized).
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub device: String,
    pub subnet: Ipv4Net,
    pub server_ip: Option<Ipv4Addr>,
    pub listen_address: SocketAddr,
    pub leases_file: PathBuf,
    pub lease_time: Duration,
    pub sync_interval: Duration,
    pub unmanaged_peers: String,
    pub auth_tokens: Vec<String>,
    pub auth_tokens_file: Option<PathBuf>,
    pub peers_file: Option<PathBuf>,
    pub peers: Vec<ResolvedPeer>,
    pub server_peer: ResolvedServerPeer,
}

/// Builder for server configuration with layered overrides.
///
/// Usage:
/// ```ignore
/// let config = ServerConfigBuilder::new()
///     .apply_defaults()
///     .apply_config(&file_config)
///     .apply_server_peer(env_server_peer)
///     .apply_cli(device, subnet, ...)
///     .build()?;
/// ```
#[derive(Default)]
pub struct ServerConfigBuilder {
    device: Option<String>,
    subnet: Option<String>,
    server_ip: Option<String>,
    listen_address: Option<String>,
    leases_file: Option<PathBuf>,
    lease_time_secs: Option<u64>,
    sync_interval_secs: Option<u64>,
    unmanaged_peers: Option<String>,
    auth_tokens: Vec<String>,
    auth_tokens_file: Option<PathBuf>,
    peers_file: Option<PathBuf>,
    peers: Vec<PeerEntry>,
    server_peer: Option<ServerPeerConfig>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply default values (lowest priority).
    pub fn apply_defaults(mut self) -> Self {
        self.device = Some(DEFAULT_DEVICE.to_string());
        self.listen_address = Some(DEFAULT_LISTEN_ADDRESS.to_string());
        self.leases_file = Some(PathBuf::from(DEFAULT_LEASES_FILE));
        self.lease_time_secs = Some(DEFAULT_LEASE_TIME_SECS);
        self.sync_interval_secs = Some(DEFAULT_SYNC_INTERVAL_SECS);
        self.unmanaged_peers = Some(DEFAULT_UNMANAGED_PEERS.to_string());
        self
    }

    /// Apply values from the TOML file (middle priority).
    pub fn apply_config(mut self, cfg: &ServerFileConfig) -> Self {
        if cfg.device.is_some() {
            self.device = cfg.device.clone();
        }
        if cfg.subnet.is_some() {
            self.subnet = cfg.subnet.clone();
        }
        if cfg.server_ip.is_some() {
            self.server_ip = cfg.server_ip.clone();
        }
        if cfg.listen_address.is_some() {
            self.listen_address = cfg.listen_address.clone();
        }
        if cfg.leases_file.is_some() {
            self.leases_file = cfg.leases_file.clone();
        }
        if cfg.lease_time_secs.is_some() {
            self.lease_time_secs = cfg.lease_time_secs;
        }
        if cfg.sync_interval_secs.is_some() {
            self.sync_interval_secs = cfg.sync_interval_secs;
        }
        if cfg.unmanaged_peers.is_some() {
            self.unmanaged_peers = cfg.unmanaged_peers.clone();
        }
        if !cfg.auth_tokens.is_empty() {
            self.auth_tokens = cfg.auth_tokens.clone();
        }
        if cfg.auth_tokens_file.is_some() {
            self.auth_tokens_file = cfg.auth_tokens_file.clone();
        }
        if cfg.peers_file.is_some() {
            self.peers_file = cfg.peers_file.clone();
        }
        if !cfg.peers.is_empty() {
            self.peers = cfg.peers.clone();
        }
        if cfg.server_peer.is_some() {
            self.server_peer = cfg.server_peer.clone();
        }
        self
    }

    /// Replace the `[server_peer]` table, e.g. from a separate file.
    pub fn apply_server_peer(mut self, server_peer: Option<ServerPeerConfig>) -> Self {
        if server_peer.is_some() {
            self.server_peer = server_peer;
        }
        self
    }

    /// Apply CLI arguments and environment (highest priority).
    /// Only non-None/non-empty values override.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_cli(
        mut self,
        device: Option<String>,
        subnet: Option<String>,
        server_ip: Option<String>,
        listen_address: Option<String>,
        leases_file: Option<PathBuf>,
        lease_time_secs: Option<u64>,
        sync_interval_secs: Option<u64>,
        unmanaged_peers: Option<String>,
        auth_tokens: Vec<String>,
        auth_tokens_file: Option<PathBuf>,
    ) -> Self {
        if device.is_some() {
            self.device = device;
        }
        if subnet.is_some() {
            self.subnet = subnet;
        }
        if server_ip.is_some() {
            self.server_ip = server_ip;
        }
        if listen_address.is_some() {
            self.listen_address = listen_address;
        }
        if leases_file.is_some() {
            self.leases_file = leases_file;
        }
        if lease_time_secs.is_some() {
            self.lease_time_secs = lease_time_secs;
        }
        if sync_interval_secs.is_some() {
            self.sync_interval_secs = sync_interval_secs;
        }
        if unmanaged_peers.is_some() {
            self.unmanaged_peers = unmanaged_peers;
        }
        if !auth_tokens.is_empty() {
            self.auth_tokens = auth_tokens;
        }
        if auth_tokens_file.is_some() {
            self.auth_tokens_file = auth_tokens_file;
        }
        self
    }

    /// Build the final resolved configuration.
    pub fn build(self) -> Result<ResolvedServerConfig> {
        let subnet = self.subnet.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "Subnet is required.\n\
                 Specify via CLI: --subnet <CIDR> (or WGS_USER_PEER_SUBNET)\n\
                 Or in config: subnet = \"10.90.0.0/24\""
            )
        })?;
        let subnet = parse_subnet(subnet)?;
        let server_ip = self
            .server_ip
            .as_deref()
            .map(|ip| parse_server_ip(ip, &subnet))
            .transpose()?;

        let listen_address = self
            .listen_address
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDRESS);
        let listen_address: SocketAddr = listen_address
            .parse()
            .with_context(|| format!("Invalid listen_address '{}'", listen_address))?;

        let lease_time = positive_secs(
            self.lease_time_secs.unwrap_or(DEFAULT_LEASE_TIME_SECS),
            "lease_time_secs",
        )?;
        if lease_time.as_secs() > MAX_LEASE_TIME_SECS {
            anyhow::bail!(
                "lease_time_secs {} exceeds the maximum of {} (one year)",
                lease_time.as_secs(),
                MAX_LEASE_TIME_SECS
            );
        }
        let sync_interval = positive_secs(
            self.sync_interval_secs.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            "sync_interval_secs",
        )?;

        let unmanaged_peers = self
            .unmanaged_peers
            .unwrap_or_else(|| DEFAULT_UNMANAGED_PEERS.to_string())
            .to_ascii_lowercase();
        if unmanaged_peers != "remove" && unmanaged_peers != "preserve" {
            anyhow::bail!(
                "Invalid unmanaged_peers '{}'. Must be 'remove' or 'preserve'",
                unmanaged_peers
            );
        }

        if !self.auth_tokens.is_empty() && self.auth_tokens_file.is_some() {
            anyhow::bail!(
                "Cannot specify both auth_tokens and auth_tokens_file.\n\
                 Use --auth-tokens <TOKEN> or --auth-tokens-file <FILE>, not both."
            );
        }
        if self.auth_tokens.is_empty() && self.auth_tokens_file.is_none() {
            anyhow::bail!(
                "At least one auth token is required.\n\
                 Specify via CLI: --auth-tokens <TOKEN> or --auth-tokens-file <FILE>\n\
                 Or in config: auth_tokens_file = \"/etc/wiresteward/tokens\""
            );
        }

        if !self.peers.is_empty() && self.peers_file.is_some() {
            anyhow::bail!("Use only one of [[peers]] or peers_file");
        }
        let mut peers = Vec::with_capacity(self.peers.len());
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.public_key.trim().is_empty() {
                anyhow::bail!("peers[{}] is missing public_key", i);
            }
            let allowed_ips = peer
                .allowed_ips
                .iter()
                .map(|ip| parse_cidr(ip, &format!("peers[{}].allowed_ips", i)))
                .collect::<Result<Vec<_>>>()?;
            peers.push(ResolvedPeer {
                public_key: peer.public_key.trim().to_string(),
                allowed_ips,
            });
        }

        let server_peer = self.server_peer.ok_or_else(|| {
            anyhow::anyhow!(
                "[server_peer] is required.\n\
                 Set it in the config file or point WGS_SERVER_PEER_CONFIG_PATH at a file holding it."
            )
        })?;
        let endpoint = server_peer
            .endpoint
            .ok_or_else(|| anyhow::anyhow!("server_peer.endpoint is required"))?;
        validate_host_port(&endpoint, "server_peer.endpoint")?;
        if server_peer.allowed_ips.is_empty() {
            anyhow::bail!("server_peer.allowed_ips must list at least one range");
        }
        let allowed_ips = server_peer
            .allowed_ips
            .iter()
            .map(|ip| parse_cidr(ip, "server_peer.allowed_ips"))
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedServerConfig {
            device: self.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            subnet,
            server_ip,
            listen_address,
            leases_file: expand_tilde(
                &self
                    .leases_file
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LEASES_FILE)),
            ),
            lease_time,
            sync_interval,
            unmanaged_peers,
            auth_tokens: self.auth_tokens,
            auth_tokens_file: self.auth_tokens_file.map(|p| expand_tilde(&p)),
            peers_file: self.peers_file.map(|p| expand_tilde(&p)),
            peers,
            server_peer: ResolvedServerPeer {
                public_key: server_peer.public_key,
                endpoint,
                allowed_ips,
                persistent_keepalive: server_peer.persistent_keepalive,
            },
        })
    }
}

// ============================================================================
// Agent
// ============================================================================

/// An agent device and its peer-server URLs, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAgentDevice {
    pub name: String,
    pub peer_urls: Vec<String>,
}

/// Resolved agent configuration (all values finalized).
#[derive(Debug, Clone)]
pub struct ResolvedAgentConfig {
    pub auth_token: Option<String>,
    pub auth_token_file: Option<PathBuf>,
    pub request_timeout: Duration,
    pub retry_interval: Duration,
    pub devices: Vec<ResolvedAgentDevice>,
}

/// Builder for agent configuration with layered overrides.
#[derive(Default)]
pub struct AgentConfigBuilder {
    auth_token: Option<String>,
    auth_token_file: Option<PathBuf>,
    request_timeout_secs: Option<u64>,
    retry_interval_secs: Option<u64>,
    devices: Vec<AgentDeviceConfig>,
}

impl AgentConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply default values (lowest priority).
    pub fn apply_defaults(mut self) -> Self {
        self.request_timeout_secs = Some(DEFAULT_REQUEST_TIMEOUT_SECS);
        self.retry_interval_secs = Some(DEFAULT_RETRY_INTERVAL_SECS);
        self
    }

    /// Apply values from the TOML file (middle priority).
    pub fn apply_config(mut self, cfg: &AgentFileConfig) -> Self {
        if cfg.auth_token.is_some() {
            self.auth_token = cfg.auth_token.clone();
        }
        if cfg.auth_token_file.is_some() {
            self.auth_token_file = cfg.auth_token_file.clone();
        }
        if cfg.request_timeout_secs.is_some() {
            self.request_timeout_secs = cfg.request_timeout_secs;
        }
        if cfg.retry_interval_secs.is_some() {
            self.retry_interval_secs = cfg.retry_interval_secs;
        }
        if !cfg.devices.is_empty() {
            self.devices = cfg.devices.clone();
        }
        self
    }

    /// Apply CLI arguments (highest priority).
    pub fn apply_cli(
        mut self,
        auth_token: Option<String>,
        auth_token_file: Option<PathBuf>,
        request_timeout_secs: Option<u64>,
        retry_interval_secs: Option<u64>,
    ) -> Self {
        if auth_token.is_some() {
            self.auth_token = auth_token;
        }
        if auth_token_file.is_some() {
            self.auth_token_file = auth_token_file;
        }
        if request_timeout_secs.is_some() {
            self.request_timeout_secs = request_timeout_secs;
        }
        if retry_interval_secs.is_some() {
            self.retry_interval_secs = retry_interval_secs;
        }
        self
    }

    /// Build the final resolved configuration.
    pub fn build(self) -> Result<ResolvedAgentConfig> {
        match (&self.auth_token, &self.auth_token_file) {
            (Some(_), Some(_)) => anyhow::bail!(
                "Cannot specify both auth_token and auth_token_file.\n\
                 Use --auth-token <TOKEN> or --auth-token-file <FILE>, not both."
            ),
            (None, None) => anyhow::bail!(
                "An auth token is required.\n\
                 Specify via CLI: --auth-token <TOKEN> or --auth-token-file <FILE>"
            ),
            (Some(token), None) if token.trim().is_empty() => {
                anyhow::bail!("auth_token must not be empty")
            }
            _ => {}
        }

        let request_timeout = positive_secs(
            self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            "request_timeout_secs",
        )?;
        let retry_interval = positive_secs(
            self.retry_interval_secs.unwrap_or(DEFAULT_RETRY_INTERVAL_SECS),
            "retry_interval_secs",
        )?;

        if self.devices.is_empty() {
            anyhow::bail!("At least one [[devices]] entry is required");
        }
        let mut devices = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            if device.name.trim().is_empty() {
                anyhow::bail!("Device name must not be empty");
            }
            if device.peers.is_empty() {
                anyhow::bail!("Device '{}' has no [[devices.peers]] entry", device.name);
            }
            for peer in &device.peers {
                validate_http_url(&peer.url, &format!("peer url of device '{}'", device.name))?;
            }
            devices.push(ResolvedAgentDevice {
                name: device.name.trim().to_string(),
                peer_urls: device.peers.iter().map(|p| p.url.clone()).collect(),
            });
        }

        Ok(ResolvedAgentConfig {
            auth_token: self.auth_token.map(|t| t.trim().to_string()),
            auth_token_file: self.auth_token_file.map(|p| expand_tilde(&p)),
            request_timeout,
            retry_interval,
            devices,
        })
    }
}
