//! Statically known peers.
//!
//! Besides leased peers, the server can carry peers described outside the
//! lease table: entries from its own configuration, or a peers file dropped
//! in place by an external directory sync. The lease manager only sees the
//! [`PeerSource`] trait and treats every implementation the same way.

use crate::error::{LeaseError, LeaseResult};
use crate::keys::WgPublicKey;
use ipnet::IpNet;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A peer with fixed allowed IPs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticPeer {
    pub public_key: WgPublicKey,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
}

/// Enumerates statically known peers for a reconciliation pass.
pub trait PeerSource: Send + Sync {
    fn peers(&self) -> LeaseResult<Vec<StaticPeer>>;
}

/// Peers fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerSource {
    peers: Vec<StaticPeer>,
}

impl StaticPeerSource {
    pub fn new(peers: Vec<StaticPeer>) -> Self {
        Self { peers }
    }

    /// A source with no peers.
    pub fn empty() -> Self {
        Self::default()
    }
}

impl PeerSource for StaticPeerSource {
    fn peers(&self) -> LeaseResult<Vec<StaticPeer>> {
        Ok(self.peers.clone())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PeersFile {
    #[serde(default)]
    peers: Vec<StaticPeer>,
}

/// Peers read from a TOML file on every pass.
///
/// ```toml
/// [[peers]]
/// public_key = "NkEtSA6GosX40iZFNe9+byAkXweYKvQe3utnFYkQ+00="
/// allowed_ips = ["10.90.0.200/32", "192.168.50.0/24"]
/// ```
///
/// A missing file yields no peers.
#[derive(Debug, Clone)]
pub struct FilePeerSource {
    path: PathBuf,
}

impl FilePeerSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PeerSource for FilePeerSource {
    fn peers(&self) -> LeaseResult<Vec<StaticPeer>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("Peers file {} not present", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(LeaseError::Storage(e)),
        };

        let file: PeersFile = toml::from_str(&content).map_err(|e| {
            LeaseError::Config(format!("Invalid peers file {}: {}", self.path.display(), e))
        })?;
        Ok(file.peers)
    }
}
