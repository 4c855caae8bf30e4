//! WireGuard control interface.
//!
//! The lease engine never talks to the kernel directly. It reads and applies
//! a device's peer list through [`WgControl`], which is implemented by
//! [`MemoryWg`] (in-process, for tests and dry runs) and, on Linux, by
//! [`KernelWg`].

use crate::error::{LeaseError, LeaseResult};
use crate::keys::WgPublicKey;
use ipnet::{IpNet, Ipv4Net};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;

/// A peer as currently configured on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    pub public_key: WgPublicKey,
    pub allowed_ips: BTreeSet<IpNet>,
    pub endpoint: Option<SocketAddr>,
}

/// Snapshot of a WireGuard device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub public_key: Option<WgPublicKey>,
    pub listen_port: Option<u16>,
    pub peers: Vec<DevicePeer>,
}

/// One entry of a `set_device` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: WgPublicKey,
    /// Replaces the peer's allowed IPs entirely.
    pub allowed_ips: BTreeSet<IpNet>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    /// Remove the peer instead of adding or updating it.
    pub remove: bool,
}

impl PeerUpdate {
    /// Add the peer, or replace its allowed IPs if it exists.
    pub fn upsert(public_key: WgPublicKey, allowed_ips: BTreeSet<IpNet>) -> Self {
        Self {
            public_key,
            allowed_ips,
            endpoint: None,
            persistent_keepalive: None,
            remove: false,
        }
    }

    /// Remove the peer.
    pub fn remove(public_key: WgPublicKey) -> Self {
        Self {
            public_key,
            allowed_ips: BTreeSet::new(),
            endpoint: None,
            persistent_keepalive: None,
            remove: true,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<SocketAddr>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_keepalive(mut self, secs: Option<u16>) -> Self {
        self.persistent_keepalive = secs;
        self
    }
}

/// Read/apply access to WireGuard devices on this host.
///
/// Calls block while the kernel is consulted; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait WgControl: Send + Sync {
    /// Read a device and its peer list.
    fn get_device(&self, name: &str) -> LeaseResult<Device>;

    /// Apply a batch of peer updates in one call.
    fn set_device(&self, name: &str, updates: &[PeerUpdate]) -> LeaseResult<()>;

    /// Swap an interface address: remove `old` (if any) and add `new`.
    fn replace_address(&self, name: &str, old: Option<Ipv4Net>, new: Ipv4Net) -> LeaseResult<()>;

    /// Remove every IPv4 address from an interface.
    fn flush_addresses(&self, name: &str) -> LeaseResult<()>;
}

#[derive(Debug, Default)]
struct MemoryDevice {
    public_key: Option<WgPublicKey>,
    listen_port: Option<u16>,
    peers: BTreeMap<WgPublicKey, DevicePeer>,
    addresses: BTreeSet<Ipv4Net>,
}

/// In-process WireGuard devices.
#[derive(Debug, Default)]
pub struct MemoryWg {
    devices: Mutex<HashMap<String, MemoryDevice>>,
    /// Peer keys whose updates fail, for exercising partial application.
    failing: Mutex<BTreeSet<WgPublicKey>>,
}

impl MemoryWg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device with the given identity.
    pub fn add_device(&self, name: &str, public_key: Option<WgPublicKey>, listen_port: Option<u16>) {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let device = devices.entry(name.to_string()).or_default();
        device.public_key = public_key;
        device.listen_port = listen_port;
    }

    /// Make every future update touching `public_key` fail.
    pub fn fail_peer(&self, public_key: WgPublicKey) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(public_key);
    }

    /// Current interface addresses of a device.
    pub fn addresses(&self, name: &str) -> Vec<Ipv4Net> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices
            .get(name)
            .map(|d| d.addresses.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Peer keys and allowed IPs of a device, for assertions.
    pub fn peer_map(&self, name: &str) -> BTreeMap<WgPublicKey, BTreeSet<IpNet>> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices
            .get(name)
            .map(|d| {
                d.peers
                    .iter()
                    .map(|(k, p)| (*k, p.allowed_ips.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl WgControl for MemoryWg {
    fn get_device(&self, name: &str) -> LeaseResult<Device> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let device = devices
            .get(name)
            .ok_or_else(|| LeaseError::WireGuard(format!("No such device: {}", name)))?;
        Ok(Device {
            name: name.to_string(),
            public_key: device.public_key,
            listen_port: device.listen_port,
            peers: device.peers.values().cloned().collect(),
        })
    }

    fn set_device(&self, name: &str, updates: &[PeerUpdate]) -> LeaseResult<()> {
        let failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(update) = updates.iter().find(|u| failing.contains(&u.public_key)) {
            return Err(LeaseError::WireGuard(format!(
                "Peer {} rejected by device {}",
                update.public_key.short(),
                name
            )));
        }
        drop(failing);

        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let device = devices
            .get_mut(name)
            .ok_or_else(|| LeaseError::WireGuard(format!("No such device: {}", name)))?;

        for update in updates {
            if update.remove {
                device.peers.remove(&update.public_key);
            } else {
                device.peers.insert(
                    update.public_key,
                    DevicePeer {
                        public_key: update.public_key,
                        allowed_ips: update.allowed_ips.clone(),
                        endpoint: update.endpoint,
                    },
                );
            }
        }
        Ok(())
    }

    fn replace_address(&self, name: &str, old: Option<Ipv4Net>, new: Ipv4Net) -> LeaseResult<()> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let device = devices
            .get_mut(name)
            .ok_or_else(|| LeaseError::WireGuard(format!("No such device: {}", name)))?;
        if let Some(old) = old {
            device.addresses.remove(&old);
        }
        device.addresses.insert(new);
        Ok(())
    }

    fn flush_addresses(&self, name: &str) -> LeaseResult<()> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let device = devices
            .get_mut(name)
            .ok_or_else(|| LeaseError::WireGuard(format!("No such device: {}", name)))?;
        device.addresses.clear();
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use kernel::KernelWg;

#[cfg(target_os = "linux")]
mod kernel {
    use super::*;
    use std::process::{Command, Output};
    use wireguard_control::{Backend, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

    /// Kernel WireGuard devices via netlink, interface addresses via iproute2.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct KernelWg;

    impl KernelWg {
        pub fn new() -> Self {
            Self
        }
    }

    fn iface(name: &str) -> LeaseResult<InterfaceName> {
        name.parse::<InterfaceName>()
            .map_err(|e| LeaseError::WireGuard(format!("Invalid interface name {}: {}", name, e)))
    }

    fn to_key(key: &WgPublicKey) -> LeaseResult<Key> {
        Key::from_base64(&key.to_base64())
            .map_err(|e| LeaseError::Key(format!("Invalid WireGuard key: {:?}", e)))
    }

    fn from_key(key: &Key) -> LeaseResult<WgPublicKey> {
        WgPublicKey::from_base64(&key.to_base64())
    }

    /// Check if an error message indicates that a resource already exists.
    fn is_already_exists_error(stderr: &str) -> bool {
        let lower = stderr.to_lowercase();
        lower.contains("file exists") || lower.contains("eexist")
    }

    /// Check if an error message indicates that an address was already gone.
    fn is_not_found_error(stderr: &str) -> bool {
        let lower = stderr.to_lowercase();
        lower.contains("cannot assign requested address") || lower.contains("eaddrnotavail")
    }

    fn run_ip(args: &[&str]) -> LeaseResult<Output> {
        Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| LeaseError::WireGuard(format!("Failed to execute ip command: {}", e)))
    }

    impl WgControl for KernelWg {
        fn get_device(&self, name: &str) -> LeaseResult<Device> {
            let device = wireguard_control::Device::get(&iface(name)?, Backend::Kernel)
                .map_err(|e| LeaseError::WireGuard(format!("Cannot read device {}: {}", name, e)))?;

            let mut peers = Vec::with_capacity(device.peers.len());
            for peer in &device.peers {
                let allowed_ips = peer
                    .config
                    .allowed_ips
                    .iter()
                    .filter_map(|ip| IpNet::new(ip.address, ip.cidr).ok())
                    .collect();
                peers.push(DevicePeer {
                    public_key: from_key(&peer.config.public_key)?,
                    allowed_ips,
                    endpoint: peer.config.endpoint,
                });
            }

            Ok(Device {
                name: name.to_string(),
                public_key: device.public_key.as_ref().map(from_key).transpose()?,
                listen_port: device.listen_port,
                peers,
            })
        }

        fn set_device(&self, name: &str, updates: &[PeerUpdate]) -> LeaseResult<()> {
            let mut batch = DeviceUpdate::new();
            for update in updates {
                let key = to_key(&update.public_key)?;
                if update.remove {
                    batch = batch.remove_peer_by_key(&key);
                    continue;
                }
                let mut peer = PeerConfigBuilder::new(&key).replace_allowed_ips();
                for net in &update.allowed_ips {
                    peer = peer.add_allowed_ip(net.addr(), net.prefix_len());
                }
                if let Some(endpoint) = update.endpoint {
                    peer = peer.set_endpoint(endpoint);
                }
                if let Some(secs) = update.persistent_keepalive {
                    peer = peer.set_persistent_keepalive_interval(secs);
                }
                batch = batch.add_peer(peer);
            }
            batch
                .apply(&iface(name)?, Backend::Kernel)
                .map_err(|e| LeaseError::WireGuard(format!("Cannot configure device {}: {}", name, e)))
        }

        fn replace_address(&self, name: &str, old: Option<Ipv4Net>, new: Ipv4Net) -> LeaseResult<()> {
            if let Some(old) = old.filter(|old| *old != new) {
                let output = run_ip(&["-4", "addr", "del", &old.to_string(), "dev", name])?;
                if output.status.success() {
                    log::info!("Removed address {} from {}", old, name);
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if !is_not_found_error(&stderr) {
                        log::warn!("Failed to remove address {} from {}: {}", old, name, stderr.trim());
                    }
                }
            }

            let output = run_ip(&["-4", "addr", "add", &new.to_string(), "dev", name])?;
            if output.status.success() {
                log::info!("Added address {} to {}", new, name);
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_already_exists_error(&stderr) {
                log::debug!("Address {} already present on {}", new, name);
                Ok(())
            } else {
                Err(LeaseError::WireGuard(format!(
                    "Failed to add address {} to {}: {}",
                    new,
                    name,
                    stderr.trim()
                )))
            }
        }

        fn flush_addresses(&self, name: &str) -> LeaseResult<()> {
            let output = run_ip(&["-4", "addr", "flush", "dev", name])?;
            if output.status.success() {
                log::info!("Flushed addresses of {}", name);
                Ok(())
            } else {
                Err(LeaseError::WireGuard(format!(
                    "Failed to flush addresses of {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_error_classification() {
            assert!(is_already_exists_error("RTNETLINK answers: File exists"));
            assert!(!is_already_exists_error("RTNETLINK answers: Operation not permitted"));
            assert!(is_not_found_error("RTNETLINK answers: Cannot assign requested address"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> WgPublicKey {
        WgPublicKey([n; 32])
    }

    fn nets(list: &[&str]) -> BTreeSet<IpNet> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_memory_set_device_batch() {
        let wg = MemoryWg::new();
        wg.add_device("wg0", Some(key(1)), Some(51820));

        wg.set_device(
            "wg0",
            &[
                PeerUpdate::upsert(key(2), nets(&["10.0.0.2/32"])),
                PeerUpdate::upsert(key(3), nets(&["10.0.0.3/32"])),
            ],
        )
        .unwrap();
        wg.set_device("wg0", &[PeerUpdate::remove(key(2))]).unwrap();

        let device = wg.get_device("wg0").unwrap();
        assert_eq!(device.public_key, Some(key(1)));
        assert_eq!(device.peers.len(), 1);
        assert_eq!(device.peers[0].public_key, key(3));
    }

    #[test]
    fn test_memory_unknown_device() {
        let wg = MemoryWg::new();
        assert!(matches!(wg.get_device("wg9"), Err(LeaseError::WireGuard(_))));
    }

    #[test]
    fn test_memory_failing_peer_rejects_batch() {
        let wg = MemoryWg::new();
        wg.add_device("wg0", None, None);
        wg.fail_peer(key(4));
        let result = wg.set_device(
            "wg0",
            &[
                PeerUpdate::upsert(key(2), nets(&["10.0.0.2/32"])),
                PeerUpdate::upsert(key(4), nets(&["10.0.0.4/32"])),
            ],
        );
        assert!(result.is_err());
        assert!(wg.peer_map("wg0").is_empty());
    }

    #[test]
    fn test_memory_addresses() {
        let wg = MemoryWg::new();
        wg.add_device("wg0", None, None);
        let a: Ipv4Net = "10.0.0.2/32".parse().unwrap();
        let b: Ipv4Net = "10.0.0.7/32".parse().unwrap();
        wg.replace_address("wg0", None, a).unwrap();
        wg.replace_address("wg0", Some(a), b).unwrap();
        assert_eq!(wg.addresses("wg0"), vec![b]);
        wg.flush_addresses("wg0").unwrap();
        assert!(wg.addresses("wg0").is_empty());
    }
}
