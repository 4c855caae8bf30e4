//! Lease manager: allocation, renewal and device reconciliation.
//!
//! The manager owns the lease store behind one mutex, and every allocation
//! decision is taken while holding it, so two requests can never pick the
//! same address. Reconciliation passes are serialized by a second guard; a
//! pass requested while another runs is folded into the running one instead
//! of starting concurrently.

use crate::allocator::{ManagedSubnet, NoAddressAvailable};
use crate::clock::Clock;
use crate::error::{LeaseError, LeaseResult};
use crate::keys::WgPublicKey;
use crate::peers::{PeerSource, StaticPeer};
use crate::store::{Lease, LeaseStore, LeaseTable};
use crate::wg::{DevicePeer, PeerUpdate, WgControl};
use ipnet::{IpNet, Ipv4Net};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tokio::sync::watch;

/// Longest lease lifetime a manager accepts.
pub const MAX_LEASE_TIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What to do with device peers that neither a lease nor a peer source accounts for.
///
/// Peers routed into the managed subnet are always removed once their lease is
/// gone; the policy only covers peers that never held a lease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnmanagedPeerPolicy {
    /// Remove them on every pass.
    #[default]
    Remove,
    /// Leave them alone.
    Preserve,
}

impl FromStr for UnmanagedPeerPolicy {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "remove" => Ok(Self::Remove),
            "preserve" => Ok(Self::Preserve),
            other => Err(LeaseError::Config(format!(
                "Invalid unmanaged peer policy '{}': expected 'remove' or 'preserve'",
                other
            ))),
        }
    }
}

/// Lease manager configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// WireGuard device whose peers are reconciled.
    pub device: String,
    pub subnet: ManagedSubnet,
    pub lease_time: Duration,
    pub unmanaged_peers: UnmanagedPeerPolicy,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub purged: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Peer updates that could not be applied.
    pub failed: usize,
    /// The request was folded into a pass already running on another thread.
    pub deferred: bool,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.purged + self.added + self.updated + self.removed + self.failed > 0
    }
}

/// Peer updates needed to turn the live peer list into the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDiff {
    pub added: Vec<PeerUpdate>,
    pub updated: Vec<PeerUpdate>,
    pub removed: Vec<PeerUpdate>,
}

impl PeerDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// All updates as one batch: additions, then updates, then removals.
    pub fn updates(&self) -> Vec<PeerUpdate> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .cloned()
            .collect()
    }
}

/// Desired peer set: each lease's `/32`, unioned with static ranges for the
/// same key, plus static peers that hold no lease.
pub fn desired_peers(
    leases: &LeaseTable,
    statics: &[StaticPeer],
) -> BTreeMap<WgPublicKey, BTreeSet<IpNet>> {
    let mut desired: BTreeMap<WgPublicKey, BTreeSet<IpNet>> = BTreeMap::new();

    for lease in leases.values() {
        desired
            .entry(lease.public_key)
            .or_default()
            .insert(IpNet::V4(host_net(lease.ip_address)));
    }
    for peer in statics {
        desired
            .entry(peer.public_key)
            .or_default()
            .extend(peer.allowed_ips.iter().map(|net| net.trunc()));
    }

    desired
}

/// Compare desired against live peers.
///
/// A live peer missing from `desired` is removed under `Remove`, and under
/// `Preserve` only when one of its allowed IPs lies inside `managed`: such a
/// peer can only come from a lease that was revoked or expired.
pub fn diff_peers(
    desired: &BTreeMap<WgPublicKey, BTreeSet<IpNet>>,
    live: &[DevicePeer],
    policy: UnmanagedPeerPolicy,
    managed: Ipv4Net,
) -> PeerDiff {
    let live: BTreeMap<WgPublicKey, &DevicePeer> =
        live.iter().map(|peer| (peer.public_key, peer)).collect();
    let mut diff = PeerDiff::default();

    for (key, allowed_ips) in desired {
        match live.get(key) {
            None => diff.added.push(PeerUpdate::upsert(*key, allowed_ips.clone())),
            Some(peer) if &peer.allowed_ips != allowed_ips => {
                diff.updated.push(PeerUpdate::upsert(*key, allowed_ips.clone()))
            }
            Some(_) => {}
        }
    }

    diff.removed = live
        .values()
        .filter(|peer| !desired.contains_key(&peer.public_key))
        .filter(|peer| match policy {
            UnmanagedPeerPolicy::Remove => true,
            UnmanagedPeerPolicy::Preserve => holds_managed_address(peer, managed),
        })
        .map(|peer| PeerUpdate::remove(peer.public_key))
        .collect();

    diff
}

/// Remove expired leases from `table`, returning them.
fn purge_expired(table: &mut LeaseTable, now: chrono::DateTime<chrono::Utc>) -> Vec<Lease> {
    let expired: Vec<WgPublicKey> = table
        .values()
        .filter(|lease| lease.is_expired(now))
        .map(|lease| lease.public_key)
        .collect();
    expired
        .iter()
        .filter_map(|key| table.remove(key))
        .collect()
}

fn holds_managed_address(peer: &DevicePeer, managed: Ipv4Net) -> bool {
    peer.allowed_ips.iter().any(|net| match net {
        IpNet::V4(net) => managed.contains(net),
        IpNet::V6(_) => false,
    })
}

fn host_net(ip: Ipv4Addr) -> Ipv4Net {
    // A /32 is always a valid prefix length.
    Ipv4Net::from(ip)
}

/// Allocates, renews and reconciles leases.
pub struct LeaseManager {
    config: LeaseConfig,
    lease_time: chrono::Duration,
    store: Mutex<LeaseStore>,
    wg: Arc<dyn WgControl>,
    peers: Arc<dyn PeerSource>,
    clock: Arc<dyn Clock>,
    sync_guard: Mutex<()>,
    sync_requested: AtomicBool,
}

impl LeaseManager {
    /// Create a manager over an opened store.
    ///
    /// Every stored lease must sit on an eligible address of the subnet;
    /// anything else means the lease file belongs to a different setup.
    pub fn new(
        config: LeaseConfig,
        store: LeaseStore,
        wg: Arc<dyn WgControl>,
        peers: Arc<dyn PeerSource>,
        clock: Arc<dyn Clock>,
    ) -> LeaseResult<Self> {
        if config.lease_time.is_zero() {
            return Err(LeaseError::Config("Lease time must be greater than zero".into()));
        }
        if config.lease_time > MAX_LEASE_TIME {
            return Err(LeaseError::Config(format!(
                "Lease time {:?} exceeds the maximum of {:?}",
                config.lease_time, MAX_LEASE_TIME
            )));
        }
        let lease_time = chrono::Duration::from_std(config.lease_time)
            .map_err(|e| LeaseError::Config(format!("Lease time out of range: {}", e)))?;

        for lease in store.table().values() {
            let ip = lease.ip_address;
            if !config.subnet.network().contains(&ip) || config.subnet.reserved().contains(&ip) {
                return Err(LeaseError::Config(format!(
                    "Stored lease {} for {} is not leasable in subnet {}",
                    ip,
                    lease.public_key,
                    config.subnet.network()
                )));
            }
        }

        Ok(Self {
            config,
            lease_time,
            store: Mutex::new(store),
            wg,
            peers,
            clock,
            sync_guard: Mutex::new(()),
            sync_requested: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn lock_store(&self) -> MutexGuard<'_, LeaseStore> {
        // The store swaps its table only after a successful write, so a
        // poisoned guard still holds a consistent table.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a lease for `public_key`, or extend its active one.
    ///
    /// Renewal keeps the address. A key whose lease expired but was not yet
    /// purged gets a fresh allocation. On exhaustion, expired leases are
    /// reclaimed and allocation is retried once.
    pub fn create_or_renew_lease(&self, public_key: WgPublicKey) -> LeaseResult<Lease> {
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(self.lease_time).ok_or_else(|| {
            LeaseError::Config(format!("Lease expiry overflows the calendar at {}", now))
        })?;
        let mut store = self.lock_store();

        if let Ok(existing) = store.get(&public_key) {
            if !existing.is_expired(now) {
                let renewed = Lease {
                    expires_at: expires_at.max(existing.expires_at),
                    ..existing.clone()
                };
                store.put(renewed.clone())?;
                log::debug!(
                    "Renewed lease {} for {} until {}",
                    renewed.ip_address,
                    public_key.short(),
                    renewed.expires_at
                );
                return Ok(renewed);
            }
        }

        let mut table = store.table().clone();
        if let Some(stale) = table.remove(&public_key) {
            log::debug!(
                "Dropping expired lease {} for {}",
                stale.ip_address,
                public_key.short()
            );
        }

        let ip_address = match self.allocate(&table) {
            Ok(ip) => ip,
            Err(NoAddressAvailable) => {
                let purged = purge_expired(&mut table, now);
                if !purged.is_empty() {
                    log::info!(
                        "Subnet {} exhausted, reclaimed {} expired lease(s)",
                        self.config.subnet.network(),
                        purged.len()
                    );
                }
                self.allocate(&table).map_err(|_| {
                    LeaseError::AllocationFailed(format!(
                        "Subnet {} exhausted ({} active leases)",
                        self.config.subnet.network(),
                        table.len()
                    ))
                })?
            }
        };

        let lease = Lease {
            public_key,
            ip_address,
            expires_at,
        };
        table.insert(public_key, lease.clone());
        store.save(table)?;

        log::info!(
            "Leased {} to {} until {}",
            ip_address,
            public_key.short(),
            expires_at
        );
        Ok(lease)
    }

    fn allocate(&self, table: &LeaseTable) -> Result<Ipv4Addr, NoAddressAvailable> {
        let allocated: HashSet<Ipv4Addr> = table.values().map(|lease| lease.ip_address).collect();
        self.config.subnet.next_available(&allocated)
    }

    /// Remove a lease and reconcile. Returns true if a lease existed.
    pub fn revoke(&self, public_key: &WgPublicKey) -> LeaseResult<bool> {
        let removed = self.lock_store().delete(public_key)?;
        if removed {
            log::info!("Revoked lease for {}", public_key.short());
            if let Err(e) = self.sync_wg_records() {
                log::warn!("Reconciliation after revoking {} failed: {}", public_key.short(), e);
            }
        }
        Ok(removed)
    }

    /// Lease for a key, if one is recorded.
    pub fn get(&self, public_key: &WgPublicKey) -> LeaseResult<Lease> {
        self.lock_store().get(public_key).cloned()
    }

    /// Snapshot of all recorded leases, expired ones included until purged.
    pub fn leases(&self) -> Vec<Lease> {
        self.lock_store().table().values().cloned().collect()
    }

    /// Run a reconciliation pass.
    ///
    /// If a pass is already running, this request is recorded and the running
    /// pass performs one more round before it returns; the report then has
    /// `deferred` set.
    pub fn sync_wg_records(&self) -> LeaseResult<SyncReport> {
        self.sync_requested.store(true, Ordering::Release);

        loop {
            let guard = match self.sync_guard.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    log::debug!("Reconciliation already running, request folded into it");
                    return Ok(SyncReport {
                        deferred: true,
                        ..SyncReport::default()
                    });
                }
            };

            // A failed pass does not end the loop: requests folded in while it
            // ran still get their own pass.
            let mut result = Ok(SyncReport::default());
            while self.sync_requested.swap(false, Ordering::AcqRel) {
                result = self.sync_pass();
                if let Err(e) = &result {
                    log::debug!("Reconciliation pass failed: {}", e);
                }
            }
            drop(guard);

            // A request may have arrived between the last swap and the unlock.
            if !self.sync_requested.load(Ordering::Acquire) {
                return result;
            }
        }
    }

    fn sync_pass(&self) -> LeaseResult<SyncReport> {
        let device_name = &self.config.device;
        let device = self.wg.get_device(device_name).map_err(|e| {
            LeaseError::ReconciliationFailed(format!("Cannot read device {}: {}", device_name, e))
        })?;
        let statics = self
            .peers
            .peers()
            .map_err(|e| LeaseError::ReconciliationFailed(format!("Peer source failed: {}", e)))?;

        let (leases, purged) = {
            let mut store = self.lock_store();
            let mut table = store.table().clone();
            let purged = purge_expired(&mut table, self.clock.now());
            if !purged.is_empty() {
                store.save(table)?;
                for lease in &purged {
                    log::info!(
                        "Purged expired lease {} for {}",
                        lease.ip_address,
                        lease.public_key.short()
                    );
                }
            }
            (store.table().clone(), purged.len())
        };

        let desired = desired_peers(&leases, &statics);
        let diff = diff_peers(
            &desired,
            &device.peers,
            self.config.unmanaged_peers,
            self.config.subnet.network(),
        );

        let mut report = SyncReport {
            purged,
            ..SyncReport::default()
        };
        if !diff.is_empty() {
            self.apply(&diff, &mut report)?;
        }

        if report.changed() {
            log::info!(
                "Reconciled {}: {} added, {} updated, {} removed, {} failed, {} purged",
                device_name,
                report.added,
                report.updated,
                report.removed,
                report.failed,
                report.purged
            );
        } else {
            log::debug!("Reconciled {}: {} peer(s) in sync", device_name, desired.len());
        }
        Ok(report)
    }

    /// Apply a diff as one batch, falling back to one update at a time.
    fn apply(&self, diff: &PeerDiff, report: &mut SyncReport) -> LeaseResult<()> {
        let device_name = &self.config.device;
        let batch_err = match self.wg.set_device(device_name, &diff.updates()) {
            Ok(()) => {
                report.added += diff.added.len();
                report.updated += diff.updated.len();
                report.removed += diff.removed.len();
                return Ok(());
            }
            Err(e) => e,
        };

        log::warn!(
            "Batch update of {} failed ({}), applying {} peer update(s) individually",
            device_name,
            batch_err,
            diff.len()
        );

        let groups = [
            (&diff.added, &mut report.added),
            (&diff.updated, &mut report.updated),
            (&diff.removed, &mut report.removed),
        ];
        let mut failed = 0;
        for (updates, applied) in groups {
            for update in updates {
                match self.wg.set_device(device_name, std::slice::from_ref(update)) {
                    Ok(()) => *applied += 1,
                    Err(e) => {
                        failed += 1;
                        log::warn!("Failed to apply peer {}: {}", update.public_key.short(), e);
                    }
                }
            }
        }
        report.failed += failed;

        if failed == diff.len() {
            return Err(LeaseError::ReconciliationFailed(format!(
                "No peer update could be applied to {}: {}",
                device_name, batch_err
            )));
        }
        Ok(())
    }
}

/// Run a reconciliation pass on the blocking pool and log the outcome.
pub async fn sync_now(manager: Arc<LeaseManager>) -> LeaseResult<SyncReport> {
    tokio::task::spawn_blocking(move || manager.sync_wg_records())
        .await
        .map_err(|e| LeaseError::ReconciliationFailed(format!("Reconciliation task failed: {}", e)))?
}

/// Trigger a reconciliation pass without waiting for it.
pub fn request_sync(manager: &Arc<LeaseManager>) {
    let manager = Arc::clone(manager);
    tokio::spawn(async move {
        if let Err(e) = sync_now(manager).await {
            log::warn!("Reconciliation failed: {}", e);
        }
    });
}

/// Reconcile every `interval` until `shutdown` flips to true.
///
/// Shutdown is checked between ticks; a pass in progress finishes first.
pub async fn run_sync_loop(
    manager: Arc<LeaseManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    log::info!("Reconciliation loop started (every {:?})", interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sync_now(Arc::clone(&manager)).await {
                    log::warn!("Reconciliation failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::info!("Reconciliation loop stopped");
}
