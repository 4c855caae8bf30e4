//! Durable lease table.
//!
//! The table is a JSON document that is always replaced as a whole: the new
//! content goes to a temporary file in the same directory, is fsynced, and is
//! then renamed over the target. A reader therefore sees either the old file
//! or the new one. On load, anything that does not parse cleanly is treated as
//! corruption and refused.
//!
//! `LeaseStore` has no lock of its own. Its mutators take `&mut self`; the
//! lease manager owns the store behind its mutex, which is the single
//! exclusion scope for both the in-memory table and the file.

use crate::error::{LeaseError, LeaseResult};
use crate::keys::WgPublicKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Current lease file format version.
pub const LEASE_FILE_VERSION: u32 = 1;

/// One peer's address grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub public_key: WgPublicKey,
    pub ip_address: Ipv4Addr,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease is invalid from its expiry instant onwards.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// All current leases, keyed by public key.
pub type LeaseTable = BTreeMap<WgPublicKey, Lease>;

/// On-disk layout.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LeaseFile {
    version: u32,
    leases: Vec<Lease>,
}

/// Lease table with optional file persistence.
#[derive(Debug)]
pub struct LeaseStore {
    path: Option<PathBuf>,
    table: LeaseTable,
}

impl LeaseStore {
    /// Creates an in-memory store (no persistence).
    pub fn new_memory() -> Self {
        Self {
            path: None,
            table: LeaseTable::new(),
        }
    }

    /// Opens a store backed by `path`, loading whatever it already holds.
    pub fn open(path: impl Into<PathBuf>) -> LeaseResult<Self> {
        let path = path.into();
        let table = Self::load(&path)?;
        log::info!("Loaded {} lease(s) from {}", table.len(), path.display());
        Ok(Self {
            path: Some(path),
            table,
        })
    }

    /// Reads a lease table from disk.
    ///
    /// A missing or blank file is an empty table. Malformed content is
    /// [`LeaseError::StorageCorruption`].
    pub fn load(path: &Path) -> LeaseResult<LeaseTable> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LeaseTable::new()),
            Err(e) => return Err(LeaseError::Storage(e)),
        };

        if content.trim().is_empty() {
            return Ok(LeaseTable::new());
        }

        let file: LeaseFile = serde_json::from_str(&content).map_err(|e| {
            LeaseError::StorageCorruption(format!("{}: {}", path.display(), e))
        })?;

        if file.version != LEASE_FILE_VERSION {
            return Err(LeaseError::StorageCorruption(format!(
                "{}: unsupported lease file version {}",
                path.display(),
                file.version
            )));
        }

        let mut table = LeaseTable::new();
        let mut addresses = HashSet::new();
        for lease in file.leases {
            if !addresses.insert(lease.ip_address) {
                return Err(LeaseError::StorageCorruption(format!(
                    "{}: address {} leased twice",
                    path.display(),
                    lease.ip_address
                )));
            }
            let key = lease.public_key;
            if table.insert(key, lease).is_some() {
                return Err(LeaseError::StorageCorruption(format!(
                    "{}: duplicate lease for key {}",
                    path.display(),
                    key
                )));
            }
        }

        Ok(table)
    }

    /// Replaces the whole table, on disk first and then in memory.
    ///
    /// If persisting fails the in-memory table is left untouched, so memory
    /// and disk never disagree.
    pub fn save(&mut self, table: LeaseTable) -> LeaseResult<()> {
        if let Some(path) = &self.path {
            write_atomic(path, &table)?;
        }
        self.table = table;
        Ok(())
    }

    /// Gets the lease for a public key.
    pub fn get(&self, public_key: &WgPublicKey) -> LeaseResult<&Lease> {
        self.table
            .get(public_key)
            .ok_or_else(|| LeaseError::NotFound(public_key.to_base64()))
    }

    /// Inserts or replaces a lease by public key, then persists.
    pub fn put(&mut self, lease: Lease) -> LeaseResult<()> {
        let mut table = self.table.clone();
        table.insert(lease.public_key, lease);
        self.save(table)
    }

    /// Removes a lease if present, then persists. Returns true if it existed.
    pub fn delete(&mut self, public_key: &WgPublicKey) -> LeaseResult<bool> {
        if !self.table.contains_key(public_key) {
            return Ok(false);
        }
        let mut table = self.table.clone();
        table.remove(public_key);
        self.save(table)?;
        Ok(true)
    }

    /// Current table.
    pub fn table(&self) -> &LeaseTable {
        &self.table
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Write the table via `NamedTempFile` + fsync + persist.
fn write_atomic(path: &Path, table: &LeaseTable) -> LeaseResult<()> {
    let file = LeaseFile {
        version: LEASE_FILE_VERSION,
        leases: table.values().cloned().collect(),
    };
    let data = serde_json::to_vec_pretty(&file)
        .map_err(|e| LeaseError::Storage(std::io::Error::other(e)))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.as_file_mut().write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| LeaseError::Storage(e.error))?;
    sync_dir(dir)?;

    log::debug!("Persisted {} lease(s) to {}", table.len(), path.display());
    Ok(())
}

/// Flush the directory entry created by the rename.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> LeaseResult<()> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> LeaseResult<()> {
    Ok(())
}
