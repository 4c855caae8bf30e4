//! Error types for lease allocation, persistence and reconciliation.

use thiserror::Error;

/// Lease engine errors.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Required configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The persisted lease table cannot be trusted.
    #[error("Lease storage is corrupt: {0}")]
    StorageCorruption(String),

    /// Lease file I/O error.
    #[error("Lease storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// No address could be allocated, even after reclaiming expired leases.
    #[error("IP allocation failed: {0}")]
    AllocationFailed(String),

    /// Bearer token missing or rejected.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// WireGuard control interface error.
    #[error("WireGuard error: {0}")]
    WireGuard(String),

    /// A reconciliation pass could not apply its diff at all.
    #[error("Reconciliation failed: {0}")]
    ReconciliationFailed(String),

    /// Lease server could not be reached (agent side).
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Lease server answered with a failure status (agent side).
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Public key parsing error.
    #[error("Key error: {0}")]
    Key(String),

    /// No lease exists for the given key.
    #[error("Lease not found: {0}")]
    NotFound(String),
}

impl LeaseError {
    /// Returns true if the process must stop rather than continue on unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LeaseError::Config(_) | LeaseError::StorageCorruption(_))
    }

    /// Returns true if the failure is contained and will be retried on the next cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LeaseError::AllocationFailed(_)
                | LeaseError::AuthFailed(_)
                | LeaseError::WireGuard(_)
                | LeaseError::UpstreamUnreachable(_)
                | LeaseError::Upstream { .. }
        )
    }
}

/// Result type alias for lease operations.
pub type LeaseResult<T> = Result<T, LeaseError>;
