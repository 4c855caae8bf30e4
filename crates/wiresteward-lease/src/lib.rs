//! IP lease allocation and WireGuard peer reconciliation.
//!
//! The server hands out addresses from a managed subnet to WireGuard public
//! keys, persists them in a lease file and keeps the peer list of a local
//! WireGuard device in line with the lease table. The agent requests those
//! leases over HTTP and applies them to its own devices.

pub mod agent;
pub mod allocator;
pub mod auth;
pub mod clock;
pub mod error;
pub mod keys;
pub mod manager;
pub mod peers;
pub mod protocol;
pub mod server;
pub mod store;
pub mod wg;

pub use agent::{Agent, AgentConfig, AgentDevice, LeaseClient, LeaseLink};
pub use allocator::{ManagedSubnet, NoAddressAvailable};
pub use auth::{
    FileTokenSource, StaticTokenSource, StaticTokenValidator, TokenSource, TokenValidator,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LeaseError, LeaseResult};
pub use keys::WgPublicKey;
pub use manager::{LeaseConfig, LeaseManager, SyncReport, UnmanagedPeerPolicy};
pub use peers::{FilePeerSource, PeerSource, StaticPeer, StaticPeerSource};
pub use protocol::{LeaseResponse, ServerStaticConfig};
pub use server::{LeaseService, LeaseServiceConfig};
pub use store::{Lease, LeaseStore};
#[cfg(target_os = "linux")]
pub use wg::KernelWg;
pub use wg::{MemoryWg, WgControl};
