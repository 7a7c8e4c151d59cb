// =============================================================================
// Coordination — instance membership and work sharding
// =============================================================================
//
// Horizontally scaled control-plane instances register themselves in a
// shared coordination store under a lease. Every instance watches the
// membership prefix and shards the workload set over the live members by
// consistent hashing, so each workload has exactly one writer at any time.
// =============================================================================

pub mod coordinator;
pub mod etcd;
pub mod memory;
pub mod registry;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use coordinator::{Coordinator, SingleInstance, Sharder};
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use registry::Registry;

/// Identifier of a granted lease.
pub type LeaseId = i64;

/// A change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

/// The key-value primitives the monitor needs from a coordination store:
/// prefix reads, prefix watches, and leased puts. Matches the etcd model;
/// `MemoryStore` provides the same semantics in-process.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease that expires `ttl_secs` after its last keepalive.
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// One keepalive beat. Fails once the lease is gone, which tells the
    /// holder to re-grant and re-register.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revoke a lease, atomically removing every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Write a key whose lifetime is bound to `lease`.
    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// All `(key, value)` pairs under a prefix.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Stream of changes under a prefix, starting from the current state.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>>;
}
