//! passtor DHT - Kademlia DHT storing signed account records
//!
//! Nodes keep a k-bucket routing table, talk to each other over a small UDP
//! request/reply protocol, and replicate account records on the peers closest
//! to the account ID. Reads query several replicas and keep the copy carrying
//! the most represented verified signature.

pub mod diagnostics;
pub mod messaging;
pub mod node;
pub mod reconcile;
pub mod routing;
pub mod storage;

pub use messaging::Messenger;
pub use node::DhtNode;
pub use reconcile::most_represented;
pub use routing::RoutingTable;
pub use storage::{AccountInfo, AccountStore, StoreError};

use std::time::Duration;
use thiserror::Error;

/// Nodes per k-bucket
pub const DHT_K: usize = 5;

/// Parallel workers per lookup
pub const DHT_ALPHA: usize = 2;

/// Replication factor used for client pushes
pub const REPLICATION_FACTOR: u32 = 3;

/// Fraction of the replication factor that must agree on a fetch
pub const ACCEPTANCE_THRESHOLD: f64 = 0.5;

/// Time to wait for a reply before resending
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Resends after the first attempt before a peer is considered unreachable
pub const MAX_RETRIES: u32 = 4;

/// Base of the randomized republish delay
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum DhtError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] passtor_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DhtError>;

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Number of nodes per k-bucket
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Replication factor for client pushes and quorum reads
    pub replication: u32,
    /// Fraction of `replication` that must agree before a fetch stops early
    pub threshold: f64,
    /// Reply timeout per attempt
    pub timeout: Duration,
    /// Resends after the first attempt
    pub max_retries: u32,
    /// Base interval of the randomized republish delay
    pub republish_interval: Duration,
    /// Schedule a republish for every newly stored record
    pub republish: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DHT_K,
            alpha: DHT_ALPHA,
            replication: REPLICATION_FACTOR,
            threshold: ACCEPTANCE_THRESHOLD,
            timeout: TIMEOUT,
            max_retries: MAX_RETRIES,
            republish_interval: REPUBLISH_INTERVAL,
            republish: true,
        }
    }
}

/// Minimum number of identical verified copies a fetch needs
pub fn quorum(threshold: f64, replication: u32) -> usize {
    (threshold * replication as f64).ceil() as usize
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Uniformly random value in `0..bound`, `0` when `bound` is zero
pub(crate) fn random_below(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        // If getrandom fails, use the clock as fallback
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        return nanos % bound;
    }
    u64::from_le_bytes(buf) % bound
}
