//! kvlink core
//!
//! Peer-to-peer KV cache block transfer over TCP:
//! - Memory registration with overlap checks and peer-visible segment tables
//! - One-sided READ/WRITE transfers between engines
//! - Blocks caches addressed by (cluster id, model id) with push/pull
//! - Cluster linking, a rendezvous store with barriers, and a keyed object store

pub mod allocator;
pub mod cache;
mod channel;
pub mod datadist;
pub mod engine;
pub mod host_mem;
pub mod host_pool;
pub mod link;
mod metrics;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
mod server;
pub mod store;
pub mod types;

pub use cache::{Cache, CacheDesc, CacheManager};
pub use datadist::{DataDist, DataDistConfig, Role};
pub use engine::{EngineConfig, TransferEngine};
pub use host_pool::{HostAllocation, HostMemoryPool};
pub use link::{ClusterInfo, IpInfo, LinkManager, LinkReport};
pub use rendezvous::{ProcessGroup, RendezvousClient, RendezvousServer};
pub use store::{DistributedStore, StoreConfig};
pub use types::{
    CacheKey, DataType, Endpoint, MemDesc, MemHandle, MemType, TransferOp, TransferOpDesc,
    TransferReq, TransferStatus,
};

use std::{fmt, io};

/// Numeric status codes shared with peers on the wire.
pub mod status {
    pub const SUCCESS: u32 = 0;
    pub const PARAM_INVALID: u32 = 103900;
    pub const TIMEOUT: u32 = 103901;
    pub const NOT_CONNECTED: u32 = 103902;
    pub const ALREADY_CONNECTED: u32 = 103903;
    pub const NOTIFY_FAILED: u32 = 103904;
    pub const UNSUPPORTED: u32 = 103905;
    pub const FAILED: u32 = 503900;
}

/// Errors returned by engine, cache, link and store operations.
#[derive(Debug)]
pub enum TransferError {
    /// Invalid argument provided.
    InvalidArgument(String),
    /// Operation did not finish before its deadline.
    Timeout(String),
    /// No channel to the named remote engine.
    NotConnected(String),
    /// A channel to the named remote engine already exists.
    AlreadyConnected(String),
    /// Peer notification could not be delivered.
    NotifyFailed(String),
    /// Feature or option not supported.
    Unsupported(String),
    /// Engine used before `initialize` or after `finalize`.
    NotInitialized,
    /// Socket or system error.
    Io(io::Error),
    /// Peer sent something we did not expect.
    Protocol(String),
    /// Any other failure.
    Failed(String),
}

impl TransferError {
    /// Status code reported to peers for this error.
    pub fn status_code(&self) -> u32 {
        match self {
            TransferError::InvalidArgument(_) => status::PARAM_INVALID,
            TransferError::Timeout(_) => status::TIMEOUT,
            TransferError::NotConnected(_) => status::NOT_CONNECTED,
            TransferError::AlreadyConnected(_) => status::ALREADY_CONNECTED,
            TransferError::NotifyFailed(_) => status::NOTIFY_FAILED,
            TransferError::Unsupported(_) => status::UNSUPPORTED,
            TransferError::NotInitialized
            | TransferError::Io(_)
            | TransferError::Protocol(_)
            | TransferError::Failed(_) => status::FAILED,
        }
    }

    /// Rebuild an error from a peer status. Returns `None` for `SUCCESS`.
    pub fn from_status(code: u32, message: String) -> Option<Self> {
        let err = match code {
            status::SUCCESS => return None,
            status::PARAM_INVALID => TransferError::InvalidArgument(message),
            status::TIMEOUT => TransferError::Timeout(message),
            status::NOT_CONNECTED => TransferError::NotConnected(message),
            status::ALREADY_CONNECTED => TransferError::AlreadyConnected(message),
            status::NOTIFY_FAILED => TransferError::NotifyFailed(message),
            status::UNSUPPORTED => TransferError::Unsupported(message),
            _ => TransferError::Failed(format!("remote status {code}: {message}")),
        };
        Some(err)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            TransferError::Timeout(msg) => write!(f, "timed out: {msg}"),
            TransferError::NotConnected(remote) => write!(f, "not connected to {remote}"),
            TransferError::AlreadyConnected(remote) => write!(f, "already connected to {remote}"),
            TransferError::NotifyFailed(msg) => write!(f, "notify failed: {msg}"),
            TransferError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            TransferError::NotInitialized => write!(f, "engine is not initialized"),
            TransferError::Io(err) => write!(f, "io error: {err}"),
            TransferError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            TransferError::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => TransferError::Timeout(err.to_string()),
            _ => TransferError::Io(err),
        }
    }
}

impl From<host_mem::HostMemError> for TransferError {
    fn from(err: host_mem::HostMemError) -> Self {
        TransferError::Failed(format!("host memory: {err}"))
    }
}
