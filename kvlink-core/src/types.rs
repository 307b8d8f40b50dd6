use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::TransferError;

/// Where a registered region lives. Only host-addressable memory is moved by
/// this crate; `Device` is kept as a placement label so peers can tell caches apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum MemType {
    Device,
    Host,
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemType::Device => write!(f, "device"),
            MemType::Host => write!(f, "host"),
        }
    }
}

/// Direction of a one-sided transfer, seen from the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum TransferOp {
    /// Remote memory -> local memory.
    Read,
    /// Local memory -> remote memory.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    pub addr: u64,
    pub len: u64,
}

impl MemDesc {
    pub fn new(addr: u64, len: u64) -> Self {
        Self { addr, len }
    }

    /// Exclusive end address, `None` when the range wraps around.
    pub fn end(&self) -> Option<u64> {
        self.addr.checked_add(self.len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOpDesc {
    pub local_addr: u64,
    pub remote_addr: u64,
    pub len: u64,
}

impl TransferOpDesc {
    pub fn new(local_addr: u64, remote_addr: u64, len: u64) -> Self {
        Self {
            local_addr,
            remote_addr,
            len,
        }
    }
}

/// Opaque handle returned by memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemHandle(pub(crate) u64);

impl MemHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Opaque handle for an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferReq(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Waiting,
    Completed,
    Failed,
}

/// A listen/connect address such as `10.0.0.1:26000` or `[::1]:26000`.
///
/// A missing port (or port 0) denotes a client-only engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn is_listening(&self) -> bool {
        self.port > 0
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || TransferError::InvalidArgument(format!("invalid endpoint '{s}'"));
        if s.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = s.strip_prefix('[') {
            // [v6] or [v6]:port
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let ip: IpAddr = host.parse().map_err(|_| invalid())?;
            if !ip.is_ipv6() {
                return Err(invalid());
            }
            let port = match tail {
                "" => 0,
                _ => tail
                    .strip_prefix(':')
                    .ok_or_else(invalid)?
                    .parse::<u16>()
                    .map_err(|_| invalid())?,
            };
            return Ok(Self::new(ip, port));
        }

        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::new(ip, 0));
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let ip: std::net::Ipv4Addr = host.parse().map_err(|_| invalid())?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(IpAddr::V4(ip), port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Identifies a blocks cache: the owning cluster plus a model/sequence id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize,
)]
pub struct CacheKey {
    pub cluster_id: u64,
    pub model_id: u64,
}

impl CacheKey {
    pub fn new(cluster_id: u64, model_id: u64) -> Self {
        Self {
            cluster_id,
            model_id,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.cluster_id, self.model_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Uint8,
    Int16,
    Int32,
    Int64,
    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl DataType {
    pub fn size(&self) -> u64 {
        match self {
            DataType::Bool | DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
        }
    }
}
