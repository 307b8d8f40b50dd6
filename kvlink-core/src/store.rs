//! Keyed object store between ranks.
//!
//! Each rank mounts a segment of host memory, registered with its engine.
//! `put` copies an object into the local segment and publishes its location
//! on the master rendezvous store; `get` copies it out locally or READs it
//! from the owning rank.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bincode::{Decode, Encode};
use bytes::BytesMut;
use bytesize::ByteSize;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::TransferError;
use crate::engine::{EngineConfig, TransferEngine};
use crate::host_pool::{HostAllocation, HostMemoryPool};
use crate::rendezvous::RendezvousClient;
use crate::types::{Endpoint, MemDesc, MemHandle, MemType, TransferOp, TransferOpDesc};

pub const DEFAULT_GLOBAL_SEGMENT_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_LOCAL_BUFFER_SIZE: u64 = 20 * 1024 * 1024;
/// Buffer alignment expected by [`DistributedStore::register_buffer`] callers.
pub const BUFFER_ALIGNMENT: u64 = 2 * 1024 * 1024;

const OBJECT_PREFIX: &str = "store/obj/";
const CLAIM_PREFIX: &str = "store/claim/";

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Source and target placement of a copy, e.g. `h2d` is host to device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    H2H,
    H2D,
    D2H,
    D2D,
}

impl Schema {
    pub fn source(&self) -> MemType {
        match self {
            Schema::H2H | Schema::H2D => MemType::Host,
            Schema::D2H | Schema::D2D => MemType::Device,
        }
    }

    pub fn target(&self) -> MemType {
        match self {
            Schema::H2H | Schema::D2H => MemType::Host,
            Schema::H2D | Schema::D2D => MemType::Device,
        }
    }
}

impl FromStr for Schema {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h2h" => Ok(Schema::H2H),
            "h2d" => Ok(Schema::H2D),
            "d2h" => Ok(Schema::D2H),
            "d2d" => Ok(Schema::D2D),
            _ => Err(TransferError::Unsupported(format!("schema '{s}'"))),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Schema::H2H => "h2h",
            Schema::H2D => "h2d",
            Schema::D2H => "d2h",
            Schema::D2D => "d2d",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `ip:port` the engine listens on; peers read objects from here.
    pub local_hostname: String,
    /// Informational; object metadata lives on the master.
    pub metadata_server: String,
    pub global_segment_size: u64,
    pub local_buffer_size: u64,
    pub protocol: String,
    pub device_name: String,
    /// Rendezvous store holding object metadata.
    pub master_server_addr: String,
    pub request_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            local_hostname: String::new(),
            metadata_server: String::new(),
            global_segment_size: DEFAULT_GLOBAL_SEGMENT_SIZE,
            local_buffer_size: DEFAULT_LOCAL_BUFFER_SIZE,
            protocol: "tcp".to_string(),
            device_name: String::new(),
            master_server_addr: "127.0.0.1:50051".to_string(),
            request_timeout: Duration::from_secs(30),
            engine: EngineConfig::default(),
        }
    }
}

/// Where an object lives, as published on the master.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct ObjectMeta {
    owner: String,
    addr: u64,
    len: u64,
}

impl ObjectMeta {
    fn encode(&self) -> Result<Vec<u8>, TransferError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|err| TransferError::Failed(format!("encode object meta: {err}")))
    }

    fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(meta, _)| meta)
            .map_err(|err| TransferError::Protocol(format!("decode object meta: {err}")))
    }
}

#[derive(Debug, Clone, Copy)]
struct Buffer {
    handle: MemHandle,
    len: u64,
}

/// A rank's view of the distributed object store.
pub struct DistributedStore {
    config: StoreConfig,
    engine: Arc<TransferEngine>,
    master: RendezvousClient,
    segment: Arc<HostMemoryPool>,
    staging: tokio::sync::Mutex<Option<HostAllocation>>,
    buffers: Mutex<HashMap<u64, Buffer>>,
    objects: Mutex<HashMap<String, HostAllocation>>,
    owner_id: String,
    closed: tokio::sync::Mutex<bool>,
}

impl DistributedStore {
    /// Start the engine, mount and register the local segment, and connect
    /// to the master.
    pub async fn setup(config: StoreConfig) -> Result<Self, TransferError> {
        let endpoint: Endpoint = config.local_hostname.parse()?;
        if !endpoint.is_listening() {
            return Err(TransferError::InvalidArgument(format!(
                "store hostname '{}' needs a port",
                config.local_hostname
            )));
        }
        let master_addr: SocketAddr = config.master_server_addr.parse().map_err(|_| {
            TransferError::InvalidArgument(format!(
                "invalid master address '{}'",
                config.master_server_addr
            ))
        })?;
        if config.global_segment_size == 0 {
            return Err(TransferError::InvalidArgument(
                "global segment size must be positive".into(),
            ));
        }

        let segment_bytes = config.global_segment_size + config.local_buffer_size;
        let segment = HostMemoryPool::new(segment_bytes as usize, false, false, None)?;
        let engine = Arc::new(TransferEngine::new(config.engine.clone()));
        engine.initialize(&config.local_hostname).await?;

        let result = async {
            // SAFETY: the pool mapping lives in `self.segment` and outlives the engine state.
            unsafe { engine.register_mem(segment.desc(), MemType::Host)? };
            let staging = match config.local_buffer_size {
                0 => None,
                size => Some(segment.allocate(size).ok_or_else(|| {
                    TransferError::Failed("segment cannot hold the local buffer".into())
                })?),
            };
            let master = RendezvousClient::connect(master_addr, config.request_timeout).await?;
            Ok::<_, TransferError>((staging, master))
        }
        .await;
        let (staging, master) = match result {
            Ok(parts) => parts,
            Err(err) => {
                engine.finalize().await;
                return Err(err);
            }
        };

        let owner_id = engine.channel_id()?;
        info!(
            "Store ready: owner={} protocol={} device={} segment={} local_buffer={} master={} metadata={}",
            owner_id,
            config.protocol,
            config.device_name,
            ByteSize(config.global_segment_size),
            ByteSize(config.local_buffer_size),
            master_addr,
            config.metadata_server
        );
        Ok(Self {
            config,
            engine,
            master,
            segment,
            staging: tokio::sync::Mutex::new(staging),
            buffers: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            owner_id,
            closed: tokio::sync::Mutex::new(false),
        })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    /// (used, total) bytes of the local segment.
    pub fn segment_usage(&self) -> (u64, u64) {
        self.segment.usage()
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        if self.engine.is_initialized() {
            Ok(())
        } else {
            Err(TransferError::NotInitialized)
        }
    }

    /// Register a user buffer as a source or destination of puts and gets.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must stay valid until it is unregistered or the
    /// store is closed. Gets and remote peers may write into it.
    pub unsafe fn register_buffer(&self, addr: u64, len: u64) -> Result<(), TransferError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.register_buffer_as(addr, len, MemType::Host) }
    }

    /// [`register_buffer`](Self::register_buffer) with an explicit placement label.
    ///
    /// # Safety
    ///
    /// Same contract as [`register_buffer`](Self::register_buffer).
    pub unsafe fn register_buffer_as(
        &self,
        addr: u64,
        len: u64,
        placement: MemType,
    ) -> Result<(), TransferError> {
        self.ensure_open()?;
        let mut buffers = self.buffers.lock();
        if let Some(existing) = buffers.get(&addr) {
            if existing.len == len {
                debug!("Buffer already registered: addr={:#x} len={}", addr, len);
                return Ok(());
            }
            return Err(TransferError::InvalidArgument(format!(
                "buffer {addr:#x} already registered with {} bytes",
                existing.len
            )));
        }
        // SAFETY: forwarded to the caller.
        let handle = unsafe { self.engine.register_mem(MemDesc::new(addr, len), placement)? };
        buffers.insert(addr, Buffer { handle, len });
        info!(
            "Buffer registered: addr={:#x} size={} placement={}",
            addr,
            ByteSize(len),
            placement
        );
        Ok(())
    }

    /// Unregister the buffer starting at `addr`. Unknown addresses are logged and ignored.
    pub fn unregister_buffer(&self, addr: u64) -> Result<(), TransferError> {
        let Some(buffer) = self.buffers.lock().remove(&addr) else {
            warn!("Unregister of unknown buffer addr={:#x}", addr);
            return Ok(());
        };
        self.engine.deregister_mem(buffer.handle)
    }

    fn check_buffer(&self, addr: u64, len: u64) -> Result<(), TransferError> {
        let covered = addr.checked_add(len).is_some_and(|end| {
            self.buffers
                .lock()
                .iter()
                .any(|(start, buffer)| addr >= *start && end <= start + buffer.len)
        });
        if covered {
            Ok(())
        } else {
            Err(TransferError::InvalidArgument(format!(
                "range addr={addr:#x} len={len} is not inside a registered buffer"
            )))
        }
    }

    /// Store `len` bytes at `addr` (inside a registered buffer) under `key`.
    pub async fn put_from(&self, key: &str, addr: u64, len: u64) -> Result<(), TransferError> {
        self.ensure_open()?;
        if len == 0 {
            return Err(TransferError::InvalidArgument("object must not be empty".into()));
        }
        self.check_buffer(addr, len)?;
        let alloc = self.allocate_object(len)?;
        // SAFETY: the range lies in a registered buffer, which the caller keeps valid.
        let data = unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
        alloc.write_at(0, data)?;
        self.publish(key, alloc, len).await
    }

    /// Store a copy of `data` under `key`.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<(), TransferError> {
        self.ensure_open()?;
        if data.is_empty() {
            return Err(TransferError::InvalidArgument("object must not be empty".into()));
        }
        let alloc = self.allocate_object(data.len() as u64)?;
        alloc.write_at(0, data)?;
        self.publish(key, alloc, data.len() as u64).await
    }

    fn allocate_object(&self, len: u64) -> Result<HostAllocation, TransferError> {
        self.segment.allocate(len).ok_or_else(|| {
            TransferError::Failed(format!("segment has no room for {}", ByteSize(len)))
        })
    }

    async fn publish(&self, key: &str, alloc: HostAllocation, len: u64) -> Result<(), TransferError> {
        let claim = format!("{CLAIM_PREFIX}{key}");
        if self.master.add(&claim, 1).await? != 1 {
            self.master.add(&claim, -1).await?;
            return Err(TransferError::InvalidArgument(format!(
                "object '{key}' already exists"
            )));
        }
        let meta = ObjectMeta {
            owner: self.owner_id.clone(),
            addr: alloc.addr(),
            len,
        };
        if let Err(err) = self
            .master
            .set(&format!("{OBJECT_PREFIX}{key}"), meta.encode()?)
            .await
        {
            if let Err(rollback) = self.master.delete(&claim).await {
                warn!("Failed to release claim {} after publish error: {}", claim, rollback);
            }
            return Err(err);
        }
        self.objects.lock().insert(key.to_string(), alloc);
        debug!("Object stored: key={} len={} addr={:#x}", key, len, meta.addr);
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<ObjectMeta, TransferError> {
        match self
            .master
            .get(&format!("{OBJECT_PREFIX}{key}"), Duration::ZERO)
            .await?
        {
            Some(bytes) => ObjectMeta::decode(&bytes),
            None => Err(TransferError::InvalidArgument(format!(
                "object '{key}' does not exist"
            ))),
        }
    }

    async fn ensure_connected(&self, owner: &str) -> Result<(), TransferError> {
        if self.engine.is_connected(owner) {
            return Ok(());
        }
        match self.engine.connect(owner, self.config.request_timeout).await {
            Ok(()) | Err(TransferError::AlreadyConnected(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Copy object `key` into the registered range `[addr, addr + len)`.
    /// Returns the object size.
    pub async fn get_into(&self, key: &str, addr: u64, len: u64) -> Result<u64, TransferError> {
        self.ensure_open()?;
        let meta = self.lookup(key).await?;
        if len < meta.len {
            return Err(TransferError::InvalidArgument(format!(
                "buffer of {len} bytes cannot hold object '{key}' of {} bytes",
                meta.len
            )));
        }
        self.check_buffer(addr, meta.len)?;

        if meta.owner == self.owner_id {
            let registry = self.engine.registry()?;
            let access = registry.access([(meta.addr, meta.len), (addr, meta.len)])?;
            let mut data = BytesMut::with_capacity(meta.len as usize);
            access.gather(meta.addr, meta.len, &mut data);
            access.scatter(addr, &data);
        } else {
            self.ensure_connected(&meta.owner).await?;
            let descs = [TransferOpDesc::new(addr, meta.addr, meta.len)];
            self.engine
                .transfer_sync(&meta.owner, TransferOp::Read, &descs, self.config.request_timeout)
                .await?;
        }
        debug!("Object fetched: key={} len={} owner={}", key, meta.len, meta.owner);
        Ok(meta.len)
    }

    /// Fetch a copy of object `key`, staging remote reads through the local buffer.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, TransferError> {
        self.ensure_open()?;
        let meta = self.lookup(key).await?;
        if meta.owner == self.owner_id {
            let registry = self.engine.registry()?;
            let access = registry.access([(meta.addr, meta.len)])?;
            let mut data = BytesMut::with_capacity(meta.len as usize);
            access.gather(meta.addr, meta.len, &mut data);
            return Ok(data.to_vec());
        }

        self.ensure_connected(&meta.owner).await?;
        let staging = self.staging.lock().await;
        let Some(buffer) = staging.as_ref() else {
            return Err(TransferError::Unsupported(
                "remote get without a local buffer".into(),
            ));
        };
        let mut out = Vec::with_capacity(meta.len as usize);
        let mut offset = 0u64;
        while offset < meta.len {
            let chunk = (meta.len - offset).min(buffer.len());
            let descs = [TransferOpDesc::new(buffer.addr(), meta.addr + offset, chunk)];
            self.engine
                .transfer_sync(&meta.owner, TransferOp::Read, &descs, self.config.request_timeout)
                .await?;
            out.extend_from_slice(&buffer.read_at(0, chunk)?);
            offset += chunk;
        }
        Ok(out)
    }

    pub async fn is_exist(&self, key: &str) -> Result<bool, TransferError> {
        self.ensure_open()?;
        Ok(self
            .master
            .get(&format!("{OBJECT_PREFIX}{key}"), Duration::ZERO)
            .await?
            .is_some())
    }

    /// Remove object `key`. Only the owning rank may remove an object.
    pub async fn remove(&self, key: &str) -> Result<(), TransferError> {
        self.ensure_open()?;
        let meta = self.lookup(key).await?;
        if meta.owner != self.owner_id {
            return Err(TransferError::InvalidArgument(format!(
                "object '{key}' is owned by {}",
                meta.owner
            )));
        }
        self.unpublish(key).await?;
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn unpublish(&self, key: &str) -> Result<(), TransferError> {
        self.master.delete(&format!("{OBJECT_PREFIX}{key}")).await?;
        self.master.delete(&format!("{CLAIM_PREFIX}{key}")).await?;
        Ok(())
    }

    /// Remove owned objects, drop registrations and stop the engine. Idempotent.
    pub async fn close(&self) -> Result<(), TransferError> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        let keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        for key in &keys {
            if let Err(err) = self.unpublish(key).await {
                warn!("Failed to unpublish object {} on close: {}", key, err);
            }
        }
        self.objects.lock().clear();
        self.staging.lock().await.take();
        let buffers: Vec<Buffer> = self.buffers.lock().drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            if let Err(err) = self.engine.deregister_mem(buffer.handle) {
                warn!("Failed to deregister buffer on close: {}", err);
            }
        }
        self.engine.finalize().await;
        info!("Store closed: owner={} objects_removed={}", self.owner_id, keys.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_alignment() {
        assert_eq!(align_up(0, BUFFER_ALIGNMENT), 0);
        assert_eq!(align_up(1, BUFFER_ALIGNMENT), BUFFER_ALIGNMENT);
        assert_eq!(align_up(BUFFER_ALIGNMENT, BUFFER_ALIGNMENT), BUFFER_ALIGNMENT);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn schema_placements() {
        let schema: Schema = "h2d".parse().unwrap();
        assert_eq!(schema.source(), MemType::Host);
        assert_eq!(schema.target(), MemType::Device);
        assert_eq!(schema.to_string(), "h2d");
        assert!(matches!(
            "x2y".parse::<Schema>(),
            Err(TransferError::Unsupported(_))
        ));
    }

    #[test]
    fn object_meta_encoding() {
        let meta = ObjectMeta {
            owner: "10.0.0.1:12345".into(),
            addr: 0x7f00_0000_0000,
            len: 42,
        };
        assert_eq!(ObjectMeta::decode(&meta.encode().unwrap()).unwrap(), meta);
    }

    #[tokio::test]
    async fn setup_rejects_client_only_hostname() {
        let config = StoreConfig {
            local_hostname: "127.0.0.1".into(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            DistributedStore::setup(config).await,
            Err(TransferError::InvalidArgument(_))
        ));
    }
}
