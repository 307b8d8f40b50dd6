//! Blocks caches registered under a [`CacheKey`] and block-level push/pull.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bincode::{Decode, Encode};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::engine::TransferEngine;
use crate::host_pool::{HostAllocation, HostMemoryPool};
use crate::link::LinkManager;
use crate::metrics::core_metrics;
use crate::types::{CacheKey, DataType, MemDesc, MemHandle, MemType, TransferOp, TransferOpDesc};

/// Metadata key under which an engine serves its cache table.
pub const CACHE_TABLE_KEY: &str = "cache_table";

/// Layout of a blocks cache: `num_tensors` tensors of `shape`, where
/// `shape[0]` is the number of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct CacheDesc {
    pub num_tensors: u32,
    pub shape: Vec<u64>,
    pub data_type: DataType,
    pub placement: MemType,
}

impl CacheDesc {
    pub fn new(num_tensors: u32, shape: Vec<u64>, data_type: DataType, placement: MemType) -> Self {
        Self {
            num_tensors,
            shape,
            data_type,
            placement,
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.num_tensors == 0 {
            return Err(TransferError::InvalidArgument(
                "cache needs at least one tensor".into(),
            ));
        }
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(TransferError::InvalidArgument(format!(
                "invalid cache shape {:?}",
                self.shape
            )));
        }
        self.shape
            .iter()
            .try_fold(self.data_type.size(), |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!("cache shape {:?} overflows", self.shape))
            })?;
        Ok(())
    }

    pub fn num_blocks(&self) -> u64 {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Bytes of one block within one tensor.
    pub fn block_bytes(&self) -> u64 {
        self.shape.iter().skip(1).product::<u64>() * self.data_type.size()
    }

    pub fn tensor_bytes(&self) -> u64 {
        self.num_blocks() * self.block_bytes()
    }
}

/// A registered cache as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cache {
    pub cache_id: u64,
    pub desc: CacheDesc,
    pub tensor_addrs: Vec<u64>,
    pub key: CacheKey,
}

/// One row of the cache table served to linked peers.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub cache_id: u64,
    pub desc: CacheDesc,
    pub tensor_addrs: Vec<u64>,
}

pub(crate) fn encode_cache_table(entries: &[CacheEntry]) -> Result<Vec<u8>, TransferError> {
    bincode::encode_to_vec(entries, bincode::config::standard())
        .map_err(|err| TransferError::Failed(format!("encode cache table: {err}")))
}

pub(crate) fn decode_cache_table(bytes: &[u8]) -> Result<Vec<CacheEntry>, TransferError> {
    let (entries, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|err| TransferError::Protocol(format!("decode cache table: {err}")))?;
    Ok(entries)
}

/// Build transfer descs for a block mapping, one desc per tensor per run of
/// consecutive blocks.
pub(crate) fn block_descs(
    local: &Cache,
    remote: &CacheEntry,
    local_blocks: &[u64],
    remote_blocks: &[u64],
) -> Result<Vec<TransferOpDesc>, TransferError> {
    if local_blocks.is_empty() {
        return Err(TransferError::InvalidArgument(
            "block list must not be empty".into(),
        ));
    }
    if local_blocks.len() != remote_blocks.len() {
        return Err(TransferError::InvalidArgument(format!(
            "block lists differ in length: {} vs {}",
            local_blocks.len(),
            remote_blocks.len()
        )));
    }
    remote.desc.validate()?;
    if remote.tensor_addrs.len() != remote.desc.num_tensors as usize {
        return Err(TransferError::InvalidArgument(format!(
            "remote cache {} lists {} tensors for {}",
            remote.key,
            remote.tensor_addrs.len(),
            remote.desc.num_tensors
        )));
    }
    if local.desc.num_tensors != remote.desc.num_tensors
        || local.desc.block_bytes() != remote.desc.block_bytes()
    {
        return Err(TransferError::InvalidArgument(format!(
            "cache {} ({} tensors, {} B/block) is incompatible with remote {} ({} tensors, {} B/block)",
            local.key,
            local.desc.num_tensors,
            local.desc.block_bytes(),
            remote.key,
            remote.desc.num_tensors,
            remote.desc.block_bytes()
        )));
    }
    let check = |blocks: &[u64], limit: u64, side: &str| {
        match blocks.iter().find(|b| **b >= limit) {
            Some(b) => Err(TransferError::InvalidArgument(format!(
                "{side} block index {b} out of range (num_blocks={limit})"
            ))),
            None => Ok(()),
        }
    };
    check(local_blocks, local.desc.num_blocks(), "local")?;
    check(remote_blocks, remote.desc.num_blocks(), "remote")?;

    // (local_start, remote_start, count)
    let mut runs: Vec<(u64, u64, u64)> = Vec::new();
    for (&l, &r) in local_blocks.iter().zip(remote_blocks) {
        match runs.last_mut() {
            Some((ls, rs, n)) if *ls + *n == l && *rs + *n == r => *n += 1,
            _ => runs.push((l, r, 1)),
        }
    }

    let block_bytes = local.desc.block_bytes();
    let offset = |base: u64, block: u64, side: &str| {
        block
            .checked_mul(block_bytes)
            .and_then(|off| base.checked_add(off))
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "{side} tensor at {base:#x} overflows at block {block}"
                ))
            })
    };
    let mut descs = Vec::with_capacity(runs.len() * local.tensor_addrs.len());
    for (&local_base, &remote_base) in local.tensor_addrs.iter().zip(&remote.tensor_addrs) {
        for &(ls, rs, n) in &runs {
            let local_addr = offset(local_base, ls, "local")?;
            let remote_addr = offset(remote_base, rs, "remote")?;
            // The run has to end inside the address space as well.
            offset(remote_base, rs + n, "remote")?;
            descs.push(TransferOpDesc::new(local_addr, remote_addr, n * block_bytes));
        }
    }
    Ok(descs)
}

struct CacheRecord {
    cache: Cache,
    handles: Vec<MemHandle>,
    // Tensors allocated by us; freed after the handles are deregistered.
    owned: Vec<HostAllocation>,
}

/// Registers local caches and moves blocks to and from linked clusters.
pub struct CacheManager {
    engine: Arc<TransferEngine>,
    links: Arc<LinkManager>,
    pool: Option<Arc<HostMemoryPool>>,
    caches: Mutex<BTreeMap<u64, CacheRecord>>,
    next_id: AtomicU64,
    transfer_timeout: Duration,
}

impl CacheManager {
    pub fn new(
        engine: Arc<TransferEngine>,
        links: Arc<LinkManager>,
        pool: Option<Arc<HostMemoryPool>>,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            links,
            pool,
            caches: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            transfer_timeout,
        }
    }

    /// Register caller-owned tensors as a blocks cache under `key`.
    ///
    /// # Safety
    ///
    /// Each address must point to at least `desc.tensor_bytes()` bytes that
    /// stay valid until the cache is unregistered. Peers may write into them.
    pub unsafe fn register_blocks_cache(
        &self,
        desc: &CacheDesc,
        tensor_addrs: &[u64],
        key: CacheKey,
    ) -> Result<Cache, TransferError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.register_inner(desc, tensor_addrs.to_vec(), key, Vec::new()) }
    }

    /// Allocate zero-filled tensors from the host pool and register them.
    pub fn allocate_blocks_cache(&self, desc: &CacheDesc, key: CacheKey) -> Result<Cache, TransferError> {
        desc.validate()?;
        let Some(pool) = &self.pool else {
            return Err(TransferError::Unsupported(
                "no host memory pool configured".into(),
            ));
        };
        let mut owned = Vec::with_capacity(desc.num_tensors as usize);
        for _ in 0..desc.num_tensors {
            let alloc = pool.allocate(desc.tensor_bytes()).ok_or_else(|| {
                TransferError::Failed(format!(
                    "host pool cannot fit a {} byte tensor",
                    desc.tensor_bytes()
                ))
            })?;
            alloc.fill(0);
            owned.push(alloc);
        }
        let addrs = owned.iter().map(HostAllocation::addr).collect();
        // SAFETY: the allocations are stored in the record and outlive the registration.
        unsafe { self.register_inner(desc, addrs, key, owned) }
    }

    unsafe fn register_inner(
        &self,
        desc: &CacheDesc,
        tensor_addrs: Vec<u64>,
        key: CacheKey,
        owned: Vec<HostAllocation>,
    ) -> Result<Cache, TransferError> {
        desc.validate()?;
        if tensor_addrs.len() != desc.num_tensors as usize {
            return Err(TransferError::InvalidArgument(format!(
                "cache expects {} tensors, got {} addresses",
                desc.num_tensors,
                tensor_addrs.len()
            )));
        }

        let mut caches = self.caches.lock();
        if caches.values().any(|record| record.cache.key == key) {
            return Err(TransferError::InvalidArgument(format!(
                "cache key {key} is already registered"
            )));
        }

        let tensor_bytes = desc.tensor_bytes();
        let mut handles = Vec::with_capacity(tensor_addrs.len());
        for &addr in &tensor_addrs {
            // SAFETY: validity of the range is the caller's contract.
            let registered = unsafe {
                self.engine
                    .register_mem(MemDesc::new(addr, tensor_bytes), desc.placement)
            };
            match registered {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in handles {
                        if let Err(rollback) = self.engine.deregister_mem(handle) {
                            warn!("Rollback deregister failed: {}", rollback);
                        }
                    }
                    return Err(err);
                }
            }
        }

        let cache_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cache = Cache {
            cache_id,
            desc: desc.clone(),
            tensor_addrs,
            key,
        };
        caches.insert(
            cache_id,
            CacheRecord {
                cache: cache.clone(),
                handles,
                owned,
            },
        );
        let table = Self::table_of(&caches);
        drop(caches);

        info!(
            "Cache registered: cache_id={} key={} tensors={} shape={:?} dtype={:?}",
            cache_id, key, desc.num_tensors, desc.shape, desc.data_type
        );
        self.publish(&table)?;
        Ok(cache)
    }

    pub fn unregister_cache(&self, cache_id: u64) -> Result<(), TransferError> {
        let mut caches = self.caches.lock();
        let record = caches.remove(&cache_id).ok_or_else(|| {
            TransferError::InvalidArgument(format!("unknown cache id {cache_id}"))
        })?;
        let table = Self::table_of(&caches);
        drop(caches);

        self.release(record);
        info!("Cache unregistered: cache_id={}", cache_id);
        self.publish(&table)
    }

    /// Unregister every cache, logging failures.
    pub fn unregister_all(&self) {
        let records = std::mem::take(&mut *self.caches.lock());
        let count = records.len();
        for record in records.into_values() {
            self.release(record);
        }
        if count > 0 {
            info!("Unregistered {} caches", count);
        }
        if let Err(err) = self.publish(&[]) {
            debug!("Cache table not published: {}", err);
        }
    }

    fn release(&self, record: CacheRecord) {
        for handle in record.handles {
            if let Err(err) = self.engine.deregister_mem(handle) {
                debug!("Deregister on cache release failed: {}", err);
            }
        }
        drop(record.owned);
    }

    fn table_of(caches: &BTreeMap<u64, CacheRecord>) -> Vec<CacheEntry> {
        caches
            .values()
            .map(|record| CacheEntry {
                key: record.cache.key,
                cache_id: record.cache.cache_id,
                desc: record.cache.desc.clone(),
                tensor_addrs: record.cache.tensor_addrs.clone(),
            })
            .collect()
    }

    fn publish(&self, table: &[CacheEntry]) -> Result<(), TransferError> {
        self.engine
            .publish_metadata(CACHE_TABLE_KEY, encode_cache_table(table)?)
    }

    pub fn caches(&self) -> Vec<Cache> {
        self.caches
            .lock()
            .values()
            .map(|record| record.cache.clone())
            .collect()
    }

    pub fn cache(&self, cache_id: u64) -> Option<Cache> {
        self.caches
            .lock()
            .get(&cache_id)
            .map(|record| record.cache.clone())
    }

    fn ensure_registered(&self, cache: &Cache) -> Result<(), TransferError> {
        match self.caches.lock().get(&cache.cache_id) {
            Some(record) if record.cache == *cache => Ok(()),
            _ => Err(TransferError::InvalidArgument(format!(
                "cache {} is not registered",
                cache.cache_id
            ))),
        }
    }

    /// Write `src_blocks` of the local `cache` into `dst_blocks` of the remote
    /// cache registered under `dst_key`.
    pub async fn push_blocks(
        &self,
        dst_key: CacheKey,
        cache: &Cache,
        src_blocks: &[u64],
        dst_blocks: &[u64],
    ) -> Result<(), TransferError> {
        self.ensure_registered(cache)?;
        let (remote, entry) = self.links.resolve(dst_key, self.transfer_timeout).await?;
        let descs = block_descs(cache, &entry, src_blocks, dst_blocks)?;
        self.engine
            .transfer_sync(&remote, TransferOp::Write, &descs, self.transfer_timeout)
            .await?;
        core_metrics()
            .block_transfers
            .add(src_blocks.len() as u64, &[]);
        debug!(
            "Pushed blocks: cache_id={} dst={} blocks={} descs={}",
            cache.cache_id,
            dst_key,
            src_blocks.len(),
            descs.len()
        );
        Ok(())
    }

    /// Read `src_blocks` of the remote cache registered under `src_key` into
    /// `dst_blocks` of the local `cache`.
    pub async fn pull_blocks(
        &self,
        src_key: CacheKey,
        cache: &Cache,
        src_blocks: &[u64],
        dst_blocks: &[u64],
    ) -> Result<(), TransferError> {
        self.ensure_registered(cache)?;
        let (remote, entry) = self.links.resolve(src_key, self.transfer_timeout).await?;
        let descs = block_descs(cache, &entry, dst_blocks, src_blocks)?;
        self.engine
            .transfer_sync(&remote, TransferOp::Read, &descs, self.transfer_timeout)
            .await?;
        core_metrics()
            .block_transfers
            .add(src_blocks.len() as u64, &[]);
        debug!(
            "Pulled blocks: cache_id={} src={} blocks={} descs={}",
            cache.cache_id,
            src_key,
            src_blocks.len(),
            descs.len()
        );
        Ok(())
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        for record in std::mem::take(self.caches.get_mut()).into_values() {
            for handle in record.handles {
                if let Err(err) = self.engine.deregister_mem(handle) {
                    warn!(
                        "Deregister failed while dropping cache: cache_id={} err={}",
                        record.cache.cache_id, err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(blocks: u64) -> CacheDesc {
        CacheDesc::new(2, vec![blocks, 10], DataType::Float32, MemType::Host)
    }

    fn local_cache(blocks: u64) -> Cache {
        Cache {
            cache_id: 1,
            desc: desc(blocks),
            tensor_addrs: vec![0x10000, 0x20000],
            key: CacheKey::new(0, 0),
        }
    }

    fn remote_entry(blocks: u64) -> CacheEntry {
        CacheEntry {
            key: CacheKey::new(1, 0),
            cache_id: 7,
            desc: desc(blocks),
            tensor_addrs: vec![0x90000, 0xa0000],
        }
    }

    #[test]
    fn desc_sizes_and_validation() {
        let d = desc(3);
        assert_eq!(d.num_blocks(), 3);
        assert_eq!(d.block_bytes(), 40);
        assert_eq!(d.tensor_bytes(), 120);
        assert!(d.validate().is_ok());

        assert!(CacheDesc::new(0, vec![3, 10], DataType::Float32, MemType::Host)
            .validate()
            .is_err());
        assert!(CacheDesc::new(1, vec![], DataType::Float32, MemType::Host)
            .validate()
            .is_err());
        assert!(CacheDesc::new(1, vec![3, 0], DataType::Float32, MemType::Host)
            .validate()
            .is_err());
        assert!(
            CacheDesc::new(1, vec![u64::MAX, 2], DataType::Float32, MemType::Host)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn remote_tensor_addresses_that_overflow_are_rejected() {
        let mut remote = remote_entry(3);
        remote.tensor_addrs[1] = u64::MAX - 30;
        let err = block_descs(&local_cache(3), &remote, &[0, 2], &[0, 2]).unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));

        // Block 0 starts in range but its run still runs off the end.
        let err = block_descs(&local_cache(3), &remote, &[0], &[0]).unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));
    }

    #[test]
    fn consecutive_blocks_merge_into_one_desc_per_tensor() {
        let descs = block_descs(&local_cache(3), &remote_entry(3), &[0, 1], &[0, 1]).unwrap();
        assert_eq!(
            descs,
            vec![
                TransferOpDesc::new(0x10000, 0x90000, 80),
                TransferOpDesc::new(0x20000, 0xa0000, 80),
            ]
        );
    }

    #[test]
    fn scattered_blocks_produce_one_desc_per_run() {
        let descs = block_descs(&local_cache(8), &remote_entry(8), &[2, 3, 7], &[0, 1, 5]).unwrap();
        assert_eq!(descs.len(), 4);
        assert_eq!(descs[0], TransferOpDesc::new(0x10000 + 80, 0x90000, 80));
        assert_eq!(descs[1], TransferOpDesc::new(0x10000 + 280, 0x90000 + 200, 40));
        assert_eq!(descs[2].local_addr, 0x20000 + 80);
    }

    #[test]
    fn block_lists_are_checked() {
        let local = local_cache(3);
        let remote = remote_entry(3);
        assert!(block_descs(&local, &remote, &[], &[]).is_err());
        assert!(block_descs(&local, &remote, &[0], &[0, 1]).is_err());
        assert!(block_descs(&local, &remote, &[3], &[0]).is_err());
        assert!(block_descs(&local, &remote, &[0], &[3]).is_err());

        let mut wide = remote_entry(3);
        wide.desc.shape = vec![3, 20];
        assert!(block_descs(&local, &wide, &[0], &[0]).is_err());
    }

    #[test]
    fn cache_table_survives_encoding() {
        let table = vec![remote_entry(3)];
        let bytes = encode_cache_table(&table).unwrap();
        assert_eq!(decode_cache_table(&bytes).unwrap(), table);
        assert!(decode_cache_table(&[0xff]).is_err());
    }

    #[tokio::test]
    async fn allocate_register_and_unregister() {
        let engine = Arc::new(TransferEngine::default());
        engine.initialize("127.0.0.1").await.unwrap();
        let links = Arc::new(LinkManager::new(Arc::clone(&engine)));
        let pool = HostMemoryPool::new(1 << 20, false, false, None).unwrap();
        let manager = CacheManager::new(
            Arc::clone(&engine),
            links,
            Some(pool),
            Duration::from_secs(1),
        );

        let cache = manager
            .allocate_blocks_cache(&desc(3), CacheKey::new(0, 0))
            .unwrap();
        assert_eq!(cache.tensor_addrs.len(), 2);
        assert!(matches!(
            manager.allocate_blocks_cache(&desc(3), CacheKey::new(0, 0)),
            Err(TransferError::InvalidArgument(_))
        ));
        assert_eq!(engine.registry().unwrap().len(), 2);

        manager.unregister_cache(cache.cache_id).unwrap();
        assert!(engine.registry().unwrap().is_empty());
        assert!(matches!(
            manager.unregister_cache(cache.cache_id),
            Err(TransferError::InvalidArgument(_))
        ));
        engine.finalize().await;
    }
}
