use std::{
    num::NonZeroU64,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use bytesize::ByteSize;
use log::{error, info};
use parking_lot::Mutex;

use crate::TransferError;
use crate::allocator::{SegmentAllocator, Slot};
use crate::host_mem::HostMemory;
use crate::metrics::core_metrics;
use crate::types::MemDesc;

/// RAII guard for a slice of a [`HostMemoryPool`]. Released on drop.
pub struct HostAllocation {
    slot: Slot,
    ptr: NonNull<u8>,
    pool: Arc<HostMemoryPool>,
}

// SAFETY: the allocation points into the pool mapping, which outlives it via
// the Arc and can be accessed from any thread.
unsafe impl Send for HostAllocation {}
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Reserved size in bytes (rounded up to the pool granule).
    pub fn len(&self) -> u64 {
        self.slot.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn desc(&self) -> MemDesc {
        MemDesc::new(self.addr(), self.len())
    }

    /// Copy `data` into the allocation at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.check_range(offset, data.len() as u64)?;
        // SAFETY: range checked above; the mapping is alive while self is.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the allocation.
    pub fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(out)
    }

    pub fn fill(&self, byte: u8) {
        // SAFETY: the whole slot belongs to this allocation.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), byte, self.len() as usize) };
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), TransferError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(TransferError::InvalidArgument(format!(
                "range offset={offset} len={len} exceeds allocation of {} bytes",
                self.len()
            ))),
        }
    }
}

impl std::fmt::Debug for HostAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAllocation")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        self.pool.release(&self.slot);
    }
}

/// A host memory mapping carved up by a [`SegmentAllocator`].
#[derive(Debug)]
pub struct HostMemoryPool {
    backing: HostMemory,
    allocator: Mutex<SegmentAllocator>,
    // Last exported "largest free" value, so an UpDownCounter can act like a gauge.
    last_largest_free: AtomicI64,
}

impl HostMemoryPool {
    /// Upper bound for simultaneous allocations.
    const MAX_SLOTS: u32 = 1_000_000;
    const DEFAULT_GRANULE: u64 = 512;

    /// Map a pool of `size` bytes.
    ///
    /// `granule` (rounded to a power of two, at least 512) sets the alignment
    /// and rounding of every allocation.
    pub fn new(
        size: usize,
        use_hugepages: bool,
        lock: bool,
        granule: Option<NonZeroU64>,
    ) -> Result<Arc<Self>, TransferError> {
        let backing = if use_hugepages {
            info!("Mapping host pool with huge pages: size={}", ByteSize(size as u64));
            HostMemory::map_hugepages(size, lock)?
        } else {
            HostMemory::map(size, lock)?
        };

        let capacity = backing.size() as u64;
        let granule = granule
            .map(|g| g.get())
            .unwrap_or(Self::DEFAULT_GRANULE)
            .max(Self::DEFAULT_GRANULE)
            .max(capacity.div_ceil(u32::MAX as u64))
            .next_power_of_two();
        let allocator = SegmentAllocator::with_granule(capacity, granule, Self::MAX_SLOTS)
            .map_err(|err| {
                TransferError::Failed(format!(
                    "host pool allocator (size={}, granule={}): {err}",
                    ByteSize(capacity),
                    granule
                ))
            })?;

        info!(
            "Host pool ready: addr={:#x} size={} granule={} locked={}",
            backing.addr(),
            ByteSize(capacity),
            ByteSize(granule),
            lock
        );

        if let Ok(capacity_i64) = i64::try_from(capacity) {
            core_metrics().pool_capacity_bytes.add(capacity_i64, &[]);
        } else {
            error!(
                "Host pool capacity exceeds i64::MAX; skipping capacity metric: capacity_bytes={}",
                capacity
            );
        }

        let pool = Arc::new(Self {
            backing,
            allocator: Mutex::new(allocator),
            last_largest_free: AtomicI64::new(0),
        });
        pool.update_largest_free_metric(capacity);
        Ok(pool)
    }

    fn update_largest_free_metric(&self, largest_free: u64) {
        let Ok(new) = i64::try_from(largest_free) else {
            return;
        };
        let old = self.last_largest_free.swap(new, Ordering::Relaxed);
        if new != old {
            core_metrics().pool_largest_free_bytes.add(new - old, &[]);
        }
    }

    /// Allocate `size` bytes. `None` when the pool cannot satisfy the request.
    pub fn allocate(self: &Arc<Self>, size: u64) -> Option<HostAllocation> {
        let mut allocator = self.allocator.lock();
        let slot = match allocator.reserve(size) {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                core_metrics().pool_alloc_failures.add(1, &[]);
                return None;
            }
            Err(err) => {
                error!(
                    "Host pool allocation error: {} (requested {})",
                    err,
                    ByteSize(size)
                );
                core_metrics().pool_alloc_failures.add(1, &[]);
                return None;
            }
        };
        self.update_largest_free_metric(allocator.largest_free());
        drop(allocator);

        // SAFETY: slot.offset + slot.len lies within the mapping.
        let ptr = unsafe { self.backing.as_ptr().add(slot.offset as usize) };
        let ptr = NonNull::new(ptr as *mut u8)?;

        if let Ok(len) = i64::try_from(slot.len.get()) {
            core_metrics().pool_used_bytes.add(len, &[]);
        }

        Some(HostAllocation {
            slot,
            ptr,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, slot: &Slot) {
        let mut allocator = self.allocator.lock();
        allocator.release(slot);
        self.update_largest_free_metric(allocator.largest_free());
        if let Ok(len) = i64::try_from(slot.len.get()) {
            core_metrics().pool_used_bytes.add(-len, &[]);
        }
    }

    /// The whole mapping, as registered with an engine.
    pub fn desc(&self) -> MemDesc {
        MemDesc::new(self.backing.addr(), self.backing.size() as u64)
    }

    /// (used_bytes, total_bytes)
    pub fn usage(&self) -> (u64, u64) {
        let allocator = self.allocator.lock();
        let total = allocator.capacity();
        (total - allocator.free_bytes(), total)
    }
}

impl Drop for HostMemoryPool {
    fn drop(&mut self) {
        let metrics = core_metrics();
        if let Ok(capacity) = i64::try_from(self.backing.size()) {
            metrics.pool_capacity_bytes.add(-capacity, &[]);
        }
        let last = self.last_largest_free.load(Ordering::Relaxed);
        if last != 0 {
            metrics.pool_largest_free_bytes.add(-last, &[]);
        }
    }
}
