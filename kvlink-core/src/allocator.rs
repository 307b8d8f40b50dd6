use offset_allocator::{Allocation as RawAllocation, Allocator as RawAllocator};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    num::NonZeroU64,
};

#[derive(Debug, PartialEq, Eq)]
pub enum AllocatorError {
    /// Granule must be a non-zero power of two.
    InvalidGranule(u64),
    /// The segment does not fit into the u32 unit space of the backing allocator.
    SegmentTooLarge { segment_bytes: u64, granule: u64 },
    /// The request does not fit into the u32 unit space of the backing allocator.
    RequestTooLarge { requested_bytes: u64, granule: u64 },
}

impl Display for AllocatorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AllocatorError::InvalidGranule(granule) => {
                write!(f, "granule {granule} must be a non-zero power of two")
            }
            AllocatorError::SegmentTooLarge {
                segment_bytes,
                granule,
            } => write!(
                f,
                "segment of {segment_bytes} bytes at granule {granule} overflows u32 units"
            ),
            AllocatorError::RequestTooLarge {
                requested_bytes,
                granule,
            } => write!(
                f,
                "request of {requested_bytes} bytes at granule {granule} overflows u32 units"
            ),
        }
    }
}

impl std::error::Error for AllocatorError {}

/// A byte range handed out by [`SegmentAllocator`].
pub struct Slot {
    /// Offset from the segment base, in bytes.
    pub offset: u64,
    /// Reserved size, rounded up to the granule.
    pub len: NonZeroU64,
    raw: RawAllocation,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Byte-granular front end for `offset-allocator`, which only speaks u32 units.
///
/// Every slot starts on a multiple of `granule`, so handing out a slot never
/// breaks the alignment of the segment base.
#[derive(Debug)]
pub struct SegmentAllocator {
    granule: NonZeroU64,
    total_units: u32,
    inner: RawAllocator,
}

impl SegmentAllocator {
    pub const DEFAULT_MAX_SLOTS: u32 = 128 * 1024;

    /// Manage `segment_bytes` with the smallest power-of-two granule that is at
    /// least `min_granule` and keeps the unit count within u32.
    pub fn new(segment_bytes: u64, min_granule: u64) -> Result<Self, AllocatorError> {
        let needed = segment_bytes.div_ceil(u32::MAX as u64).max(1);
        let granule = min_granule.max(needed).next_power_of_two();
        Self::with_granule(segment_bytes, granule, Self::DEFAULT_MAX_SLOTS)
    }

    pub fn with_granule(
        segment_bytes: u64,
        granule: u64,
        max_slots: u32,
    ) -> Result<Self, AllocatorError> {
        if granule == 0 || !granule.is_power_of_two() {
            return Err(AllocatorError::InvalidGranule(granule));
        }
        let granule = NonZeroU64::new(granule).ok_or(AllocatorError::InvalidGranule(granule))?;

        // Only whole granules are usable; a trailing partial granule is dropped.
        let units = segment_bytes / granule.get();
        let total_units = u32::try_from(units).map_err(|_| AllocatorError::SegmentTooLarge {
            segment_bytes,
            granule: granule.get(),
        })?;

        Ok(Self {
            granule,
            total_units,
            inner: RawAllocator::with_max_allocs(total_units, max_slots),
        })
    }

    pub fn granule(&self) -> u64 {
        self.granule.get()
    }

    /// Reserve `len` bytes. `Ok(None)` means the segment is full or `len` is zero.
    pub fn reserve(&mut self, len: u64) -> Result<Option<Slot>, AllocatorError> {
        if len == 0 {
            return Ok(None);
        }

        let units = u32::try_from(len.div_ceil(self.granule.get())).map_err(|_| {
            AllocatorError::RequestTooLarge {
                requested_bytes: len,
                granule: self.granule.get(),
            }
        })?;

        let Some(raw) = self.inner.allocate(units) else {
            return Ok(None);
        };

        let reserved = self.inner.allocation_size(raw) as u64 * self.granule.get();
        let Some(len) = NonZeroU64::new(reserved) else {
            self.inner.free(raw);
            return Ok(None);
        };
        Ok(Some(Slot {
            offset: raw.offset as u64 * self.granule.get(),
            len,
            raw,
        }))
    }

    pub fn release(&mut self, slot: &Slot) {
        self.inner.free(slot.raw);
    }

    pub fn capacity(&self) -> u64 {
        self.total_units as u64 * self.granule.get()
    }

    pub fn free_bytes(&self) -> u64 {
        self.inner.storage_report().total_free_space as u64 * self.granule.get()
    }

    pub fn largest_free(&self) -> u64 {
        self.inner.storage_report().largest_free_region as u64 * self.granule.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_granule_that_fits_u32_units() {
        let alloc = SegmentAllocator::new(64 * 1024 * 1024 * 1024, 1).unwrap();
        // 16-byte granules would need exactly 2^32 units, one too many.
        assert_eq!(alloc.granule(), 32);
        assert_eq!(alloc.capacity(), 64 * 1024 * 1024 * 1024);

        let alloc = SegmentAllocator::new(1 << 20, 512).unwrap();
        assert_eq!(alloc.granule(), 512);
    }

    #[test]
    fn reserve_rounds_to_granule() {
        let mut alloc = SegmentAllocator::with_granule(4096, 256, 64).unwrap();
        let slot = alloc.reserve(1).unwrap().unwrap();
        assert_eq!(slot.offset, 0);
        assert_eq!(slot.len.get(), 256);
        assert_eq!(alloc.free_bytes(), 4096 - 256);

        let next = alloc.reserve(300).unwrap().unwrap();
        assert_eq!(next.offset % 256, 0);
        assert_eq!(next.len.get(), 512);
    }

    #[test]
    fn released_neighbours_coalesce() {
        let mut alloc = SegmentAllocator::with_granule(1024, 256, 64).unwrap();
        let a = alloc.reserve(256).unwrap().unwrap();
        let b = alloc.reserve(256).unwrap().unwrap();
        alloc.release(&a);
        alloc.release(&b);

        let merged = alloc.reserve(512).unwrap().unwrap();
        assert_eq!(merged.offset, 0);
        assert_eq!(merged.len.get(), 512);
    }

    #[test]
    fn exhausted_segment_returns_none() {
        let mut alloc = SegmentAllocator::with_granule(512, 256, 64).unwrap();
        let _a = alloc.reserve(512).unwrap().unwrap();
        assert!(alloc.reserve(1).unwrap().is_none());
        assert!(alloc.reserve(0).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_granules_and_huge_requests() {
        assert_eq!(
            SegmentAllocator::with_granule(1024, 0, 8).unwrap_err(),
            AllocatorError::InvalidGranule(0)
        );
        assert_eq!(
            SegmentAllocator::with_granule(1024, 3, 8).unwrap_err(),
            AllocatorError::InvalidGranule(3)
        );

        let mut alloc = SegmentAllocator::with_granule(1 << 20, 1, 8).unwrap();
        let huge = u64::from(u32::MAX) * 2;
        assert_eq!(
            alloc.reserve(huge).unwrap_err(),
            AllocatorError::RequestTooLarge {
                requested_bytes: huge,
                granule: 1
            }
        );
    }
}
