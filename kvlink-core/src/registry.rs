//! Bookkeeping for memory regions that peers may read and write.

use std::collections::BTreeMap;

use bytes::BytesMut;
use log::{debug, warn};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::TransferError;
use crate::metrics::core_metrics;
use crate::protocol::SegmentInfo;
use crate::types::{MemDesc, MemHandle, MemType};

#[derive(Debug, Clone, Copy)]
struct Region {
    desc: MemDesc,
    mem_type: MemType,
    refs: u32,
}

impl Region {
    fn end(&self) -> u64 {
        // Registration rejects wrapping ranges.
        self.desc.addr + self.desc.len
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.desc.addr && end <= self.end(),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_handle: u64,
    regions: BTreeMap<u64, Region>,
}

/// Registered memory, keyed by handle.
///
/// Exact re-registrations of a region are reference counted, so two owners of
/// the same tensor can register and deregister independently.
#[derive(Debug, Default)]
pub struct MemRegistry {
    inner: RwLock<RegistryInner>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, desc: MemDesc, mem_type: MemType) -> Result<MemHandle, TransferError> {
        if desc.addr == 0 {
            return Err(TransferError::InvalidArgument(
                "memory address must not be null".into(),
            ));
        }
        if desc.len == 0 {
            return Err(TransferError::InvalidArgument(
                "memory length must be greater than zero".into(),
            ));
        }
        let Some(end) = desc.end() else {
            return Err(TransferError::InvalidArgument(format!(
                "memory range addr={:#x} len={} overflows",
                desc.addr, desc.len
            )));
        };

        let mut inner = self.inner.write();
        for (handle, region) in inner.regions.iter_mut() {
            if region.mem_type != mem_type {
                continue;
            }
            if region.desc == desc {
                region.refs += 1;
                debug!(
                    "Memory already registered: handle={} addr={:#x} len={} refs={}",
                    handle, desc.addr, desc.len, region.refs
                );
                return Ok(MemHandle(*handle));
            }
            if desc.addr < region.end() && region.desc.addr < end {
                return Err(TransferError::InvalidArgument(format!(
                    "memory addr={:#x} len={} overlaps registered {} region addr={:#x} len={}",
                    desc.addr, desc.len, mem_type, region.desc.addr, region.desc.len
                )));
            }
        }

        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.regions.insert(
            handle,
            Region {
                desc,
                mem_type,
                refs: 1,
            },
        );
        drop(inner);

        let metrics = core_metrics();
        metrics.registered_regions.add(1, &[]);
        if let Ok(len) = i64::try_from(desc.len) {
            metrics.registered_bytes.add(len, &[]);
        }
        debug!(
            "Registered memory: handle={} type={} addr={:#x} len={}",
            handle, mem_type, desc.addr, desc.len
        );
        Ok(MemHandle(handle))
    }

    /// Drop one reference to `handle`. Unknown handles are logged and ignored.
    pub fn deregister(&self, handle: MemHandle) {
        let mut inner = self.inner.write();
        let Some(region) = inner.regions.get_mut(&handle.0) else {
            warn!("Deregister of unknown memory handle {}", handle.0);
            return;
        };
        region.refs -= 1;
        if region.refs > 0 {
            return;
        }
        let Some(region) = inner.regions.remove(&handle.0) else {
            return;
        };
        drop(inner);

        let metrics = core_metrics();
        metrics.registered_regions.add(-1, &[]);
        if let Ok(len) = i64::try_from(region.desc.len) {
            metrics.registered_bytes.add(-len, &[]);
        }
        debug!(
            "Deregistered memory: handle={} addr={:#x} len={}",
            handle.0, region.desc.addr, region.desc.len
        );
    }

    /// Handle of the region starting exactly at `addr`, if any.
    pub fn find_by_addr(&self, addr: u64) -> Option<MemHandle> {
        self.inner
            .read()
            .regions
            .iter()
            .find(|(_, region)| region.desc.addr == addr)
            .map(|(handle, _)| MemHandle(*handle))
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.inner
            .read()
            .regions
            .values()
            .map(|region| SegmentInfo {
                addr: region.desc.addr,
                len: region.desc.len,
                mem_type: region.mem_type,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration regardless of reference counts.
    pub fn clear(&self) {
        let regions = std::mem::take(&mut self.inner.write().regions);
        let metrics = core_metrics();
        for region in regions.values() {
            metrics.registered_regions.add(-1, &[]);
            if let Ok(len) = i64::try_from(region.desc.len) {
                metrics.registered_bytes.add(-len, &[]);
            }
        }
    }

    /// Validate `spans` and pin the registry for the duration of a copy.
    ///
    /// Every `(addr, len)` must lie inside a single registered region.
    /// Deregistration blocks until the returned guard is dropped.
    pub fn access<'a, I>(&'a self, spans: I) -> Result<MemAccess<'a>, TransferError>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let guard = self.inner.read();
        for (addr, len) in spans {
            if addr == 0 {
                return Err(TransferError::InvalidArgument(
                    "transfer address must not be null".into(),
                ));
            }
            if !guard.regions.values().any(|r| r.contains(addr, len)) {
                return Err(TransferError::InvalidArgument(format!(
                    "range addr={addr:#x} len={len} is not inside registered memory"
                )));
            }
        }
        Ok(MemAccess { _guard: guard })
    }
}

/// Proof that a set of spans was validated against the registry.
///
/// Copy helpers must only be called with spans that were passed to
/// [`MemRegistry::access`] when the guard was created.
pub struct MemAccess<'a> {
    _guard: RwLockReadGuard<'a, RegistryInner>,
}

impl MemAccess<'_> {
    /// Append `len` bytes read from `addr` to `out`.
    pub fn gather(&self, addr: u64, len: u64, out: &mut BytesMut) {
        // SAFETY: the span was validated against a live registration and the
        // registration cannot go away while the read guard is held. The
        // registrant guaranteed the region stays mapped while registered.
        let src = unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
        out.extend_from_slice(src);
    }

    /// Write `data` to `addr`.
    pub fn scatter(&self, addr: u64, data: &[u8]) {
        // SAFETY: see `gather`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
    }
}

/// Whether `[addr, addr + len)` lies inside one of `segments`.
pub fn segments_cover(segments: &[SegmentInfo], addr: u64, len: u64) -> bool {
    let Some(end) = addr.checked_add(len) else {
        return false;
    };
    segments
        .iter()
        .any(|seg| addr >= seg.addr && end <= seg.addr.saturating_add(seg.len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_null_and_empty_regions() {
        let registry = MemRegistry::new();
        assert!(matches!(
            registry.register(MemDesc::new(0, 16), MemType::Host),
            Err(TransferError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.register(MemDesc::new(0x1000, 0), MemType::Host),
            Err(TransferError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.register(MemDesc::new(u64::MAX - 1, 16), MemType::Host),
            Err(TransferError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_refcounted() {
        let registry = MemRegistry::new();
        let desc = MemDesc::new(0x1000, 0x100);
        let a = registry.register(desc, MemType::Host).unwrap();
        let b = registry.register(desc, MemType::Host).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);

        registry.deregister(a);
        assert_eq!(registry.len(), 1);
        registry.deregister(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn overlap_only_conflicts_within_same_type() {
        let registry = MemRegistry::new();
        registry
            .register(MemDesc::new(0x1000, 0x100), MemType::Host)
            .unwrap();

        let err = registry
            .register(MemDesc::new(0x10f0, 0x100), MemType::Host)
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));

        registry
            .register(MemDesc::new(0x10f0, 0x100), MemType::Device)
            .unwrap();
        // Adjacent is not overlapping.
        registry
            .register(MemDesc::new(0x1100, 0x100), MemType::Host)
            .unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unknown_handle_deregister_is_ignored() {
        let registry = MemRegistry::new();
        registry.deregister(MemHandle(77));
        assert!(registry.is_empty());
    }

    #[test]
    fn access_validates_every_span() {
        let registry = MemRegistry::new();
        registry
            .register(MemDesc::new(0x1000, 0x100), MemType::Host)
            .unwrap();
        registry
            .register(MemDesc::new(0x1100, 0x100), MemType::Host)
            .unwrap();

        assert!(registry.access([(0x1000, 0x100), (0x1180, 0x80)]).is_ok());
        // Straddles two regions.
        assert!(registry.access([(0x10f0, 0x20)]).is_err());
        assert!(registry.access([(0x0, 0x10)]).is_err());
        assert!(registry.access([(0x1000, u64::MAX)]).is_err());
    }

    #[test]
    fn find_by_addr_and_segments() {
        let registry = MemRegistry::new();
        let handle = registry
            .register(MemDesc::new(0x2000, 0x40), MemType::Device)
            .unwrap();
        assert_eq!(registry.find_by_addr(0x2000), Some(handle));
        assert_eq!(registry.find_by_addr(0x2001), None);

        let segments = registry.segments();
        assert_eq!(segments.len(), 1);
        assert!(segments_cover(&segments, 0x2010, 0x30));
        assert!(!segments_cover(&segments, 0x2010, 0x31));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn gather_and_scatter_copy_registered_memory() {
        let mut buf = vec![0u8; 64];
        let addr = buf.as_mut_ptr() as u64;
        let registry = MemRegistry::new();
        registry
            .register(MemDesc::new(addr, 64), MemType::Host)
            .unwrap();

        {
            let access = registry.access([(addr + 8, 4)]).unwrap();
            access.scatter(addr + 8, &[1, 2, 3, 4]);
            let mut out = BytesMut::new();
            access.gather(addr + 8, 4, &mut out);
            assert_eq!(&out[..], &[1, 2, 3, 4]);
        }
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
    }
}
