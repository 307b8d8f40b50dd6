//! Anonymous host memory mappings backing registered segments.
//!
//! Two page strategies are available:
//!
//! 1. **Regular pages** (`HostMemory::map`): plain `mmap(MAP_ANONYMOUS)`.
//! 2. **Huge pages** (`HostMemory::map_hugepages`): `mmap(MAP_HUGETLB)`, which
//!    needs huge pages reserved up front:
//!    ```bash
//!    sudo sh -c 'echo 1024 > /proc/sys/vm/nr_hugepages'
//!    ```
//!
//! Mappings can optionally be locked (`mlock`) so the kernel never pages them
//! out while peers are reading them.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

use log::warn;

static HUGE_PAGE_SIZE: OnceLock<Option<usize>> = OnceLock::new();

/// Default huge page size in bytes, read once from /proc/meminfo.
pub fn huge_page_size() -> Option<usize> {
    *HUGE_PAGE_SIZE.get_or_init(|| {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_hugepage_size(&content))
    })
}

// Format: "Hugepagesize:       2048 kB"
fn parse_hugepage_size(meminfo: &str) -> Option<usize> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("Hugepagesize:"))?;
    let mut parts = line.split_whitespace().skip(1);
    let kb: usize = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") => Some(kb * 1024),
        _ => None,
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[derive(Debug)]
pub enum HostMemError {
    /// mmap failed
    MmapFailed(io::Error),
    /// mlock failed (RLIMIT_MEMLOCK too low?)
    LockFailed(io::Error),
    /// Size must be greater than zero
    ZeroSize,
    /// Failed to determine huge page size from /proc/meminfo
    HugePageSizeUnavailable,
}

impl std::fmt::Display for HostMemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MmapFailed(e) => write!(f, "mmap failed: {}", e),
            Self::LockFailed(e) => write!(f, "mlock failed: {}", e),
            Self::ZeroSize => write!(f, "size must be greater than zero"),
            Self::HugePageSizeUnavailable => write!(
                f,
                "cannot determine huge page size: Hugepagesize not found in /proc/meminfo"
            ),
        }
    }
}

impl std::error::Error for HostMemError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Regular,
    HugePages,
}

/// RAII wrapper around an anonymous mapping. Unmapped on drop.
#[derive(Debug)]
pub struct HostMemory {
    ptr: NonNull<u8>,
    size: usize,
    kind: PageKind,
    locked: bool,
}

// SAFETY: HostMemory exclusively owns the mapping; the pointer stays valid
// until drop and the memory can be touched from any thread.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Map `size` bytes (rounded up to the page size) of zeroed memory.
    pub fn map(size: usize, lock: bool) -> Result<Self, HostMemError> {
        Self::map_internal(size, PageKind::Regular, lock)
    }

    /// Map `size` bytes backed by huge pages.
    ///
    /// Fails with `MmapFailed` if not enough huge pages are reserved.
    pub fn map_hugepages(size: usize, lock: bool) -> Result<Self, HostMemError> {
        Self::map_internal(size, PageKind::HugePages, lock)
    }

    fn map_internal(size: usize, kind: PageKind, lock: bool) -> Result<Self, HostMemError> {
        if size == 0 {
            return Err(HostMemError::ZeroSize);
        }

        let (page, extra_flags) = match kind {
            PageKind::Regular => (page_size(), 0),
            PageKind::HugePages => (
                huge_page_size().ok_or(HostMemError::HugePageSizeUnavailable)?,
                libc::MAP_HUGETLB,
            ),
        };
        let aligned = size.div_ceil(page) * page;

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HostMemError::MmapFailed(io::Error::last_os_error()));
        }

        if lock {
            // SAFETY: ptr/aligned describe the mapping created above.
            if unsafe { libc::mlock(ptr, aligned) } != 0 {
                let err = io::Error::last_os_error();
                // SAFETY: same mapping, not yet handed out.
                unsafe { libc::munmap(ptr, aligned) };
                return Err(HostMemError::LockFailed(err));
            }
        }

        let Some(ptr) = NonNull::new(ptr as *mut u8) else {
            return Err(HostMemError::MmapFailed(io::Error::other(
                "mmap returned null",
            )));
        };

        Ok(Self {
            ptr,
            size: aligned,
            kind,
            locked: lock,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Mapped size, which may exceed the requested size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        self.kind
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let ptr = self.ptr.as_ptr() as *mut libc::c_void;
        if self.locked {
            // SAFETY: the range was locked in map_internal.
            unsafe { libc::munlock(ptr, self.size) };
        }
        // SAFETY: ptr was returned by mmap with exactly this size.
        if unsafe { libc::munmap(ptr, self.size) } == -1 {
            warn!(
                "munmap failed: addr={:#x} size={} err={}",
                self.addr(),
                self.size,
                io::Error::last_os_error()
            );
        }
    }
}
