//! Native allocation primitives
//!
//! Thin adapters over the platform's raw allocator. They never cache; the
//! [`MemoryManager`](crate::memory::MemoryManager) owns all reuse policy.

use std::ptr;

use crate::error::{MemError, MemResult};
use crate::memory::DevicePtr;

/// Raw allocate/free primitive for one kind of memory
pub trait NativeAllocator: Send + Sync {
    /// Allocate exactly `bytes` bytes
    fn alloc(&self, bytes: usize) -> MemResult<DevicePtr>;

    /// Release a pointer previously returned by [`alloc`](Self::alloc)
    ///
    /// `bytes` is the size that was passed to `alloc`.
    fn free(&self, ptr: DevicePtr, bytes: usize) -> MemResult<()>;

    /// Short name for logs and reports
    fn name(&self) -> &'static str;
}

/// Host heap allocator (`malloc` / `free`)
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl HostAllocator {
    pub fn new() -> Self {
        HostAllocator
    }
}

impl NativeAllocator for HostAllocator {
    fn alloc(&self, bytes: usize) -> MemResult<DevicePtr> {
        tracing::trace!("HostAllocator::alloc: malloc({})", bytes);
        let raw = unsafe { libc::malloc(bytes) };
        DevicePtr::from_raw(raw).ok_or_else(|| {
            tracing::error!("HostAllocator::alloc: malloc returned null for {} bytes", bytes);
            MemError::out_of_memory(0, bytes, "malloc returned null")
        })
    }

    fn free(&self, ptr: DevicePtr, _bytes: usize) -> MemResult<()> {
        tracing::trace!("HostAllocator::free: free({})", ptr);
        unsafe { libc::free(ptr.as_ptr()) };
        Ok(())
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

/// Page-aligned, page-locked host allocator
///
/// Memory comes from `posix_memalign` and is pinned with `mlock`. Pinning is
/// best effort: when `RLIMIT_MEMLOCK` refuses it the buffer is still handed
/// out unpinned and a warning is logged.
#[derive(Debug, Clone, Copy)]
pub struct PinnedHostAllocator {
    alignment: usize,
}

impl Default for PinnedHostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PinnedHostAllocator {
    /// Fallback when `sysconf(_SC_PAGESIZE)` fails
    const DEFAULT_PAGE_SIZE: usize = 4096;

    pub fn new() -> Self {
        PinnedHostAllocator {
            alignment: page_size(),
        }
    }

    /// Alignment of every returned pointer
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl NativeAllocator for PinnedHostAllocator {
    fn alloc(&self, bytes: usize) -> MemResult<DevicePtr> {
        let mut raw: *mut libc::c_void = ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut raw, self.alignment, bytes) };
        if rc != 0 {
            tracing::error!(
                "PinnedHostAllocator::alloc: posix_memalign failed with code {} for {} bytes",
                rc,
                bytes
            );
            return Err(MemError::out_of_memory(
                0,
                bytes,
                format!("posix_memalign failed with code {}", rc),
            ));
        }
        let ptr = DevicePtr::from_raw(raw)
            .ok_or_else(|| MemError::out_of_memory(0, bytes, "posix_memalign returned null"))?;

        if unsafe { libc::mlock(ptr.as_ptr(), bytes) } != 0 {
            tracing::warn!(
                "PinnedHostAllocator::alloc: mlock of {} bytes at {} refused ({}); buffer is not pinned",
                bytes,
                ptr,
                std::io::Error::last_os_error()
            );
        }

        tracing::trace!("PinnedHostAllocator::alloc: {} bytes at {}", bytes, ptr);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr, bytes: usize) -> MemResult<()> {
        // munlock of an unpinned range is harmless; the result is ignored
        unsafe {
            libc::munlock(ptr.as_ptr(), bytes);
            libc::free(ptr.as_ptr());
        }
        tracing::trace!("PinnedHostAllocator::free: {} bytes at {}", bytes, ptr);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "pinned-host"
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        PinnedHostAllocator::DEFAULT_PAGE_SIZE
    }
}

/// Physical memory of the host in bytes, or 0 if it cannot be queried
pub fn host_memory_size() -> usize {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages > 0 && page > 0 {
        (pages as usize).saturating_mul(page as usize)
    } else {
        0
    }
}
