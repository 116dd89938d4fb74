//! Device enumeration and active-device tracking
//!
//! The active device is PER-THREAD, the same way a HIP/CUDA device context
//! is: setting it on one thread does not affect any other thread. The memory
//! manager asks the context which device's registry an operation addresses.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread_local;

use crate::backend::native::host_memory_size;
use crate::error::{MemError, MemResult};

/// Device enumeration and selection, as consumed by the allocator
pub trait DeviceContext: Send + Sync {
    /// Number of devices
    fn device_count(&self) -> usize;

    /// Device selected on the calling thread
    fn active_device(&self) -> usize;

    /// Select `device` on the calling thread
    fn set_active_device(&self, device: usize) -> MemResult<()>;

    /// Total memory of `device` in bytes (0 if unknown)
    fn device_memory_size(&self, device: usize) -> usize;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Active device per (thread, context instance)
    static THREAD_DEVICE: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

/// Logical host devices backed by system memory
///
/// Every device reports the full physical memory of the host unless an
/// explicit size is given.
#[derive(Debug)]
pub struct HostDevices {
    id: u64,
    count: usize,
    memory_size: usize,
}

impl HostDevices {
    /// `count` logical devices sized from the host's physical memory
    pub fn new(count: usize) -> Self {
        Self::with_memory_size(count, host_memory_size())
    }

    /// `count` logical devices each reporting `memory_size` bytes
    ///
    /// A count of 0 is kept as is; `MemoryManager::new` rejects it.
    pub fn with_memory_size(count: usize, memory_size: usize) -> Self {
        HostDevices {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            count,
            memory_size,
        }
    }
}

/// Only the dropping thread's selection can be cleared; entries left on other
/// threads are reclaimed when those threads exit.
impl Drop for HostDevices {
    fn drop(&mut self) {
        // try_with: the thread-local may already be gone during thread exit
        let _ = THREAD_DEVICE.try_with(|map| {
            map.borrow_mut().remove(&self.id);
        });
    }
}

impl Default for HostDevices {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DeviceContext for HostDevices {
    fn device_count(&self) -> usize {
        self.count
    }

    fn active_device(&self) -> usize {
        THREAD_DEVICE.with(|map| map.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn set_active_device(&self, device: usize) -> MemResult<()> {
        if device >= self.count {
            return Err(MemError::InvalidDevice(device));
        }
        THREAD_DEVICE.with(|map| {
            let prev = map.borrow_mut().insert(self.id, device);
            if prev != Some(device) {
                tracing::trace!("HostDevices: thread now on device {}", device);
            }
        });
        Ok(())
    }

    fn device_memory_size(&self, device: usize) -> usize {
        if device < self.count {
            self.memory_size
        } else {
            0
        }
    }
}
