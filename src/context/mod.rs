//! Backend memory context
//!
//! [`MemoryContext`] is what the rest of a compute backend holds: it owns the
//! device memory manager, the pinned host manager, the execution queue and
//! the device context, and exposes the caller-facing allocation surface.
//!
//! # Retry policy
//!
//! `mem_alloc`, `mem_alloc_user` and `pinned_alloc` try the manager once. If
//! that fails with `OutOfMemory`, the queue is synchronized so releases held
//! by in-flight work can land, and the allocation is retried exactly once.
//! The manager lock is never held across the sync.
//!
//! # Usage
//!
//! ```rust
//! use memforge::config::MemoryConfig;
//! use memforge::context::MemoryContext;
//!
//! let ctx = MemoryContext::host(MemoryConfig::new().with_step_bytes(256))?;
//!
//! let data = ctx.mem_alloc::<f32>(64)?;
//! ctx.mem_free(data)?;
//!
//! // Same size class: served from the free list
//! let again = ctx.mem_alloc::<f32>(48)?;
//! assert_eq!(again.device_ptr(), data.device_ptr());
//! ctx.mem_free(again)?;
//! # Ok::<(), memforge::MemError>(())
//! ```

use std::sync::Arc;

use crate::backend::{
    DeviceContext, HostAllocator, HostDevices, ImmediateQueue, NativeAllocator,
    PinnedHostAllocator, Queue,
};
use crate::config::MemoryConfig;
use crate::error::{MemError, MemResult};
use crate::memory::{BufferInfo, DevicePtr, GcReport, MemoryManager, TypedPtr};

/// Caller-facing memory surface of a compute backend
#[derive(Clone)]
pub struct MemoryContext {
    manager: Arc<MemoryManager>,
    pinned: Arc<MemoryManager>,
    queue: Arc<dyn Queue>,
    devices: Arc<dyn DeviceContext>,
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("manager", &self.manager)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl MemoryContext {
    /// Host-memory context: one device, inline queue
    pub fn host(config: MemoryConfig) -> MemResult<Self> {
        Self::with_queue(config, Arc::new(ImmediateQueue), Arc::new(HostDevices::default()))
    }

    /// Host allocators with a caller-supplied queue and device context
    pub fn with_queue(
        config: MemoryConfig,
        queue: Arc<dyn Queue>,
        devices: Arc<dyn DeviceContext>,
    ) -> MemResult<Self> {
        Self::with_allocators(
            config,
            Arc::new(HostAllocator::new()),
            Arc::new(PinnedHostAllocator::new()),
            queue,
            devices,
        )
    }

    /// Fully explicit construction
    pub fn with_allocators(
        config: MemoryConfig,
        allocator: Arc<dyn NativeAllocator>,
        pinned_allocator: Arc<dyn NativeAllocator>,
        queue: Arc<dyn Queue>,
        devices: Arc<dyn DeviceContext>,
    ) -> MemResult<Self> {
        let manager = MemoryManager::new(config.clone(), allocator, devices.clone())?;
        let pinned = MemoryManager::new(config, pinned_allocator, devices.clone())?;
        Ok(MemoryContext {
            manager: Arc::new(manager),
            pinned: Arc::new(pinned),
            queue,
            devices,
        })
    }

    /// Device memory manager
    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// Pinned host memory manager
    pub fn pinned_manager(&self) -> &Arc<MemoryManager> {
        &self.pinned
    }

    /// Execution queue
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Device context
    pub fn devices(&self) -> &Arc<dyn DeviceContext> {
        &self.devices
    }

    fn alloc_with_retry(&self, manager: &MemoryManager, bytes: usize, user: bool) -> MemResult<DevicePtr> {
        match manager.alloc(bytes, user) {
            Err(e) if e.is_out_of_memory() => {
                tracing::debug!(
                    "MemoryContext: {} allocation of {} bytes failed ({}), syncing queue and retrying",
                    manager.allocator_name(),
                    bytes,
                    e
                );
                self.queue.sync()?;
                manager.alloc(bytes, user).map_err(|e| {
                    if e.is_out_of_memory() {
                        tracing::error!(
                            "MemoryContext: {} allocation of {} bytes failed after sync: {}",
                            manager.allocator_name(),
                            bytes,
                            e
                        );
                    }
                    e
                })
            }
            other => other,
        }
    }

    // ========== Configuration ==========

    /// Set the size-class granularity of both managers
    pub fn set_mem_step_size(&self, step_bytes: usize) -> MemResult<()> {
        self.manager.set_mem_step_size(step_bytes)?;
        self.pinned.set_mem_step_size(step_bytes)
    }

    /// Current size-class granularity
    pub fn mem_step_size(&self) -> MemResult<usize> {
        self.manager.mem_step_size()
    }

    /// Byte ceiling of the active device
    pub fn max_bytes(&self) -> MemResult<usize> {
        self.manager.max_bytes()
    }

    /// Buffer-count ceiling
    pub fn max_buffers(&self) -> MemResult<usize> {
        self.manager.max_buffers()
    }

    /// Release every free buffer held by either manager
    ///
    /// Both managers are always collected; if either reports a native free
    /// failure, the first one is returned after both passes have run.
    pub fn garbage_collect(&self) -> MemResult<GcReport> {
        let device = self.manager.garbage_collect();
        let pinned = self.pinned.garbage_collect();
        match (device, pinned) {
            (Ok(mut report), Ok(pinned)) => {
                report.merge(pinned);
                Ok(report)
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    /// Buffer tables of `device` for device memory, then pinned host memory
    pub fn format_mem_info(&self, tag: &str, device: usize) -> MemResult<String> {
        let mut out = self.manager.format_info(tag, device)?;
        out.push_str(&self.pinned.format_info(tag, device)?);
        Ok(out)
    }

    /// Print [`format_mem_info`](Self::format_mem_info) to stdout
    pub fn print_mem_info(&self, tag: &str, device: usize) -> MemResult<()> {
        let tables = self.format_mem_info(tag, device)?;
        tracing::debug!("{}", tables);
        println!("{}", tables);
        Ok(())
    }

    // ========== Device Memory ==========

    /// Typed internal allocation of `count` elements
    pub fn mem_alloc<T>(&self, count: usize) -> MemResult<TypedPtr<T>> {
        let bytes = typed_bytes::<T>(count)?;
        Ok(self.alloc_with_retry(&self.manager, bytes, false)?.cast())
    }

    /// Untyped user-visible allocation
    pub fn mem_alloc_user(&self, bytes: usize) -> MemResult<DevicePtr> {
        self.alloc_with_retry(&self.manager, bytes, true)
    }

    /// Release a [`mem_alloc`](Self::mem_alloc) allocation
    pub fn mem_free<T>(&self, ptr: TypedPtr<T>) -> MemResult<()> {
        self.manager.unlock(ptr.device_ptr(), false)
    }

    /// Release a [`mem_alloc_user`](Self::mem_alloc_user) allocation
    pub fn mem_free_user(&self, ptr: DevicePtr) -> MemResult<()> {
        self.manager.unlock(ptr, true)
    }

    /// Pin a buffer
    pub fn mem_lock(&self, ptr: DevicePtr) -> MemResult<()> {
        self.manager.user_lock(ptr)
    }

    /// Whether a buffer is pinned
    pub fn is_locked(&self, ptr: DevicePtr) -> MemResult<bool> {
        self.manager.is_user_locked(ptr)
    }

    /// Unpin a buffer
    pub fn mem_unlock(&self, ptr: DevicePtr) -> MemResult<()> {
        self.manager.user_unlock(ptr)
    }

    /// Usage of `device` after all pending work has retired
    pub fn device_memory_info(&self, device: usize) -> MemResult<BufferInfo> {
        self.queue.sync()?;
        self.manager.buffer_info(device)
    }

    /// Whether the active device is within its ceilings
    pub fn check_memory_limit(&self) -> MemResult<bool> {
        self.manager.check_memory_limit()
    }

    // ========== Pinned Host Memory ==========

    /// Typed pinned host allocation of `count` elements
    pub fn pinned_alloc<T>(&self, count: usize) -> MemResult<TypedPtr<T>> {
        let bytes = typed_bytes::<T>(count)?;
        Ok(self.alloc_with_retry(&self.pinned, bytes, false)?.cast())
    }

    /// Release a [`pinned_alloc`](Self::pinned_alloc) allocation
    pub fn pinned_free<T>(&self, ptr: TypedPtr<T>) -> MemResult<()> {
        self.pinned.unlock(ptr.device_ptr(), false)
    }

    // ========== Teardown ==========

    /// Release every free buffer of both managers on every device
    pub fn teardown(&self) {
        self.manager.teardown();
        self.pinned.teardown();
    }
}

fn typed_bytes<T>(count: usize) -> MemResult<usize> {
    count.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
        MemError::InvalidConfiguration(format!(
            "{} elements of {} overflow usize",
            count,
            std::any::type_name::<T>()
        ))
    })
}
