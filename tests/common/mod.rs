//! Shared fixtures for the allocator integration tests
//!
//! - [`CountingAllocator`]: host memory with call counters, a live-pointer set
//!   for double-free detection and an optional capacity
//! - [`FailingFreeAllocator`]: releases memory but reports every free as failed
//! - [`context`] / [`deferred_context`]: `MemoryContext` builders over the fakes
//!
//! Not every test binary uses every fixture.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memforge::backend::{DeferredQueue, HostAllocator, HostDevices, ImmediateQueue, NativeAllocator};
use memforge::config::MemoryConfig;
use memforge::context::MemoryContext;
use memforge::error::{MemError, MemResult};
use memforge::memory::DevicePtr;

pub use serial_test::serial;

/// Memory size every fake device reports (1 GiB)
pub const DEVICE_MEMORY: usize = 1 << 30;

/// Host allocator that records every native call
#[derive(Debug, Default)]
pub struct CountingAllocator {
    inner: HostAllocator,
    capacity: Option<usize>,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    double_frees: AtomicUsize,
    live: Mutex<HashSet<usize>>,
    live_bytes: AtomicUsize,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse allocations once `capacity` bytes are outstanding
    pub fn with_capacity(capacity: usize) -> Self {
        CountingAllocator {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn double_frees(&self) -> usize {
        self.double_frees.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }
}

impl NativeAllocator for CountingAllocator {
    fn alloc(&self, bytes: usize) -> MemResult<DevicePtr> {
        let mut live = self.live.lock()?;
        if let Some(capacity) = self.capacity {
            if self.live_bytes() + bytes > capacity {
                return Err(MemError::out_of_memory(0, bytes, "fake device exhausted"));
            }
        }
        let ptr = self.inner.alloc(bytes)?;
        live.insert(ptr.addr());
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr, bytes: usize) -> MemResult<()> {
        let mut live = self.live.lock()?;
        if !live.remove(&ptr.addr()) {
            self.double_frees.fetch_add(1, Ordering::SeqCst);
            return Err(MemError::DeviceError(format!("{} freed twice", ptr)));
        }
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
        self.inner.free(ptr, bytes)
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Host allocator whose frees release the memory but report failure
#[derive(Debug, Default)]
pub struct FailingFreeAllocator {
    inner: HostAllocator,
    free_attempts: AtomicUsize,
}

impl FailingFreeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free_attempts(&self) -> usize {
        self.free_attempts.load(Ordering::SeqCst)
    }
}

impl NativeAllocator for FailingFreeAllocator {
    fn alloc(&self, bytes: usize) -> MemResult<DevicePtr> {
        self.inner.alloc(bytes)
    }

    fn free(&self, ptr: DevicePtr, bytes: usize) -> MemResult<()> {
        self.free_attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.free(ptr, bytes)?;
        Err(MemError::DeviceError("injected free failure".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing-free"
    }
}

/// Context over `allocator` for both device and pinned memory, inline queue
pub fn context(
    config: MemoryConfig,
    allocator: Arc<CountingAllocator>,
    device_count: usize,
) -> (MemoryContext, Arc<HostDevices>) {
    let devices = Arc::new(HostDevices::with_memory_size(device_count, DEVICE_MEMORY));
    let ctx = MemoryContext::with_allocators(
        config,
        allocator,
        Arc::new(CountingAllocator::new()),
        Arc::new(ImmediateQueue),
        devices.clone(),
    )
    .expect("context construction");
    (ctx, devices)
}

/// Context over `allocator` whose queue holds jobs until synced
pub fn deferred_context(
    config: MemoryConfig,
    allocator: Arc<CountingAllocator>,
) -> (MemoryContext, Arc<DeferredQueue>) {
    let queue = Arc::new(DeferredQueue::new());
    let ctx = MemoryContext::with_allocators(
        config,
        allocator,
        Arc::new(CountingAllocator::new()),
        queue.clone(),
        Arc::new(HostDevices::with_memory_size(1, DEVICE_MEMORY)),
    )
    .expect("context construction");
    (ctx, queue)
}
