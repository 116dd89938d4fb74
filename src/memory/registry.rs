//! Per-device buffer registry and size-class free lists
//!
//! Pure bookkeeping, no policy. Every state change goes through
//! [`DeviceMemory::transition`] so free-list membership and the byte/buffer
//! tallies can never drift apart:
//!
//! - a buffer is in exactly one free-list bucket iff its state is `Free`
//! - `total_*` counts every registered buffer
//! - `in_use_*` counts `Active` and `UserLocked` buffers
//! - `lock_*` counts `UserLocked` buffers

use std::collections::HashMap;

use super::buffer::{Buffer, BufferState, DevicePtr};

/// Allocation and reuse counters for one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub native_allocs: u64,
    pub native_frees: u64,
    pub reuse_hits: u64,
    pub gc_runs: u64,
}

/// Bookkeeping for every buffer the manager owns on one device
#[derive(Debug)]
pub struct DeviceMemory {
    /// All known buffers, free or not
    registry: HashMap<DevicePtr, Buffer>,
    /// Free buffers keyed by size class
    free_lists: HashMap<usize, Vec<DevicePtr>>,
    /// Byte ceiling for this device
    pub(crate) max_bytes: usize,
    total_bytes: usize,
    total_buffers: usize,
    in_use_bytes: usize,
    in_use_buffers: usize,
    lock_bytes: usize,
    lock_buffers: usize,
    pub(crate) counters: DeviceCounters,
}

impl DeviceMemory {
    pub fn new(max_bytes: usize) -> Self {
        DeviceMemory {
            registry: HashMap::new(),
            free_lists: HashMap::new(),
            max_bytes,
            total_bytes: 0,
            total_buffers: 0,
            in_use_bytes: 0,
            in_use_buffers: 0,
            lock_bytes: 0,
            lock_buffers: 0,
            counters: DeviceCounters::default(),
        }
    }

    /// Look up a tracked buffer
    pub fn get(&self, ptr: &DevicePtr) -> Option<&Buffer> {
        self.registry.get(ptr)
    }

    /// Register a freshly allocated buffer (state `Active`)
    pub fn insert(&mut self, buffer: Buffer) {
        debug_assert_eq!(buffer.state, BufferState::Active);
        debug_assert!(!self.registry.contains_key(&buffer.ptr));

        self.total_bytes += buffer.size_class;
        self.total_buffers += 1;
        self.in_use_bytes += buffer.size_class;
        self.in_use_buffers += 1;
        self.registry.insert(buffer.ptr, buffer);
    }

    /// Pop any free buffer of `size_class` and mark it `Active`
    pub fn pop_free(&mut self, size_class: usize, user: bool) -> Option<DevicePtr> {
        let ptr = *self.free_lists.get(&size_class)?.last()?;
        self.transition(&ptr, BufferState::Active);
        if let Some(buffer) = self.registry.get_mut(&ptr) {
            buffer.user = user;
        }
        Some(ptr)
    }

    /// Move a tracked buffer to `next`, keeping free lists and tallies in step
    ///
    /// Returns the previous state, or `None` if the pointer is not tracked.
    pub fn transition(&mut self, ptr: &DevicePtr, next: BufferState) -> Option<BufferState> {
        let buffer = self.registry.get_mut(ptr)?;
        let prev = buffer.state;
        if prev == next {
            return Some(prev);
        }
        let size = buffer.size_class;
        buffer.state = next;

        match prev {
            BufferState::Free => {
                if let Some(bucket) = self.free_lists.get_mut(&size) {
                    // Reuse pops from the back, so search from there
                    if let Some(pos) = bucket.iter().rposition(|p| p == ptr) {
                        bucket.swap_remove(pos);
                    }
                    if bucket.is_empty() {
                        self.free_lists.remove(&size);
                    }
                }
                self.in_use_bytes += size;
                self.in_use_buffers += 1;
            }
            BufferState::UserLocked => {
                self.lock_bytes -= size;
                self.lock_buffers -= 1;
            }
            BufferState::Active => {}
        }

        match next {
            BufferState::Free => {
                self.free_lists.entry(size).or_default().push(*ptr);
                self.in_use_bytes -= size;
                self.in_use_buffers -= 1;
            }
            BufferState::UserLocked => {
                self.lock_bytes += size;
                self.lock_buffers += 1;
            }
            BufferState::Active => {}
        }

        Some(prev)
    }

    /// Unregister a buffer entirely, whatever its state
    pub fn remove(&mut self, ptr: &DevicePtr) -> Option<Buffer> {
        // Route through Free first so the in-use and lock tallies unwind
        self.transition(ptr, BufferState::Free)?;
        let buffer = self.registry.remove(ptr)?;
        if let Some(bucket) = self.free_lists.get_mut(&buffer.size_class) {
            if let Some(pos) = bucket.iter().rposition(|p| p == ptr) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                self.free_lists.remove(&buffer.size_class);
            }
        }
        self.total_bytes -= buffer.size_class;
        self.total_buffers -= 1;
        Some(buffer)
    }

    /// Unregister every free buffer and hand them back for native release
    pub fn drain_free(&mut self) -> Vec<Buffer> {
        let ptrs: Vec<DevicePtr> = self.free_lists.drain().flat_map(|(_, v)| v).collect();
        let mut drained = Vec::with_capacity(ptrs.len());
        for ptr in ptrs {
            if let Some(buffer) = self.registry.remove(&ptr) {
                self.total_bytes -= buffer.size_class;
                self.total_buffers -= 1;
                drained.push(buffer);
            }
        }
        drained
    }

    /// Iterate every tracked buffer
    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.registry.values()
    }

    /// Number of buffers waiting in free lists
    pub fn free_buffers(&self) -> usize {
        self.free_lists.values().map(Vec::len).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_buffers(&self) -> usize {
        self.total_buffers
    }

    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes
    }

    pub fn in_use_buffers(&self) -> usize {
        self.in_use_buffers
    }

    pub fn lock_bytes(&self) -> usize {
        self.lock_bytes
    }

    pub fn lock_buffers(&self) -> usize {
        self.lock_buffers
    }
}
