//! Caching memory manager
//!
//! Recycles released buffers by size class instead of round-tripping through
//! the native allocator on every request, enforces per-device byte and
//! buffer ceilings, and tracks user pins that exempt a buffer from reuse and
//! garbage collection.
//!
//! # Locking
//!
//! One coarse mutex guards every device's registry, free lists, tallies, the
//! step size and the ceilings. Every public operation holds it for its full
//! duration, and native alloc/free calls happen under it, so two threads can
//! never race on the same pointer's lifecycle. The manager never waits on the
//! execution queue; sync-and-retry lives in
//! [`MemoryContext`](crate::context::MemoryContext).

use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{DeviceContext, NativeAllocator};
use crate::config::MemoryConfig;
use crate::error::{MemError, MemResult};

use super::buffer::{size_class, Buffer, BufferState, DevicePtr};
use super::registry::DeviceMemory;
use super::stats::{render_table, BufferInfo, GcReport, MemoryStats};

/// Everything guarded by the manager lock
#[derive(Debug)]
struct ManagerState {
    step_bytes: usize,
    max_buffers: usize,
    debug_mode: bool,
    devices: Vec<DeviceMemory>,
}

impl ManagerState {
    /// Device whose registry tracks `ptr`; the active device is checked first
    fn locate(&self, ptr: &DevicePtr, active: usize) -> Option<usize> {
        if self.devices.get(active).and_then(|m| m.get(ptr)).is_some() {
            return Some(active);
        }
        self.devices.iter().position(|m| m.get(ptr).is_some())
    }

    fn device_mut(&mut self, device: usize) -> MemResult<&mut DeviceMemory> {
        self.devices
            .get_mut(device)
            .ok_or(MemError::InvalidDevice(device))
    }

    fn device(&self, device: usize) -> MemResult<&DeviceMemory> {
        self.devices.get(device).ok_or(MemError::InvalidDevice(device))
    }

    fn exceeds_ceiling(&self, device: usize, size: usize) -> bool {
        let mem = &self.devices[device];
        mem.total_buffers() + 1 > self.max_buffers
            || mem.total_bytes().saturating_add(size) > mem.max_bytes
    }
}

/// Caching allocator over one native allocation primitive
pub struct MemoryManager {
    allocator: Arc<dyn NativeAllocator>,
    devices: Arc<dyn DeviceContext>,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("allocator", &self.allocator.name())
            .field("devices", &self.devices.device_count())
            .finish()
    }
}

impl MemoryManager {
    /// Create a manager with one registry per device of `devices`
    pub fn new(
        config: MemoryConfig,
        allocator: Arc<dyn NativeAllocator>,
        devices: Arc<dyn DeviceContext>,
    ) -> MemResult<Self> {
        config.validate()?;
        if devices.device_count() == 0 {
            return Err(MemError::InvalidConfiguration(
                "device context reports no devices".to_string(),
            ));
        }

        let per_device = (0..devices.device_count())
            .map(|d| DeviceMemory::new(config.max_bytes_for(devices.device_memory_size(d))))
            .collect::<Vec<_>>();

        tracing::debug!(
            "MemoryManager::new: {} allocator, {} devices, step={} max_buffers={} debug={}",
            allocator.name(),
            per_device.len(),
            config.step_bytes,
            config.max_buffers,
            config.debug_mode
        );

        Ok(MemoryManager {
            allocator,
            devices,
            state: Mutex::new(ManagerState {
                step_bytes: config.step_bytes,
                max_buffers: config.max_buffers,
                debug_mode: config.debug_mode,
                devices: per_device,
            }),
        })
    }

    fn lock(&self) -> MemResult<MutexGuard<'_, ManagerState>> {
        Ok(self.state.lock()?)
    }

    fn active_device(&self, state: &ManagerState) -> MemResult<usize> {
        let device = self.devices.active_device();
        if device < state.devices.len() {
            Ok(device)
        } else {
            Err(MemError::InvalidDevice(device))
        }
    }

    /// Name of the native allocator this manager wraps
    pub fn allocator_name(&self) -> &'static str {
        self.allocator.name()
    }

    /// Number of devices this manager keeps registries for
    pub fn device_count(&self) -> usize {
        self.devices.device_count()
    }

    // ========== Configuration ==========

    /// Change the size-class granularity; existing buffers keep their class
    pub fn set_mem_step_size(&self, step_bytes: usize) -> MemResult<()> {
        if step_bytes == 0 {
            return Err(MemError::InvalidConfiguration(
                "step size must be greater than zero".to_string(),
            ));
        }
        let mut state = self.lock()?;
        tracing::debug!("MemoryManager: step size {} -> {}", state.step_bytes, step_bytes);
        state.step_bytes = step_bytes;
        Ok(())
    }

    /// Current size-class granularity
    pub fn mem_step_size(&self) -> MemResult<usize> {
        Ok(self.lock()?.step_bytes)
    }

    /// Byte ceiling of the active device
    pub fn max_bytes(&self) -> MemResult<usize> {
        let state = self.lock()?;
        let device = self.active_device(&state)?;
        Ok(state.devices[device].max_bytes)
    }

    /// Set the byte ceiling of `device`
    pub fn set_max_bytes(&self, device: usize, max_bytes: usize) -> MemResult<()> {
        let mut state = self.lock()?;
        state.device_mut(device)?.max_bytes = max_bytes;
        Ok(())
    }

    /// Buffer-count ceiling (shared by all devices)
    pub fn max_buffers(&self) -> MemResult<usize> {
        Ok(self.lock()?.max_buffers)
    }

    /// Set the buffer-count ceiling
    pub fn set_max_buffers(&self, max_buffers: usize) -> MemResult<()> {
        self.lock()?.max_buffers = max_buffers;
        Ok(())
    }

    // ========== Allocation ==========

    /// Allocate at least `bytes` bytes on the active device
    ///
    /// Reuses a free buffer of the same size class when one exists. On a miss
    /// the ceilings are checked (garbage-collecting first if they would be
    /// exceeded) before the native allocator is asked. Fails with
    /// `OutOfMemory` without retrying; a failed call leaves no trace in the
    /// registry or the accounting.
    pub fn alloc(&self, bytes: usize, user: bool) -> MemResult<DevicePtr> {
        let mut state = self.lock()?;
        let device = self.active_device(&state)?;
        let size = size_class(bytes, state.step_bytes).ok_or_else(|| {
            MemError::InvalidConfiguration(format!("allocation of {} bytes overflows", bytes))
        })?;

        if !state.debug_mode {
            let mem = &mut state.devices[device];
            if let Some(ptr) = mem.pop_free(size, user) {
                mem.counters.reuse_hits += 1;
                tracing::trace!(
                    "MemoryManager::alloc: reused {} ({} bytes, class {}) on device {}",
                    ptr,
                    bytes,
                    size,
                    device
                );
                return Ok(ptr);
            }
        }

        if state.exceeds_ceiling(device, size) {
            tracing::debug!(
                "MemoryManager::alloc: {} bytes on device {} would exceed limits, collecting garbage",
                size,
                device
            );
            let (report, err) = self.collect_all(&mut state);
            if let Some(e) = err {
                return Err(e);
            }
            if state.exceeds_ceiling(device, size) {
                let mem = &state.devices[device];
                tracing::debug!(
                    "MemoryManager::alloc: still over limits after releasing {} buffers \
                     (held {} bytes in {} buffers, limits {} bytes / {} buffers)",
                    report.buffers,
                    mem.total_bytes(),
                    mem.total_buffers(),
                    mem.max_bytes,
                    state.max_buffers
                );
                return Err(MemError::out_of_memory(
                    device,
                    size,
                    "memory limit reached after garbage collection",
                ));
            }
        }

        let ptr = self.allocator.alloc(size).map_err(|e| match e {
            MemError::OutOfMemory { reason, .. } => MemError::out_of_memory(device, size, reason),
            other => other,
        })?;

        let mem = &mut state.devices[device];
        mem.insert(Buffer::new(ptr, size, device, user));
        mem.counters.native_allocs += 1;
        tracing::trace!(
            "MemoryManager::alloc: new {} ({} bytes, class {}) on device {}",
            ptr,
            bytes,
            size,
            device
        );
        Ok(ptr)
    }

    /// Release a buffer back to its free list
    ///
    /// An internal release (`user == false`) of a user-locked buffer is a
    /// no-op: pinned buffers are immune to ordinary release.
    pub fn unlock(&self, ptr: DevicePtr, user: bool) -> MemResult<()> {
        let mut state = self.lock()?;
        let active = self.devices.active_device();
        let device = state.locate(&ptr, active).ok_or(MemError::InvalidPointer(ptr))?;
        let debug_mode = state.debug_mode;
        let mem = &mut state.devices[device];
        let current = mem.get(&ptr).map(|b| b.state).ok_or(MemError::InvalidPointer(ptr))?;

        match (current, user) {
            (BufferState::Free, _) => {
                tracing::error!("MemoryManager::unlock: {} is already free (double free)", ptr);
                Err(MemError::InvalidPointer(ptr))
            }
            (BufferState::UserLocked, false) => {
                tracing::debug!("MemoryManager::unlock: {} is user-locked, internal release ignored", ptr);
                Ok(())
            }
            _ if debug_mode => {
                let buffer = mem.remove(&ptr).ok_or(MemError::InvalidPointer(ptr))?;
                mem.counters.native_frees += 1;
                tracing::trace!("MemoryManager::unlock: debug mode, native free of {}", ptr);
                self.allocator.free(ptr, buffer.size_class)
            }
            _ => {
                mem.transition(&ptr, BufferState::Free);
                tracing::trace!("MemoryManager::unlock: {} returned to free list", ptr);
                Ok(())
            }
        }
    }

    // ========== User Pins ==========

    /// Pin a buffer: exempt from reuse and garbage collection
    ///
    /// Pinning a free buffer takes it out of its free list so it cannot be
    /// handed to another caller.
    pub fn user_lock(&self, ptr: DevicePtr) -> MemResult<()> {
        let mut state = self.lock()?;
        let active = self.devices.active_device();
        let device = state.locate(&ptr, active).ok_or(MemError::InvalidPointer(ptr))?;
        let mem = &mut state.devices[device];

        match mem.transition(&ptr, BufferState::UserLocked) {
            Some(BufferState::UserLocked) => Err(MemError::AlreadyLocked(ptr)),
            Some(prev) => {
                tracing::trace!("MemoryManager::user_lock: {} pinned (was {})", ptr, prev);
                Ok(())
            }
            None => Err(MemError::InvalidPointer(ptr)),
        }
    }

    /// Unpin a buffer; it returns to `Active`, still owned by its holder
    pub fn user_unlock(&self, ptr: DevicePtr) -> MemResult<()> {
        let mut state = self.lock()?;
        let active = self.devices.active_device();
        let device = state.locate(&ptr, active).ok_or(MemError::InvalidPointer(ptr))?;
        let mem = &mut state.devices[device];

        match mem.get(&ptr).map(|b| b.state) {
            Some(BufferState::UserLocked) => {
                mem.transition(&ptr, BufferState::Active);
                tracing::trace!("MemoryManager::user_unlock: {} unpinned", ptr);
                Ok(())
            }
            Some(_) => Err(MemError::NotLocked(ptr)),
            None => Err(MemError::InvalidPointer(ptr)),
        }
    }

    /// Whether `ptr` is currently pinned (`false` for untracked pointers)
    pub fn is_user_locked(&self, ptr: DevicePtr) -> MemResult<bool> {
        let state = self.lock()?;
        let active = self.devices.active_device();
        Ok(state
            .locate(&ptr, active)
            .and_then(|d| state.devices[d].get(&ptr))
            .map(|b| b.state == BufferState::UserLocked)
            .unwrap_or(false))
    }

    // ========== Garbage Collection ==========

    /// Return every free buffer on every device to the native allocator
    ///
    /// Active and user-locked buffers are untouched. A native free failure
    /// does not stop the pass; the first one is returned after every free
    /// buffer has been released and unregistered.
    pub fn garbage_collect(&self) -> MemResult<GcReport> {
        let mut state = self.lock()?;
        let (report, err) = self.collect_all(&mut state);
        match err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn collect_all(&self, state: &mut ManagerState) -> (GcReport, Option<MemError>) {
        let mut total = GcReport::default();
        let mut first_err = None;
        for (device, mem) in state.devices.iter_mut().enumerate() {
            let (report, err) = self.collect_device(device, mem);
            total.merge(report);
            if let Some(e) = err {
                first_err.get_or_insert(e);
            }
        }
        (total, first_err)
    }

    fn collect_device(&self, device: usize, mem: &mut DeviceMemory) -> (GcReport, Option<MemError>) {
        let drained = mem.drain_free();
        mem.counters.gc_runs += 1;

        let mut report = GcReport::default();
        let mut first_err = None;
        for buffer in drained {
            mem.counters.native_frees += 1;
            report.buffers += 1;
            report.bytes += buffer.size_class;
            if let Err(e) = self.allocator.free(buffer.ptr, buffer.size_class) {
                tracing::error!(
                    "MemoryManager::garbage_collect: native free of {} on device {} failed: {}",
                    buffer.ptr,
                    device,
                    e
                );
                first_err.get_or_insert(MemError::DeviceError(format!(
                    "native free of {} on device {} failed: {}",
                    buffer.ptr, device, e
                )));
            }
        }

        if report.buffers > 0 {
            tracing::debug!(
                "MemoryManager::garbage_collect: device {} released {} buffers ({} bytes)",
                device,
                report.buffers,
                report.bytes
            );
        }
        (report, first_err)
    }

    // ========== Reporting ==========

    /// Held and user-locked totals for `device`
    ///
    /// Does not synchronize the queue; `MemoryContext::device_memory_info`
    /// does that first.
    pub fn buffer_info(&self, device: usize) -> MemResult<BufferInfo> {
        let state = self.lock()?;
        let mem = state.device(device)?;
        Ok(BufferInfo {
            alloc_bytes: mem.total_bytes(),
            alloc_buffers: mem.total_buffers(),
            lock_bytes: mem.lock_bytes(),
            lock_buffers: mem.lock_buffers(),
        })
    }

    /// Whether the active device is within both ceilings
    pub fn check_memory_limit(&self) -> MemResult<bool> {
        let state = self.lock()?;
        let device = self.active_device(&state)?;
        let mem = &state.devices[device];
        Ok(mem.in_use_bytes() < mem.max_bytes && mem.total_buffers() < state.max_buffers)
    }

    /// Full statistics for `device`
    pub fn stats(&self, device: usize) -> MemResult<MemoryStats> {
        let state = self.lock()?;
        let mem = state.device(device)?;
        Ok(MemoryStats::from_device(device, mem, state.max_buffers))
    }

    /// Table of every buffer tracked on `device`, headed by `tag`
    pub fn format_info(&self, tag: &str, device: usize) -> MemResult<String> {
        let state = self.lock()?;
        let mem = state.device(device)?;
        Ok(render_table(tag, device, self.allocator.name(), mem))
    }

    /// Print [`format_info`](Self::format_info) to stdout
    pub fn print_info(&self, tag: &str, device: usize) -> MemResult<()> {
        let table = self.format_info(tag, device)?;
        tracing::debug!("{}", table);
        println!("{}", table);
        Ok(())
    }

    // ========== Teardown ==========

    /// Release every free buffer on every device, never failing
    ///
    /// Each device is selected in turn and collected; per-device errors are
    /// logged and skipped so the remaining devices are still cleaned up.
    /// Safe to call more than once; also runs on drop.
    pub fn teardown(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("MemoryManager::teardown: lock poisoned, recovering state");
                poisoned.into_inner()
            }
        };

        let previous = self.devices.active_device();
        for device in 0..state.devices.len() {
            if let Err(e) = self.devices.set_active_device(device) {
                tracing::warn!("MemoryManager::teardown: cannot select device {}: {}", device, e);
                continue;
            }
            let (_, err) = self.collect_device(device, &mut state.devices[device]);
            if let Some(e) = err {
                tracing::warn!("MemoryManager::teardown: device {}: {}", device, e);
            }
            let outstanding = state.devices[device].in_use_buffers();
            if outstanding > 0 {
                tracing::warn!(
                    "MemoryManager::teardown: device {} still has {} buffers in use",
                    device,
                    outstanding
                );
            }
        }
        if let Err(e) = self.devices.set_active_device(previous) {
            tracing::warn!("MemoryManager::teardown: cannot restore device {}: {}", previous, e);
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
