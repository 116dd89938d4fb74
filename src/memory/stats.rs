//! Reporting types: usage snapshots, garbage-collection results and the
//! human-readable memory table.

use std::fmt;
use std::fmt::Write as _;

use super::buffer::BufferState;
use super::registry::DeviceMemory;

/// Usage snapshot returned by `buffer_info` / `device_memory_info`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    /// Bytes held from the native allocator (free + active + locked)
    pub alloc_bytes: usize,
    /// Buffers held from the native allocator
    pub alloc_buffers: usize,
    /// Bytes in user-locked buffers
    pub lock_bytes: usize,
    /// User-locked buffers
    pub lock_buffers: usize,
}

/// What one garbage-collection pass returned to the native allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub buffers: usize,
    pub bytes: usize,
}

impl GcReport {
    pub(crate) fn merge(&mut self, other: GcReport) {
        self.buffers += other.buffers;
        self.bytes += other.bytes;
    }
}

/// Full per-device statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub device: usize,
    /// Bytes held from the native allocator
    pub total_bytes: usize,
    pub total_buffers: usize,
    /// Active plus user-locked
    pub in_use_bytes: usize,
    pub in_use_buffers: usize,
    pub lock_bytes: usize,
    pub lock_buffers: usize,
    /// Buffers waiting in free lists
    pub free_buffers: usize,
    pub max_bytes: usize,
    pub max_buffers: usize,
    pub native_allocs: u64,
    pub native_frees: u64,
    /// Allocations satisfied from a free list
    pub reuse_hits: u64,
    pub gc_runs: u64,
}

impl MemoryStats {
    pub(crate) fn from_device(device: usize, mem: &DeviceMemory, max_buffers: usize) -> Self {
        MemoryStats {
            device,
            total_bytes: mem.total_bytes(),
            total_buffers: mem.total_buffers(),
            in_use_bytes: mem.in_use_bytes(),
            in_use_buffers: mem.in_use_buffers(),
            lock_bytes: mem.lock_bytes(),
            lock_buffers: mem.lock_buffers(),
            free_buffers: mem.free_buffers(),
            max_bytes: mem.max_bytes,
            max_buffers,
            native_allocs: mem.counters.native_allocs,
            native_frees: mem.counters.native_frees,
            reuse_hits: mem.counters.reuse_hits,
            gc_runs: mem.counters.gc_runs,
        }
    }

    /// Percentage of allocations served from a free list
    pub fn reuse_rate_percent(&self) -> f64 {
        let total = self.reuse_hits + self.native_allocs;
        if total > 0 {
            self.reuse_hits as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryStats[device {}]: held={} in {} buffers, in-use={} in {} buffers, locked={} in {} buffers, \
             free={} buffers, limits={} / {} buffers, native allocs={} frees={}, reused={} ({}%), gc runs={}",
            self.device,
            format_bytes(self.total_bytes),
            self.total_buffers,
            format_bytes(self.in_use_bytes),
            self.in_use_buffers,
            format_bytes(self.lock_bytes),
            self.lock_buffers,
            self.free_buffers,
            format_bytes(self.max_bytes),
            self.max_buffers,
            self.native_allocs,
            self.native_frees,
            self.reuse_hits,
            self.reuse_rate_percent() as u32,
            self.gc_runs
        )
    }
}

/// Format bytes as human readable (KB, MB, GB)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;
    const GB: usize = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

const RULE: &str = "---------------------------------------------------------";

/// Render every tracked buffer of one device as a table
pub(crate) fn render_table(tag: &str, device: usize, allocator: &str, mem: &DeviceMemory) -> String {
    let mut buffers: Vec<_> = mem.buffers().collect();
    buffers.sort_by_key(|b| b.ptr.addr());

    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = writeln!(out, "{}", tag);
    let _ = writeln!(out, "MemoryManager info for device {} ({} allocator)", device, allocator);
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(
        out,
        "| {:<18} | {:>10} | {:<11} | {:<4} |",
        "POINTER", "SIZE", "STATE", "USER"
    );
    let _ = writeln!(out, "{}", RULE);
    for buffer in buffers {
        let state = match buffer.state {
            BufferState::Free => "free",
            BufferState::Active => "active",
            BufferState::UserLocked => "user-locked",
        };
        let _ = writeln!(
            out,
            "| {:<18} | {:>10} | {:<11} | {:<4} |",
            buffer.ptr.to_string(),
            format_bytes(buffer.size_class),
            state,
            if buffer.user { "yes" } else { "no" }
        );
    }
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(
        out,
        "held: {} in {} buffers, locked: {} in {} buffers",
        format_bytes(mem.total_bytes()),
        mem.total_buffers(),
        format_bytes(mem.lock_bytes()),
        mem.lock_buffers()
    );
    out
}
