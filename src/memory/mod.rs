//! Caching memory management
//!
//! Repeated native allocation is expensive on every backend this crate
//! targets, so released buffers are kept and handed out again to later
//! requests of the same size class.
//!
//! # Pattern
//!
//! 1. Round each request up to the step size (its size class)
//! 2. Pop a free buffer of that class if one exists
//! 3. Otherwise check the device ceilings, garbage-collect if they would be
//!    exceeded, and fall through to the native allocator
//! 4. On release, push the buffer back onto its class's free list
//!
//! Buffers pinned with `user_lock` are never reused or collected until unpinned.

pub mod buffer;
pub mod manager;
pub mod registry;
pub mod stats;

pub use buffer::{size_class, Buffer, BufferState, DevicePtr, TypedPtr};
pub use manager::MemoryManager;
pub use registry::{DeviceCounters, DeviceMemory};
pub use stats::{format_bytes, BufferInfo, GcReport, MemoryStats};
