//! memforge - caching device memory allocator
//!
//! A per-device caching layer that sits between a compute backend and its
//! native allocation primitive. Released buffers are recycled by size class,
//! byte and buffer ceilings trigger garbage collection, and user pins keep
//! buffers out of reuse until they are released.

#![allow(clippy::let_and_return)] // Sometimes clearer for debugging
#![allow(clippy::missing_safety_doc)] // Raw pointer wrappers documented at module level

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod memory;

pub use backend::{DeviceContext, HostAllocator, HostDevices, NativeAllocator, PinnedHostAllocator, Queue};
pub use config::MemoryConfig;
pub use context::MemoryContext;
pub use error::{ErrorCategory, MemError, MemResult};
pub use logging::{init_logging_default, init_with_config, LoggingConfig};
pub use memory::{BufferInfo, DevicePtr, GcReport, MemoryManager, MemoryStats, TypedPtr};
