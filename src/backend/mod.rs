//! Collaborators the allocator sits on top of: native allocation primitives,
//! the execution queue and the device context.

pub mod device_context;
pub mod native;
pub mod queue;

pub use device_context::{DeviceContext, HostDevices};
pub use native::{host_memory_size, HostAllocator, NativeAllocator, PinnedHostAllocator};
pub use queue::{DeferredQueue, ImmediateQueue, Queue};
