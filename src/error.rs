//! Unified error handling for memforge
//!
//! Every fallible operation in the crate returns [`MemResult`]. Errors are
//! categorized so callers can tell a transient out-of-memory condition (worth
//! one sync-and-retry) from a programming error such as a double free, which
//! no amount of waiting will fix.

use std::fmt;

use crate::memory::DevicePtr;

/// Unified error type for memforge
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemError {
    // ========== Allocation Errors ==========
    /// Native allocator refused the request, or a ceiling could not be honored
    #[error("Out of memory on device {device}: {bytes} bytes requested ({reason})")]
    OutOfMemory {
        device: usize,
        bytes: usize,
        reason: String,
    },

    // ========== Pointer / Lock Misuse ==========
    /// Pointer is not tracked by the registry (foreign pointer, double free, use-after-free)
    #[error("Invalid pointer: {0} is not an active allocation")]
    InvalidPointer(DevicePtr),

    /// Buffer is already user-locked
    #[error("Buffer {0} is already locked")]
    AlreadyLocked(DevicePtr),

    /// Buffer is not user-locked
    #[error("Buffer {0} is not locked")]
    NotLocked(DevicePtr),

    // ========== Device Errors ==========
    /// Device selection or native release failure
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Device index out of range
    #[error("Invalid device id: {0}")]
    InvalidDevice(usize),

    // ========== Configuration Errors ==========
    /// Invalid configuration value (step size, byte count overflow, env var)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Lock poisoned (a thread panicked while holding the manager lock)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl MemError {
    /// Build an out-of-memory error for `bytes` on `device`
    pub fn out_of_memory(device: usize, bytes: usize, reason: impl Into<String>) -> Self {
        MemError::OutOfMemory {
            device,
            bytes,
            reason: reason.into(),
        }
    }

    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            MemError::OutOfMemory { .. } => ErrorCategory::Recoverable,

            MemError::InvalidPointer(_)
            | MemError::AlreadyLocked(_)
            | MemError::NotLocked(_)
            | MemError::InvalidDevice(_)
            | MemError::InvalidConfiguration(_) => ErrorCategory::User,

            MemError::DeviceError(_) => ErrorCategory::Backend,

            MemError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is worth one sync-and-retry
    ///
    /// Only an out-of-memory condition can be fixed by letting pending
    /// releases land. Lock misuse and bad pointers are never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is an out-of-memory error
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, MemError::OutOfMemory { .. })
    }
}

/// Error category for handling decisions
///
/// - User: caller misuse (bad pointer, double lock, bad config)
/// - Recoverable: retry after the queue has been synchronized
/// - Internal: indicates a bug
/// - Backend: native allocator or device failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller misuse
    User,
    /// Temporary condition
    Recoverable,
    /// Indicates a bug
    Internal,
    /// Native allocator / device failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for MemError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MemError::LockPoisoned(err.to_string())
    }
}

/// Result alias for memforge operations
pub type MemResult<T> = std::result::Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    fn ptr(addr: usize) -> DevicePtr {
        DevicePtr::new(NonNull::new(addr as *mut std::ffi::c_void).unwrap())
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            MemError::out_of_memory(0, 64, "native").category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            MemError::InvalidPointer(ptr(0x1000)).category(),
            ErrorCategory::User
        );
        assert_eq!(
            MemError::AlreadyLocked(ptr(0x1000)).category(),
            ErrorCategory::User
        );
        assert_eq!(
            MemError::DeviceError("gone".to_string()).category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            MemError::LockPoisoned("poisoned".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_only_out_of_memory_is_recoverable() {
        assert!(MemError::out_of_memory(1, 4096, "ceiling").is_recoverable());
        assert!(!MemError::NotLocked(ptr(0x2000)).is_recoverable());
        assert!(!MemError::InvalidDevice(3).is_recoverable());
        assert!(!MemError::DeviceError("x".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = MemError::out_of_memory(2, 512, "max buffers reached");
        let msg = err.to_string();
        assert!(msg.contains("device 2"));
        assert!(msg.contains("512 bytes"));
        assert!(msg.contains("max buffers reached"));

        let err = MemError::InvalidPointer(ptr(0xdead0));
        assert!(err.to_string().contains("0xdead0"));
    }

    #[test]
    fn test_poison_conversion() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0u32));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err: MemError = lock.lock().unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::Internal);
    }
}
