//! Buffer handles and per-buffer state

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

// SAFETY: DevicePtr is an opaque address. It is never dereferenced by the
// allocator; ownership of the pointed-to memory is tracked by the manager
// under its lock, so sending the address across threads is sound.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

/// Opaque handle to one native allocation
///
/// Unique while the allocation is live. Equality and hashing are by address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(NonNull<c_void>);

impl DevicePtr {
    /// Wrap a non-null native pointer
    pub fn new(ptr: NonNull<c_void>) -> Self {
        DevicePtr(ptr)
    }

    /// Wrap a raw pointer, returning `None` for null
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(DevicePtr)
    }

    /// Raw pointer for handing to kernels / FFI
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Address as an integer (for logging and reports)
    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Typed view of this allocation
    pub fn cast<T>(self) -> TypedPtr<T> {
        TypedPtr {
            ptr: self,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.addr())
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Typed view over a [`DevicePtr`], returned by the `count x size_of::<T>()` entry points
pub struct TypedPtr<T> {
    ptr: DevicePtr,
    _marker: PhantomData<*mut T>,
}

// SAFETY: same reasoning as DevicePtr; the marker only carries the element type.
unsafe impl<T> Send for TypedPtr<T> {}
unsafe impl<T> Sync for TypedPtr<T> {}

impl<T> TypedPtr<T> {
    /// Raw typed pointer
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr() as *mut T
    }

    /// Untyped handle, as tracked by the manager
    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }
}

impl<T> Clone for TypedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedPtr<T> {}

impl<T> PartialEq for TypedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for TypedPtr<T> {}

impl<T> fmt::Debug for TypedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TypedPtr<{}>({:#x})",
            std::any::type_name::<T>(),
            self.ptr.addr()
        )
    }
}

/// Lifecycle state of a tracked buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// In a free list, available for reuse
    Free,
    /// Handed out to a caller
    Active,
    /// Pinned by the user; exempt from reuse and garbage collection
    UserLocked,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Free => write!(f, "free"),
            BufferState::Active => write!(f, "active"),
            BufferState::UserLocked => write!(f, "user-locked"),
        }
    }
}

/// One outstanding native allocation
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub ptr: DevicePtr,
    /// Requested size rounded up to the step size; the free-list key
    pub size_class: usize,
    pub device: usize,
    pub state: BufferState,
    /// Last handed out through the user-facing path
    pub user: bool,
}

impl Buffer {
    pub(crate) fn new(ptr: DevicePtr, size_class: usize, device: usize, user: bool) -> Self {
        Buffer {
            ptr,
            size_class,
            device,
            state: BufferState::Active,
            user,
        }
    }

    /// Counted against the in-use tally (active or user-locked)
    pub fn is_in_use(&self) -> bool {
        !matches!(self.state, BufferState::Free)
    }
}

/// Round `bytes` up to the next multiple of `step`
///
/// A zero-byte request still occupies one step so that no zero-size class exists.
pub fn size_class(bytes: usize, step: usize) -> Option<usize> {
    debug_assert!(step > 0);
    let units = bytes.max(1).checked_add(step - 1)? / step;
    units.checked_mul(step)
}
