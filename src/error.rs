use core::fmt;

/// Everything that can go wrong in a heap operation.
///
/// Errors are always handed back to the immediate caller; the heap never
/// retries on its own, except for the single growth-and-retry inside
/// [`RawHeap::allocate`](crate::heap::RawHeap::allocate).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// A zero-sized request, a null address, or a malformed supplier request.
    InvalidArgument,
    /// Neither the free chain nor the supplier could satisfy the request, or
    /// no metadata record could be obtained.
    OutOfMemory,
    /// The address does not belong to a block currently in use.
    NotFound,
    /// Deallocation was attempted before any allocation succeeded.
    NotInitialized,
    /// A heap bound to one execution context was entered from the other.
    InvalidOperation,
    /// The heap lock could not be acquired.
    LockUnavailable,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HeapError::InvalidArgument => "invalid argument",
            HeapError::OutOfMemory => "out of memory",
            HeapError::NotFound => "no block in use at that address",
            HeapError::NotInitialized => "heap has not been initialized",
            HeapError::InvalidOperation => "entry point not valid in the current execution context",
            HeapError::LockUnavailable => "heap lock unavailable",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, HeapError>;
