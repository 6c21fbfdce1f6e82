#![no_std]

//! A best-fit heap engine for kernels and the processes they run.
//!
//! The same algorithm serves both execution contexts; what differs is where
//! raw memory comes from, how the lock is taken and who counts as the
//! caller. Those differences live in a [`HeapBackend`].
//!
//! ## Layout
//!
//! - [`RawHeap`]: the single-threaded engine. It keeps an address-ordered
//!   free chain and used chain of block records, picks the smallest free
//!   block that fits, splits off the rest, merges freed blocks with their
//!   neighbours, and gives whole segments back to the supplier once they are
//!   entirely free.
//! - [`Heap`]: a `RawHeap` behind a spin lock, bound to one execution context.
//! - [`Dispatch`]: a kernel heap and a process heap, with each call routed by
//!   the [`ContextFlag`].
//! - [`RawSupplier`]: where segments come from. [`RegionSupplier`] carves
//!   pages out of a donated region; `MmapSupplier` (with the `use_libc`
//!   feature) maps anonymous memory.
//!
//! Block records never live in the heap they describe: they are carved in
//! batches straight from the supplier, and recycled through a vacant pool.
//!
//! ## Example
//!
//! ```
//! use segment_heap::{ContextFlag, ExecutionContext, HeapConfig, KernelBackend, KernelHeap, RegionSupplier};
//!
//! static CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Privileged);
//!
//! let region: &'static mut [u8] = Box::leak(vec![0u8; 64 * 1024].into_boxed_slice());
//! let heap = KernelHeap::with_context_flag(
//!     KernelBackend::new(),
//!     RegionSupplier::new(region, 256),
//!     HeapConfig::new().with_growth_multiple(1024),
//!     &CONTEXT,
//! );
//!
//! let address = heap.allocate(100, "example").unwrap();
//! assert_eq!(heap.describe_block(address).unwrap().tag.as_str(), "example");
//! heap.deallocate(address, "example").unwrap();
//! assert!(heap.self_check().unwrap().is_valid());
//! ```

// Log through `log` unless `$quiet` is set. A heap serving `GlobalAlloc` must
// not log while locked: a logger that allocates would come straight back in.
macro_rules! heap_log {
    ($quiet:expr, $level:ident, $($arg:tt)+) => {
        if !$quiet {
            log::$level!($($arg)+);
        }
    };
}

pub mod allocators;
pub mod block;
mod blocklist;
pub mod config;
pub mod context;
pub mod error;
pub mod heap;
mod pool;
pub mod supplier;
#[cfg(test)]
mod testing;
#[cfg(feature = "use_libc")]
pub mod unix;

pub use allocators::{Dispatch, Heap, HeapBackend, KernelBackend, KernelHeap, UserBackend};
#[cfg(feature = "use_libc")]
pub use allocators::ProcessHeap;
pub use block::{BlockInfo, Identity, Tag};
pub use blocklist::{ChainTotals, Validity};
pub use config::HeapConfig;
pub use context::{ContextFlag, ExecutionContext, CURRENT_CONTEXT};
pub use error::{HeapError, Result};
pub use heap::{FreeBlockInfo, HeapStats, RawHeap};
pub use pool::MAX_BATCHES;
pub use supplier::{RawSupplier, RegionSupplier, Segment};
#[cfg(feature = "use_libc")]
pub use unix::MmapSupplier;
