//! Thread-safe heaps, and the backends that bind them to an execution
//! context.
//!
//! ## [`HeapBackend`]
//!
//! The capabilities a heap needs from its surroundings: which context it
//! serves, how its lock is taken, and who the caller is. The raw memory comes
//! from the backend's associated [`RawSupplier`].
//!
//! ### [`KernelBackend`]
//!
//! Privileged context. The lock is spun on a bounded number of times, after
//! which the call fails with [`HeapError::LockUnavailable`] rather than
//! hanging the kernel.
//!
//! ### [`UserBackend`]
//!
//! Unprivileged context. The lock is spun on until it is acquired.
//!
//! ## [`Heap`]
//!
//! A [`RawHeap`] behind a spin lock, bound to one backend. Every entry point
//! reads the context flag, refuses to run in the wrong context, and holds the
//! lock for the whole operation.
//!
//! ## [`Dispatch`]
//!
//! A privileged and an unprivileged heap side by side; each call goes to the
//! one matching the context that made it.

use core::alloc::{GlobalAlloc, Layout};
use core::marker::PhantomData;
use core::ptr::{self, null_mut};

use spin::{Mutex, MutexGuard};

use crate::block::{BlockInfo, Identity, Tag};
use crate::blocklist::Validity;
use crate::config::HeapConfig;
use crate::context::{ContextFlag, ExecutionContext, CURRENT_CONTEXT};
use crate::error::{HeapError, Result};
use crate::heap::{HeapStats, RawHeap};
use crate::supplier::{RawSupplier, RegionSupplier};
#[cfg(feature = "use_libc")]
use crate::unix::MmapSupplier;

pub trait HeapBackend {
    /// Where backing segments and record batches come from.
    type Supplier: RawSupplier;

    /// The execution context this backend serves.
    const CONTEXT: ExecutionContext;

    /// Acquire the heap lock, or fail with [`HeapError::LockUnavailable`].
    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>>;

    /// Who is calling, for block ownership records.
    fn current_identity(&self) -> Identity;
}

fn kernel_identity() -> Identity {
    Identity::KERNEL
}

#[cfg(feature = "use_libc")]
fn process_identity() -> Identity {
    Identity::current_process()
}

#[cfg(not(feature = "use_libc"))]
fn process_identity() -> Identity {
    Identity(u32::MAX)
}

/// Backend for the privileged context.
pub struct KernelBackend<S> {
    spin_limit: usize,
    identity: fn() -> Identity,
    _supplier: PhantomData<fn() -> S>,
}

impl<S> KernelBackend<S> {
    pub const DEFAULT_SPIN_LIMIT: usize = 1 << 16;

    pub const fn new() -> Self {
        KernelBackend {
            spin_limit: Self::DEFAULT_SPIN_LIMIT,
            identity: kernel_identity,
            _supplier: PhantomData,
        }
    }

    /// Give up on the lock after `attempts` tries.
    pub const fn with_spin_limit(mut self, attempts: usize) -> Self {
        self.spin_limit = attempts;
        self
    }

    /// Use `identity` to find out which task is allocating.
    pub const fn with_identity(mut self, identity: fn() -> Identity) -> Self {
        self.identity = identity;
        self
    }
}

impl<S> Default for KernelBackend<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RawSupplier> HeapBackend for KernelBackend<S> {
    type Supplier = S;
    const CONTEXT: ExecutionContext = ExecutionContext::Privileged;

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        for _ in 0..self.spin_limit.max(1) {
            if let Some(guard) = mutex.try_lock() {
                return Ok(guard);
            }
            // Hint to the processor that we're in a spin loop
            core::hint::spin_loop();
        }
        Err(HeapError::LockUnavailable)
    }

    fn current_identity(&self) -> Identity {
        (self.identity)()
    }
}

/// Backend for the unprivileged context.
pub struct UserBackend<S> {
    identity: fn() -> Identity,
    _supplier: PhantomData<fn() -> S>,
}

impl<S> UserBackend<S> {
    pub const fn new() -> Self {
        UserBackend {
            identity: process_identity,
            _supplier: PhantomData,
        }
    }

    /// Use `identity` to find out which thread or process is allocating.
    pub const fn with_identity(mut self, identity: fn() -> Identity) -> Self {
        self.identity = identity;
        self
    }
}

impl<S> Default for UserBackend<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RawSupplier> HeapBackend for UserBackend<S> {
    type Supplier = S;
    const CONTEXT: ExecutionContext = ExecutionContext::Unprivileged;

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        Ok(mutex.lock())
    }

    fn current_identity(&self) -> Identity {
        (self.identity)()
    }
}

/// A kernel heap over a donated region.
pub type KernelHeap = Heap<KernelBackend<RegionSupplier>>;

/// A process heap over `mmap`ed segments.
#[cfg(feature = "use_libc")]
pub type ProcessHeap = Heap<UserBackend<MmapSupplier>>;

/// A thread-safe heap, bound to the execution context of its backend.
pub struct Heap<B: HeapBackend> {
    backend: B,
    context: &'static ContextFlag,
    raw: Mutex<RawHeap<B::Supplier>>,
}

impl<B: HeapBackend> Heap<B> {
    /// A heap that consults the process-wide [`CURRENT_CONTEXT`].
    pub const fn new(backend: B, supplier: B::Supplier, config: HeapConfig) -> Self {
        Self::with_context_flag(backend, supplier, config, &CURRENT_CONTEXT)
    }

    /// A heap that consults `context` instead of the process-wide flag.
    pub const fn with_context_flag(
        backend: B,
        supplier: B::Supplier,
        config: HeapConfig,
        context: &'static ContextFlag,
    ) -> Self {
        Heap {
            backend,
            context,
            raw: Mutex::new(RawHeap::new(supplier, config)),
        }
    }

    pub fn context_flag(&self) -> &'static ContextFlag {
        self.context
    }

    // Check that `context` is the one we serve, then take the lock. The guard
    // releases it on every path out of the caller.
    fn enter(&self, context: ExecutionContext) -> Result<MutexGuard<'_, RawHeap<B::Supplier>>> {
        if context != B::CONTEXT {
            log::debug!("{:?} heap entered from {:?} context", B::CONTEXT, context);
            return Err(HeapError::InvalidOperation);
        }
        self.backend.lock(&self.raw)
    }

    // As `enter`, for `GlobalAlloc`: nothing is logged, and the heap is made
    // quiet until the returned guard is dropped.
    fn enter_quietly(&self) -> Option<QuietGuard<'_, B::Supplier>> {
        if self.context.get() != B::CONTEXT {
            return None;
        }
        let mut raw = self.backend.lock(&self.raw).ok()?;
        let loud = raw.set_quiet(true);
        Some(QuietGuard { raw, loud })
    }

    /// Allocate at least `size` bytes, labelled with `tag`, and return the
    /// address of the block.
    pub fn allocate(&self, size: usize, tag: &str) -> Result<usize> {
        self.allocate_in(self.context.get(), size, tag)
    }

    fn allocate_in(&self, context: ExecutionContext, size: usize, tag: &str) -> Result<usize> {
        let owner = self.backend.current_identity();
        self.enter(context)?.allocate(size, Tag::new(tag), Some(owner))
    }

    /// Free the block starting at `address`.
    pub fn deallocate(&self, address: usize, tag: &str) -> Result<()> {
        self.deallocate_in(self.context.get(), address, tag)
    }

    fn deallocate_in(&self, context: ExecutionContext, address: usize, tag: &str) -> Result<()> {
        self.enter(context)?.deallocate(address, Tag::new(tag))
    }

    /// Describe the used block containing `address`.
    pub fn describe_block(&self, address: usize) -> Result<BlockInfo> {
        self.describe_block_in(self.context.get(), address)
    }

    fn describe_block_in(&self, context: ExecutionContext, address: usize) -> Result<BlockInfo> {
        self.enter(context)?.describe_block(address)
    }

    pub fn stats(&self) -> Result<HeapStats> {
        self.stats_in(self.context.get())
    }

    fn stats_in(&self, context: ExecutionContext) -> Result<HeapStats> {
        Ok(self.enter(context)?.stats())
    }

    /// Fill `out` with used blocks in address order; returns how many were
    /// written.
    pub fn list_used_blocks(&self, out: &mut [BlockInfo]) -> Result<usize> {
        self.list_used_blocks_in(self.context.get(), out)
    }

    fn list_used_blocks_in(&self, context: ExecutionContext, out: &mut [BlockInfo]) -> Result<usize> {
        Ok(self.enter(context)?.list_used_blocks(out))
    }

    pub fn self_check(&self) -> Result<Validity> {
        self.self_check_in(self.context.get())
    }

    fn self_check_in(&self, context: ExecutionContext) -> Result<Validity> {
        Ok(self.enter(context)?.self_check())
    }

    /// Run `f` with the lock held and exclusive access to the raw heap.
    pub fn with_raw<R>(&self, f: impl FnOnce(&mut RawHeap<B::Supplier>) -> R) -> Result<R> {
        let mut raw = self.enter(self.context.get())?;
        Ok(f(&mut raw))
    }
}

// A locked heap with logging off, turned back to what it was on drop.
struct QuietGuard<'a, S: RawSupplier> {
    raw: MutexGuard<'a, RawHeap<S>>,
    loud: bool,
}

impl<S: RawSupplier> Drop for QuietGuard<'_, S> {
    fn drop(&mut self) {
        self.raw.set_quiet(self.loud);
    }
}

// A logger may allocate, and with this heap as the global allocator that
// comes straight back here; so nothing is logged while the lock is held.
unsafe impl<B: HeapBackend + Sync> GlobalAlloc for Heap<B>
where
    B::Supplier: Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let owner = self.backend.current_identity();
        let Some(mut heap) = self.enter_quietly() else {
            return null_mut();
        };
        match heap.raw.allocate_aligned(
            layout.size().max(1),
            layout.align(),
            Tag::new("global"),
            Some(owner),
        ) {
            Ok(address) => address as *mut u8,
            Err(_) => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let result = match self.enter_quietly() {
            Some(mut heap) => heap.raw.deallocate(ptr as usize, Tag::new("global")),
            None => Err(HeapError::InvalidOperation),
        };
        // The lock is released by now
        if let Err(err) = result {
            log::warn!("global dealloc of {:p} failed: {}", ptr, err);
        }
    }
}

/// A privileged and an unprivileged heap, with every call routed by the
/// context flag.
pub struct Dispatch<K: HeapBackend, U: HeapBackend> {
    kernel: Heap<K>,
    user: Heap<U>,
}

impl<K: HeapBackend, U: HeapBackend> Dispatch<K, U> {
    /// # Panics
    ///
    /// If `kernel` and `user` do not serve the privileged and unprivileged
    /// context respectively, or do not share a context flag.
    pub fn new(kernel: Heap<K>, user: Heap<U>) -> Self {
        assert!(
            matches!(K::CONTEXT, ExecutionContext::Privileged)
                && matches!(U::CONTEXT, ExecutionContext::Unprivileged),
            "dispatch needs a privileged and an unprivileged heap"
        );
        assert!(
            ptr::eq(kernel.context, user.context),
            "both heaps must follow the same context flag"
        );
        Dispatch { kernel, user }
    }

    pub fn kernel(&self) -> &Heap<K> {
        &self.kernel
    }

    pub fn user(&self) -> &Heap<U> {
        &self.user
    }

    // Read the context flag once, and pick the heap for it.
    fn route<R>(
        &self,
        kernel: impl FnOnce(&Heap<K>, ExecutionContext) -> R,
        user: impl FnOnce(&Heap<U>, ExecutionContext) -> R,
    ) -> R {
        let context = self.kernel.context.get();
        match context {
            ExecutionContext::Privileged => kernel(&self.kernel, context),
            ExecutionContext::Unprivileged => user(&self.user, context),
        }
    }

    pub fn allocate(&self, size: usize, tag: &str) -> Result<usize> {
        self.route(
            |heap, context| heap.allocate_in(context, size, tag),
            |heap, context| heap.allocate_in(context, size, tag),
        )
    }

    pub fn deallocate(&self, address: usize, tag: &str) -> Result<()> {
        self.route(
            |heap, context| heap.deallocate_in(context, address, tag),
            |heap, context| heap.deallocate_in(context, address, tag),
        )
    }

    pub fn describe_block(&self, address: usize) -> Result<BlockInfo> {
        self.route(
            |heap, context| heap.describe_block_in(context, address),
            |heap, context| heap.describe_block_in(context, address),
        )
    }

    pub fn stats(&self) -> Result<HeapStats> {
        self.route(
            |heap, context| heap.stats_in(context),
            |heap, context| heap.stats_in(context),
        )
    }

    pub fn list_used_blocks(&self, out: &mut [BlockInfo]) -> Result<usize> {
        let context = self.kernel.context.get();
        match context {
            ExecutionContext::Privileged => self.kernel.list_used_blocks_in(context, out),
            ExecutionContext::Unprivileged => self.user.list_used_blocks_in(context, out),
        }
    }

    pub fn self_check(&self) -> Result<Validity> {
        self.route(
            |heap, context| heap.self_check_in(context),
            |heap, context| heap.self_check_in(context),
        )
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    use crate::testing::leak_region;
    use test_log::test;

    type UserRegionHeap = Heap<UserBackend<RegionSupplier>>;

    fn kernel_heap(context: &'static ContextFlag) -> KernelHeap {
        KernelHeap::with_context_flag(
            KernelBackend::new().with_identity(|| Identity(7)),
            RegionSupplier::new(leak_region(64 * 1024), 256),
            HeapConfig::new().with_growth_multiple(1024),
            context,
        )
    }

    fn user_heap(context: &'static ContextFlag) -> UserRegionHeap {
        Heap::with_context_flag(
            UserBackend::new().with_identity(|| Identity(1234)),
            RegionSupplier::new(leak_region(64 * 1024), 256),
            HeapConfig::new().with_growth_multiple(1024),
            context,
        )
    }

    #[test]
    fn test_kernel_heap_records_owner_and_tag() {
        static CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Privileged);
        let heap = kernel_heap(&CONTEXT);

        let address = heap.allocate(40, "task-struct").unwrap();
        let info = heap.describe_block(address).unwrap();
        assert_eq!(info.owner, Some(Identity(7)));
        assert_eq!(info.tag.as_str(), "task-struct");
        assert_eq!(info.size(), 40);

        heap.deallocate(address, "task-struct").unwrap();
        assert_eq!(heap.describe_block(address), Err(HeapError::NotFound));
        assert!(heap.self_check().unwrap().is_valid());
    }

    #[test]
    fn test_wrong_context_is_refused() {
        static CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Unprivileged);
        let heap = kernel_heap(&CONTEXT);

        assert_eq!(heap.allocate(8, "x"), Err(HeapError::InvalidOperation));
        assert_eq!(heap.stats(), Err(HeapError::InvalidOperation));

        let address = {
            let _kernel = CONTEXT.enter(ExecutionContext::Privileged);
            heap.allocate(8, "x").unwrap()
        };
        assert_eq!(heap.deallocate(address, "x"), Err(HeapError::InvalidOperation));

        let _kernel = CONTEXT.enter(ExecutionContext::Privileged);
        assert_eq!(heap.stats().unwrap().used_records, 1);
    }

    #[test]
    fn test_kernel_lock_gives_up() {
        static CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Privileged);
        let heap = KernelHeap::with_context_flag(
            KernelBackend::new().with_spin_limit(8),
            RegionSupplier::new(leak_region(64 * 1024), 256),
            HeapConfig::new(),
            &CONTEXT,
        );

        let held = heap.raw.lock();
        assert_eq!(heap.allocate(8, "x"), Err(HeapError::LockUnavailable));
        assert_eq!(heap.self_check(), Err(HeapError::LockUnavailable));
        drop(held);

        assert!(heap.allocate(8, "x").is_ok());
    }

    #[test]
    fn test_dispatch_follows_context() {
        static CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Unprivileged);
        let dispatch = Dispatch::new(kernel_heap(&CONTEXT), user_heap(&CONTEXT));

        let user_block = dispatch.allocate(100, "buffer").unwrap();
        assert_eq!(
            dispatch.describe_block(user_block).unwrap().owner,
            Some(Identity(1234))
        );

        let kernel_block = {
            let _kernel = CONTEXT.enter(ExecutionContext::Privileged);
            let address = dispatch.allocate(100, "page-table").unwrap();
            // The user heap's blocks are invisible from here
            assert_eq!(dispatch.describe_block(user_block), Err(HeapError::NotFound));
            assert_eq!(dispatch.stats().unwrap().used_records, 1);
            address
        };
        assert_ne!(kernel_block, user_block);

        let mut out = [BlockInfo::EMPTY; 4];
        assert_eq!(dispatch.list_used_blocks(&mut out).unwrap(), 1);
        assert_eq!(out[0].tag.as_str(), "buffer");

        dispatch.deallocate(user_block, "buffer").unwrap();
        assert_eq!(dispatch.deallocate(kernel_block, "page-table"), Err(HeapError::NotFound));
        assert!(dispatch.self_check().unwrap().is_valid());

        let _kernel = CONTEXT.enter(ExecutionContext::Privileged);
        dispatch.deallocate(kernel_block, "page-table").unwrap();
        assert_eq!(dispatch.kernel().stats().unwrap().used_bytes, 0);
    }

    #[test]
    fn test_global_alloc_leaves_logging_as_it_was() {
        static CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Privileged);
        let heap = kernel_heap(&CONTEXT);

        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { heap.dealloc(ptr, layout) };
        // Quiet only for the duration of the call
        assert_eq!(heap.with_raw(|raw| raw.set_quiet(false)), Ok(false));

        // A pointer the heap never gave out is reported, not ignored, and
        // the lock is free again afterwards
        unsafe { heap.dealloc(ptr.wrapping_add(8), layout) };
        assert_eq!(heap.with_raw(|raw| raw.set_quiet(false)), Ok(false));
        assert!(heap.self_check().unwrap().is_valid());

        // Outside its context the heap hands out nothing
        let _user = CONTEXT.enter(ExecutionContext::Unprivileged);
        assert!(unsafe { heap.alloc(layout) }.is_null());
    }

    #[test]
    #[should_panic(expected = "same context flag")]
    fn test_dispatch_needs_shared_flag() {
        static KERNEL: ContextFlag = ContextFlag::new(ExecutionContext::Privileged);
        static USER: ContextFlag = ContextFlag::new(ExecutionContext::Unprivileged);
        let _ = Dispatch::new(kernel_heap(&KERNEL), user_heap(&USER));
    }

    #[test]
    fn test_global_alloc() {
        static CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Privileged);
        let heap = kernel_heap(&CONTEXT);

        let layout = Layout::from_size_align(24, 8).unwrap();
        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 8, 0);
        unsafe {
            ptr.write_bytes(0x5a, 24);
            heap.dealloc(ptr, layout);
        }
        assert_eq!(heap.stats().unwrap().used_bytes, 0);

        // Beyond the configured alignment, as cache padded types are
        let wide = Layout::from_size_align(512, 128).unwrap();
        let ptr = unsafe { heap.alloc(wide) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 128, 0);
        unsafe {
            ptr.write_bytes(0xa5, 512);
            heap.dealloc(ptr, wide);
        }
        assert_eq!(heap.stats().unwrap().used_bytes, 0);

        // Zero sized layouts still get a block of their own
        let empty = Layout::from_size_align(0, 1).unwrap();
        let ptr = unsafe { heap.alloc(empty) };
        assert!(!ptr.is_null());
        unsafe { heap.dealloc(ptr, empty) };
        assert!(heap.self_check().unwrap().is_valid());
    }
}
