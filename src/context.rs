//! Which execution context is running: privileged (kernel) or unprivileged
//! (process).
//!
//! The flag is process-wide and is read once at the start of every heap
//! operation. Whoever switches contexts (a syscall entry, a trap handler)
//! updates it, typically with [`ContextFlag::enter`].

use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionContext {
    Privileged = 1,
    Unprivileged = 2,
}

impl ExecutionContext {
    const fn from_raw(raw: u8) -> ExecutionContext {
        match raw {
            1 => ExecutionContext::Privileged,
            _ => ExecutionContext::Unprivileged,
        }
    }
}

/// An atomically updated [`ExecutionContext`].
#[derive(Debug)]
pub struct ContextFlag(AtomicU8);

/// The flag heaps consult unless they are given their own.
pub static CURRENT_CONTEXT: ContextFlag = ContextFlag::new(ExecutionContext::Unprivileged);

impl ContextFlag {
    pub const fn new(context: ExecutionContext) -> Self {
        ContextFlag(AtomicU8::new(context as u8))
    }

    pub fn get(&self) -> ExecutionContext {
        ExecutionContext::from_raw(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, context: ExecutionContext) {
        self.0.store(context as u8, Ordering::SeqCst);
    }

    /// Switch to `context` until the returned guard is dropped, then switch
    /// back to whatever was set before.
    pub fn enter(&self, context: ExecutionContext) -> ContextGuard<'_> {
        let previous = ExecutionContext::from_raw(self.0.swap(context as u8, Ordering::SeqCst));
        ContextGuard {
            flag: self,
            previous,
        }
    }
}

#[must_use = "the previous context is restored when the guard is dropped"]
pub struct ContextGuard<'a> {
    flag: &'a ContextFlag,
    previous: ExecutionContext,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}
