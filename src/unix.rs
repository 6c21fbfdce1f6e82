//! Segments from the Unix virtual memory system, for process heaps.

use core::ptr::null_mut;

use errno::Errno;

use crate::block::Tag;
use crate::error::{HeapError, Result};
use crate::supplier::{round_up, RawSupplier, Segment};

/// MmapSupplier uses anonymous private mappings for every segment.
///
/// Failures are not logged here, as the heap lock is held; the cause of the
/// most recent one is kept for [`last_error`](MmapSupplier::last_error).
#[derive(Default, Debug)]
pub struct MmapSupplier {
    // Just for tracking, not really needed
    pages: usize,
    mappings: usize,
    last_error: Option<Errno>,
}

impl MmapSupplier {
    pub const fn new() -> Self {
        MmapSupplier {
            pages: 0,
            mappings: 0,
            last_error: None,
        }
    }

    /// Pages currently mapped through this supplier.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Mappings currently held through this supplier.
    pub fn mappings(&self) -> usize {
        self.mappings
    }

    /// What `mmap` or `munmap` reported the last time either failed.
    pub fn last_error(&self) -> Option<Errno> {
        self.last_error
    }
}

fn page_size() -> usize {
    sysconf::page::pagesize()
}

unsafe impl RawSupplier for MmapSupplier {
    fn granularity(&self) -> usize {
        page_size()
    }

    fn acquire(&mut self, size: usize, _tag: Tag) -> Result<Segment> {
        if size == 0 {
            return Err(HeapError::InvalidArgument);
        }
        let pagesize = page_size();
        let to_allocate = round_up(size, pagesize).ok_or(HeapError::OutOfMemory)?;

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                to_allocate,
                libc::PROT_WRITE | libc::PROT_READ,
                // MAP_ANON: no file behind it; MAP_PRIVATE: not shared with
                // any other process.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED || ptr.is_null() {
            self.last_error = Some(errno::errno());
            return Err(HeapError::OutOfMemory);
        }

        self.pages += to_allocate / pagesize;
        self.mappings += 1;

        Ok(Segment {
            base: ptr as usize,
            size: to_allocate,
        })
    }

    fn release(&mut self, base: usize, size: usize) -> Result<()> {
        let pagesize = page_size();
        if base == 0 || base % pagesize != 0 || size == 0 {
            return Err(HeapError::InvalidArgument);
        }

        let result = unsafe { libc::munmap(base as *mut libc::c_void, size) };
        if result != 0 {
            self.last_error = Some(errno::errno());
            return Err(HeapError::InvalidArgument);
        }

        self.pages = self.pages.saturating_sub(size / pagesize);
        self.mappings = self.mappings.saturating_sub(1);
        Ok(())
    }
}
