//! Raw-memory suppliers: where backing segments and record batches come from.
//!
//! ## [`RawSupplier`]
//!
//! The boundary between the heap and whatever hands out address ranges at
//! page granularity: a kernel's frame allocator, `mmap`, or a fixed region.
//!
//! ## [`RegionSupplier`]
//!
//! Hands out page runs from a single region donated at construction, keeping
//! a bitmap of which pages are taken. This is what a kernel uses before (or
//! instead of) a full virtual memory manager, and what the tests use.

use core::fmt;
use core::ptr::NonNull;

use crate::block::{Tag, RECORD_ALIGN};
use crate::error::{HeapError, Result};

/// One acquisition from a [`RawSupplier`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub base: usize,
    pub size: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Acquires and releases whole address ranges at page granularity.
///
/// # Safety
///
/// Implementations must guarantee that every segment returned by `acquire`:
///
/// - is at least `size` bytes long and its base is aligned to
///   `granularity()`,
/// - is valid for reads and writes for its whole length until it is passed
///   back to `release`,
/// - is not accessible to any other code, including other segments.
///
/// `granularity()` must be a power of two no smaller than 16, and must not
/// change over the supplier's lifetime.
///
/// Suppliers are called with the heap locked. They must not allocate through
/// the heap, and should not log: the heap may be the global allocator.
pub unsafe trait RawSupplier {
    /// Allocation unit of the supplier, in bytes.
    fn granularity(&self) -> usize;

    /// Acquire a fresh segment of at least `size` bytes.
    fn acquire(&mut self, size: usize, tag: Tag) -> Result<Segment>;

    /// Give back a segment previously returned by `acquire`.
    fn release(&mut self, base: usize, size: usize) -> Result<()>;
}

// Lets a heap borrow a supplier that outlives it.
unsafe impl<S: RawSupplier + ?Sized> RawSupplier for &mut S {
    fn granularity(&self) -> usize {
        (**self).granularity()
    }

    fn acquire(&mut self, size: usize, tag: Tag) -> Result<Segment> {
        (**self).acquire(size, tag)
    }

    fn release(&mut self, base: usize, size: usize) -> Result<()> {
        (**self).release(base, size)
    }
}

/// Number of 64-bit words in a [`RegionSupplier`] page bitmap.
const BITMAP_WORDS: usize = 64;
/// Maximum number of pages a [`RegionSupplier`] can track.
pub const REGION_MAX_PAGES: usize = BITMAP_WORDS * 64;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment).checked_add(1)?.checked_mul(increment)
}

/// A first-fit page allocator over one donated region.
///
/// Pages are tracked by a bitmap; a set bit means the page is handed out.
pub struct RegionSupplier {
    base: usize,
    page_size: usize,
    pages: usize,
    bitmap: [u64; BITMAP_WORDS],
    // Just for tracking
    acquisitions: usize,
    releases: usize,
}

// The region is owned exclusively by the supplier.
unsafe impl Send for RegionSupplier {}

impl RegionSupplier {
    /// Manage `len` bytes at `start`, handed out in `page_size` pieces.
    ///
    /// The start is aligned up to `page_size`; any trailing partial page and
    /// any pages beyond [`REGION_MAX_PAGES`] are ignored.
    ///
    /// # Safety
    ///
    /// `start..start + len` must be valid for reads and writes for as long as
    /// the supplier (and any heap using it) exists, and nothing else may
    /// access it.
    pub unsafe fn from_raw_parts(start: NonNull<u8>, len: usize, page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= 16 && page_size >= RECORD_ALIGN,
            "page size {} must be a power of two of at least 16",
            page_size
        );
        let raw = start.as_ptr() as usize;
        let base = round_up(raw, page_size).unwrap_or(usize::MAX);
        let usable = (raw + len).saturating_sub(base);
        let pages = (usable / page_size).min(REGION_MAX_PAGES);

        RegionSupplier {
            base,
            page_size,
            pages,
            bitmap: [0; BITMAP_WORDS],
            acquisitions: 0,
            releases: 0,
        }
    }

    /// Manage a region that lives for the rest of the program.
    pub fn new(region: &'static mut [u8], page_size: usize) -> Self {
        let len = region.len();
        let start = NonNull::new(region.as_mut_ptr()).unwrap_or(NonNull::dangling());
        unsafe { Self::from_raw_parts(start, len, page_size) }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total number of pages managed.
    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Number of pages currently handed out.
    pub fn pages_in_use(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions
    }

    pub fn releases(&self) -> usize {
        self.releases
    }

    fn page_is_used(&self, page: usize) -> bool {
        (self.bitmap[page / 64] >> (page % 64)) & 1 == 1
    }

    fn mark(&mut self, first: usize, count: usize, used: bool) {
        for page in first..first + count {
            let bit = 1u64 << (page % 64);
            if used {
                self.bitmap[page / 64] |= bit;
            } else {
                self.bitmap[page / 64] &= !bit;
            }
        }
    }

    // First run of `count` free pages.
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for page in 0..self.pages {
            if self.page_is_used(page) {
                run_start = page + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        }
        None
    }
}

unsafe impl RawSupplier for RegionSupplier {
    fn granularity(&self) -> usize {
        self.page_size
    }

    fn acquire(&mut self, size: usize, _tag: Tag) -> Result<Segment> {
        if size == 0 {
            return Err(HeapError::InvalidArgument);
        }
        let count = round_up(size, self.page_size).ok_or(HeapError::OutOfMemory)? / self.page_size;
        // The heap reports the failure; suppliers run with its lock held.
        let first = self.find_run(count).ok_or(HeapError::OutOfMemory)?;

        self.mark(first, count, true);
        self.acquisitions += 1;

        Ok(Segment {
            base: self.base + first * self.page_size,
            size: count * self.page_size,
        })
    }

    fn release(&mut self, base: usize, size: usize) -> Result<()> {
        let end = self.base + self.pages * self.page_size;
        if base < self.base
            || base % self.page_size != 0
            || size % self.page_size != 0
            || size == 0
            || base + size > end
        {
            return Err(HeapError::InvalidArgument);
        }

        let first = (base - self.base) / self.page_size;
        let count = size / self.page_size;
        if (first..first + count).any(|page| !self.page_is_used(page)) {
            return Err(HeapError::InvalidArgument);
        }

        self.mark(first, count, false);
        self.releases += 1;
        Ok(())
    }
}

impl fmt::Debug for RegionSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionSupplier")
            .field("base", &(self.base as *const u8))
            .field("page_size", &self.page_size)
            .field("pages", &self.pages)
            .field("pages_in_use", &self.pages_in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::leak_region;
    use test_log::test;

    fn region(pages: usize, page_size: usize) -> RegionSupplier {
        RegionSupplier::new(leak_region(pages * page_size), page_size)
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 16), Some(0));
        assert_eq!(round_up(1, 16), Some(16));
        assert_eq!(round_up(16, 16), Some(16));
        assert_eq!(round_up(17, 16), Some(32));
        assert_eq!(round_up(usize::MAX, 16), None);
    }

    #[test]
    fn test_acquire_is_page_aligned_and_first_fit() {
        let mut supplier = region(8, 64);
        assert_eq!(supplier.page_count(), 8);

        let a = supplier.acquire(100, Tag::new("a")).unwrap();
        assert_eq!(a.size, 128);
        assert_eq!(a.base % 64, 0);

        let b = supplier.acquire(64, Tag::new("b")).unwrap();
        assert_eq!(b.base, a.end());
        assert_eq!(supplier.pages_in_use(), 3);

        supplier.release(a.base, a.size).unwrap();
        // A single page fits into the hole left by `a`
        let c = supplier.acquire(10, Tag::new("c")).unwrap();
        assert_eq!(c.base, a.base);
        assert_eq!(supplier.releases(), 1);
        assert_eq!(supplier.acquisitions(), 3);
    }

    #[test]
    fn test_exhaustion_and_bad_release() {
        let mut supplier = region(4, 64);
        let all = supplier.acquire(4 * 64, Tag::EMPTY).unwrap();
        assert_eq!(
            supplier.acquire(1, Tag::EMPTY),
            Err(HeapError::OutOfMemory)
        );
        assert_eq!(supplier.acquire(0, Tag::EMPTY), Err(HeapError::InvalidArgument));

        // Misaligned and out of range releases are refused
        assert_eq!(
            supplier.release(all.base + 1, 64),
            Err(HeapError::InvalidArgument)
        );
        assert_eq!(
            supplier.release(all.base, 8 * 64),
            Err(HeapError::InvalidArgument)
        );

        supplier.release(all.base, all.size).unwrap();
        // Releasing twice is refused
        assert_eq!(
            supplier.release(all.base, all.size),
            Err(HeapError::InvalidArgument)
        );
        assert_eq!(supplier.pages_in_use(), 0);
    }
}
