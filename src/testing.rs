//! Helpers shared by the unit tests.

extern crate std;

use std::boxed::Box;
use std::vec::Vec;

use crate::block::Tag;
use crate::error::Result;
use crate::supplier::{RawSupplier, RegionSupplier, Segment};

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Page([u8; 4096]);

/// Leak `bytes` zeroed bytes (rounded up to a whole number of 4 KiB pages
/// for the allocation, but exactly `bytes` long), starting 4 KiB aligned.
pub(crate) fn leak_region(bytes: usize) -> &'static mut [u8] {
    let pages = (bytes + 4095) / 4096;
    let memory: &'static mut [Page] = Box::leak(Vec::from_iter((0..pages).map(|_| Page([0; 4096]))).into_boxed_slice());
    unsafe { core::slice::from_raw_parts_mut(memory.as_mut_ptr() as *mut u8, bytes) }
}

/// A [`RegionSupplier`] that remembers every acquisition and release.
pub(crate) struct RecordingSupplier {
    pub inner: RegionSupplier,
    pub acquired: Vec<Segment>,
    pub released: Vec<Segment>,
}

impl RecordingSupplier {
    pub fn new(bytes: usize, page_size: usize) -> Self {
        RecordingSupplier {
            inner: RegionSupplier::new(leak_region(bytes), page_size),
            acquired: Vec::new(),
            released: Vec::new(),
        }
    }
}

unsafe impl RawSupplier for RecordingSupplier {
    fn granularity(&self) -> usize {
        self.inner.granularity()
    }

    fn acquire(&mut self, size: usize, tag: Tag) -> Result<Segment> {
        let segment = self.inner.acquire(size, tag)?;
        self.acquired.push(segment);
        Ok(segment)
    }

    fn release(&mut self, base: usize, size: usize) -> Result<()> {
        self.inner.release(base, size)?;
        self.released.push(Segment { base, size });
        Ok(())
    }
}
