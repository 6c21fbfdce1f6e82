//! The pool of block metadata records.
//!
//! Records cannot come from the heap they describe, so the pool asks the raw
//! supplier directly for batches of records, and hands them out by
//! [`BlockId`]. A batch is never given back while the pool lives: records that
//! are no longer needed go onto the vacant freelist instead.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::block::{Block, BlockId, Tag};
use crate::error::{HeapError, Result};
use crate::supplier::{RawSupplier, Segment};

/// Maximum number of batches a pool can hold.
pub const MAX_BATCHES: usize = 256;

const RECORD_SIZE: usize = size_of::<Block>();

// One acquisition of records, as the supplier returned it.
#[derive(Clone, Copy)]
struct Batch {
    records: NonNull<Block>,
    segment: Segment,
}

pub(crate) struct BlockPool {
    batches: [Option<Batch>; MAX_BATCHES],
    batch_count: usize,
    per_batch: usize,
    // Head of the vacant freelist, linked through `Block::next`
    vacant: Option<BlockId>,
    vacant_count: usize,
    pub quiet: bool,
}

// The batches are owned exclusively by the pool.
unsafe impl Send for BlockPool {}

impl BlockPool {
    pub const fn new(per_batch: usize) -> Self {
        BlockPool {
            batches: [None; MAX_BATCHES],
            batch_count: 0,
            per_batch,
            vacant: None,
            vacant_count: 0,
            quiet: false,
        }
    }

    /// Total number of records ever carved, live or vacant.
    pub fn records(&self) -> usize {
        self.batch_count * self.per_batch
    }

    pub fn vacant_count(&self) -> usize {
        self.vacant_count
    }

    #[cfg(test)]
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Bytes requested from the supplier for one batch.
    pub fn batch_bytes(&self) -> usize {
        self.per_batch * RECORD_SIZE
    }

    fn slot(&self, id: BlockId) -> NonNull<Block> {
        let index = id.index();
        let (batch, slot) = (index / self.per_batch, index % self.per_batch);
        let Some(batch) = self.batches.get(batch).copied().flatten() else {
            unreachable!("{} does not belong to this pool", id)
        };
        // The slot is within the batch, which holds `per_batch` records
        unsafe { NonNull::new_unchecked(batch.records.as_ptr().add(slot)) }
    }

    pub fn get(&self, id: BlockId) -> &Block {
        unsafe { self.slot(id).as_ref() }
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        unsafe { self.slot(id).as_mut() }
    }

    /// Request one more batch from the supplier and push all of its records
    /// onto the vacant freelist.
    fn add_batch<S: RawSupplier>(&mut self, supplier: &mut S) -> Result<()> {
        if self.batch_count == MAX_BATCHES {
            heap_log!(self.quiet, warn, "block pool exhausted: all {} batches in use", MAX_BATCHES);
            return Err(HeapError::OutOfMemory);
        }

        let segment = match supplier.acquire(self.batch_bytes(), Tag::new("block-pool")) {
            Ok(segment) => segment,
            Err(err) => {
                heap_log!(self.quiet, debug, "block pool: no batch of {} bytes: {}", self.batch_bytes(), err);
                return Err(err);
            }
        };
        let Some(base) = NonNull::new(segment.base as *mut Block) else {
            return Err(HeapError::OutOfMemory);
        };
        debug_assert!(segment.size >= self.batch_bytes());

        let first_index = self.batch_count * self.per_batch;
        self.batches[self.batch_count] = Some(Batch {
            records: base,
            segment,
        });
        self.batch_count += 1;

        // Push in reverse so the lowest slot is handed out first
        for slot in (0..self.per_batch).rev() {
            let id = BlockId::from_index(first_index + slot).ok_or(HeapError::OutOfMemory)?;
            unsafe { base.as_ptr().add(slot).write(Block::VACANT) };
            self.push_vacant(id);
        }

        heap_log!(
            self.quiet,
            debug,
            "block pool: batch {} at {:#x} adds {} records ({} total)",
            self.batch_count - 1,
            segment.base,
            self.per_batch,
            self.records()
        );
        Ok(())
    }

    fn push_vacant(&mut self, id: BlockId) {
        let head = self.vacant;
        self.get_mut(id).next = head;
        self.vacant = Some(id);
        self.vacant_count += 1;
    }

    /// Make sure at least `count` records are vacant.
    pub fn reserve<S: RawSupplier>(&mut self, supplier: &mut S, count: usize) -> Result<()> {
        while self.vacant_count < count {
            self.add_batch(supplier)?;
        }
        Ok(())
    }

    /// Take a vacant record, growing the pool if there are none.
    ///
    /// The record comes back in the vacant state: zero range, no links.
    pub fn acquire<S: RawSupplier>(&mut self, supplier: &mut S) -> Result<BlockId> {
        self.reserve(supplier, 1)?;
        let Some(id) = self.vacant else {
            return Err(HeapError::OutOfMemory);
        };

        let block = self.get_mut(id);
        let next = block.next.take();
        self.vacant = next;
        self.vacant_count -= 1;
        Ok(id)
    }

    /// Reset a record and return it to the vacant freelist.
    pub fn release(&mut self, id: BlockId) {
        *self.get_mut(id) = Block::VACANT;
        self.push_vacant(id);
    }

    /// Iterate over the vacant freelist.
    pub fn vacant_ids(&self) -> VacantIter<'_> {
        VacantIter {
            pool: self,
            next: self.vacant,
        }
    }

    /// Hand every batch back to the supplier, as large as it was handed
    /// out. All ids become invalid.
    pub fn release_batches<S: RawSupplier>(&mut self, supplier: &mut S) {
        for batch in self.batches[..self.batch_count].iter_mut() {
            if let Some(Batch { segment, .. }) = batch.take() {
                if let Err(err) = supplier.release(segment.base, segment.size) {
                    heap_log!(
                        self.quiet,
                        warn,
                        "block pool: failed to release batch at {:#x}: {}",
                        segment.base,
                        err
                    );
                }
            }
        }
        self.batch_count = 0;
        self.vacant = None;
        self.vacant_count = 0;
    }
}

pub(crate) struct VacantIter<'pool> {
    pool: &'pool BlockPool,
    next: Option<BlockId>,
}

impl<'pool> Iterator for VacantIter<'pool> {
    type Item = BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        self.next = self.pool.get(id).next;
        Some(id)
    }
}
