//! The single-threaded heap engine.
//!
//! A [`RawHeap`] owns every piece of mutable heap state: the free and used
//! chains, the record pool, the byte totals, and the supplier that backs
//! them. It is not thread-safe; [`Heap`](crate::allocators::Heap) wraps it in
//! a lock.
//!
//! Memory is tracked in *segments*, each one acquisition from the supplier.
//! Blocks are carved out of segments and never span two of them; a segment
//! whose blocks have all been freed and merged back together is handed back
//! to the supplier.

use core::fmt;

use crate::block::{BlockId, BlockInfo, Identity, Tag};
use crate::blocklist::{Chain, Validity};
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::pool::BlockPool;
use crate::supplier::{round_up, RawSupplier, Segment};

/// Counters describing the heap, as returned by
/// [`RawHeap::stats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Block records carved so far, whatever their state.
    pub total_records: usize,
    /// Records describing blocks in use.
    pub used_records: usize,
    /// Records describing free blocks.
    pub free_records: usize,
    /// Records waiting in the pool.
    pub vacant_records: usize,
    /// Bytes held in backing segments.
    pub total_bytes: usize,
    /// Bytes in blocks that are in use.
    pub used_bytes: usize,
    /// Bytes in free blocks.
    pub free_bytes: usize,
    /// Number of backing segments held.
    pub segments: usize,
}

/// A free block and the segment it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlockInfo {
    pub start: usize,
    pub size: usize,
    pub segment: Segment,
}

/// A best-fit heap over segments from a [`RawSupplier`].
pub struct RawHeap<S: RawSupplier> {
    supplier: S,
    config: HeapConfig,
    pool: BlockPool,
    free: Chain,
    used: Chain,
    total_bytes: usize,
    used_bytes: usize,
    segments: usize,
    // Set by the first successful allocation
    initialized: bool,
    quiet: bool,
}

impl<S: RawSupplier> RawHeap<S> {
    /// # Panics
    ///
    /// If `config` does not pass [`HeapConfig::validate`].
    pub const fn new(supplier: S, config: HeapConfig) -> Self {
        config.validate();
        let mut pool = BlockPool::new(config.records_per_batch);
        pool.quiet = config.quiet;
        RawHeap {
            supplier,
            pool,
            config,
            free: Chain::new(),
            used: Chain::new(),
            total_bytes: 0,
            used_bytes: 0,
            segments: 0,
            initialized: false,
            quiet: config.quiet,
        }
    }

    pub fn supplier(&self) -> &S {
        &self.supplier
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Turn logging off (or back on), returning the previous setting.
    pub fn set_quiet(&mut self, quiet: bool) -> bool {
        self.pool.quiet = quiet;
        core::mem::replace(&mut self.quiet, quiet)
    }

    /// The size of the block that a request for `size` bytes occupies, or
    /// `None` if rounding it up overflows.
    pub fn block_size(&self, size: usize) -> Option<usize> {
        round_up(size, self.config.alignment)
    }

    /// Allocate a block of at least `size` bytes, and return its address.
    ///
    /// Picks the smallest free block that fits, growing the heap once if
    /// there is none. Either a block is handed out or the chains are left as
    /// they were.
    pub fn allocate(&mut self, size: usize, tag: Tag, owner: Option<Identity>) -> Result<usize> {
        self.allocate_aligned(size, self.config.alignment, tag, owner)
    }

    /// Like [`allocate`](Self::allocate), with the address a multiple of
    /// `align`.
    ///
    /// Alignments beyond the configured one are met by placing the block
    /// inside a larger free block; the bytes in front of it stay free.
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        align: usize,
        tag: Tag,
        owner: Option<Identity>,
    ) -> Result<usize> {
        if size == 0 || !align.is_power_of_two() {
            return Err(HeapError::InvalidArgument);
        }
        let size = self.block_size(size).ok_or(HeapError::OutOfMemory)?;
        // Every block starts on the alignment unit already
        let align = if align <= self.config.alignment { 1 } else { align };

        // Records are reserved before the chains change, so a failure leaves
        // them as they were.
        let (id, pad) = match self.best_fit(size, align) {
            Some((id, pad)) => {
                let tail = self.pool.get(id).size - pad - size;
                self.pool.reserve(&mut self.supplier, (pad > 0) as usize + (tail > 0) as usize)?;
                (id, pad)
            }
            None => {
                let min_bytes = if align > self.supplier.granularity() {
                    size.checked_add(align).ok_or(HeapError::OutOfMemory)?
                } else {
                    size
                };
                let request = self.growth_request(min_bytes)?;
                // The segment's record, plus one for the remainder, plus one
                // for padding in front
                let records = if align > 1 { 3 } else { 1 + (request > size) as usize };
                self.pool.reserve(&mut self.supplier, records)?;
                self.add_segment(request)?;
                self.best_fit(size, align).ok_or(HeapError::OutOfMemory)?
            }
        };

        let chosen = self.pool.get(id).clone();
        let start = chosen.start + pad;
        let tail = chosen.size - pad - size;

        // Reserved above, unless the supplier handed out more than was asked
        let front = if pad > 0 { Some(self.pool.acquire(&mut self.supplier)?) } else { None };
        let rest = if tail > 0 {
            match self.pool.acquire(&mut self.supplier) {
                Ok(rest) => Some(rest),
                Err(err) => {
                    if let Some(front) = front {
                        self.pool.release(front);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let used = match front {
            Some(used) => {
                // The chosen record stays on the free chain as the padding
                self.pool.get_mut(id).size = pad;
                let block = self.pool.get_mut(used);
                block.start = start;
                block.segment_base = chosen.segment_base;
                block.segment_size = chosen.segment_size;
                used
            }
            None => {
                self.free.remove(&mut self.pool, id);
                id
            }
        };

        if let Some(rest) = rest {
            let remainder = self.pool.get_mut(rest);
            remainder.start = start + size;
            remainder.size = tail;
            remainder.segment_base = chosen.segment_base;
            remainder.segment_size = chosen.segment_size;
            self.free.sorted_insert(&mut self.pool, rest);
            heap_log!(
                self.quiet,
                trace,
                "split {} bytes off {:#x}:{}, {} in front and {} behind left free",
                size,
                chosen.start,
                chosen.size,
                pad,
                tail
            );
        }

        let block = self.pool.get_mut(used);
        block.size = size;
        block.owner = owner;
        block.tag = tag;
        self.used.sorted_insert(&mut self.pool, used);
        self.used_bytes += size;
        self.initialized = true;

        heap_log!(self.quiet, debug, "allocated {:#x}:{} for {:?}", start, size, tag);
        self.check_invariants();
        Ok(start)
    }

    // Smallest free block that can hold `size` bytes at an address aligned to
    // `align`, and the padding in front of that address. The first one found
    // wins a tie, so the lowest address does.
    fn best_fit(&self, size: usize, align: usize) -> Option<(BlockId, usize)> {
        let mut best: Option<(BlockId, usize, usize)> = None;
        for (id, block) in self.free.iter(&self.pool) {
            let Some(pad) = self.padding(block.start, block.size, size, align) else {
                continue;
            };
            if pad == 0 && block.size == size {
                return Some((id, 0));
            }
            if best.map_or(true, |(_, best_size, _)| block.size < best_size) {
                best = Some((id, block.size, pad));
            }
        }
        best.map(|(id, _, pad)| (id, pad))
    }

    // Bytes to skip from `start` to reach an address aligned to `align` with
    // `size` bytes behind it, inside a block of `available` bytes.
    fn padding(&self, start: usize, available: usize, size: usize, align: usize) -> Option<usize> {
        let pad = round_up(start, align)? - start;
        // Padding becomes a free block, so it must be whole units
        if pad % self.config.alignment != 0 || pad.checked_add(size)? > available {
            return None;
        }
        Some(pad)
    }

    /// Return the block starting at `address` to the free chain.
    ///
    /// The block's bytes are zeroed, it is merged with free neighbours from
    /// the same segment, and if that leaves its whole segment free, the
    /// segment goes back to the supplier.
    pub fn deallocate(&mut self, address: usize, tag: Tag) -> Result<()> {
        if address == 0 {
            return Err(HeapError::InvalidArgument);
        }
        if !self.initialized {
            return Err(HeapError::NotInitialized);
        }

        let id = self
            .used
            .iter(&self.pool)
            .find(|(_, block)| block.start == address)
            .map(|(id, _)| id)
            .ok_or(HeapError::NotFound)?;

        self.used.remove(&mut self.pool, id);
        let block = self.pool.get_mut(id);
        heap_log!(
            self.quiet,
            debug,
            "freeing {:#x}:{} (allocated for {:?}, freed for {:?})",
            block.start,
            block.size,
            block.tag,
            tag
        );
        // The range was handed out by the supplier and is owned by the heap
        // again now that it left the used chain.
        unsafe { core::ptr::write_bytes(block.start as *mut u8, 0, block.size) };
        block.owner = None;
        block.tag = Tag::EMPTY;
        self.used_bytes -= block.size;

        self.free.sorted_insert(&mut self.pool, id);
        self.coalesce(id);
        self.release_segment(id);

        self.check_invariants();
        Ok(())
    }

    // Merge `id` with its free neighbours when they are adjacent and from the
    // same segment. One merge per side is all there can be, since the chain
    // never holds two touching blocks of one segment.
    fn coalesce(&mut self, id: BlockId) {
        if let Some(prev) = self.pool.get(id).prev {
            let (before, block) = (self.pool.get(prev), self.pool.get(id));
            if before.segment_base == block.segment_base && before.end() == block.start {
                let (start, size) = (before.start, before.size);
                self.free.remove(&mut self.pool, prev);
                self.pool.release(prev);
                let block = self.pool.get_mut(id);
                block.start = start;
                block.size += size;
                heap_log!(self.quiet, trace, "merged {:#x}:{} into the following block", start, size);
            }
        }

        if let Some(next) = self.pool.get(id).next {
            let (block, after) = (self.pool.get(id), self.pool.get(next));
            if after.segment_base == block.segment_base && block.end() == after.start {
                let (start, size) = (after.start, after.size);
                self.free.remove(&mut self.pool, next);
                self.pool.release(next);
                self.pool.get_mut(id).size += size;
                heap_log!(self.quiet, trace, "merged {:#x}:{} into the preceding block", start, size);
            }
        }
    }

    // Hand the segment of free block `id` back, if `id` covers all of it.
    fn release_segment(&mut self, id: BlockId) {
        let block = self.pool.get(id);
        if !self.config.release_segments || !block.spans_segment() {
            return;
        }

        let (base, size) = (block.segment_base, block.segment_size);
        match self.supplier.release(base, size) {
            Ok(()) => {
                self.free.remove(&mut self.pool, id);
                self.pool.release(id);
                self.total_bytes -= size;
                self.segments -= 1;
                heap_log!(self.quiet, debug, "released segment {:#x}:{}", base, size);
            }
            Err(err) => {
                // The segment stays on the free chain and remains usable.
                heap_log!(self.quiet, warn, "supplier refused segment {:#x}:{}: {}", base, size, err);
            }
        }
    }

    /// Acquire a new segment of at least `min_bytes` and add it to the free
    /// chain as one block.
    ///
    /// The request is rounded up to the configured growth multiple, then to
    /// the supplier's granularity.
    pub fn grow(&mut self, min_bytes: usize) -> Result<()> {
        let request = self.growth_request(min_bytes)?;
        self.add_segment(request)
    }

    // Size of the segment to ask for, within the heap byte limit.
    fn growth_request(&self, min_bytes: usize) -> Result<usize> {
        let unit = self.supplier.granularity().max(self.config.alignment);
        let request = round_up(min_bytes.max(1), self.config.growth_multiple)
            .and_then(|bytes| round_up(bytes, unit))
            .ok_or(HeapError::OutOfMemory)?;

        if let Some(max) = self.config.max_heap_bytes {
            if self.total_bytes.checked_add(request).map_or(true, |total| total > max) {
                heap_log!(
                    self.quiet,
                    debug,
                    "growing by {} would exceed the {} byte limit ({} held)",
                    request,
                    max,
                    self.total_bytes
                );
                return Err(HeapError::OutOfMemory);
            }
        }
        Ok(request)
    }

    fn add_segment(&mut self, request: usize) -> Result<()> {
        let id = self.pool.acquire(&mut self.supplier)?;
        let segment = match self.supplier.acquire(request, Tag::new("heap-segment")) {
            Ok(segment) => segment,
            Err(err) => {
                self.pool.release(id);
                heap_log!(self.quiet, debug, "supplier could not provide {} bytes: {}", request, err);
                return Err(HeapError::OutOfMemory);
            }
        };

        let block = self.pool.get_mut(id);
        block.start = segment.base;
        block.size = segment.size;
        block.segment_base = segment.base;
        block.segment_size = segment.size;
        self.free.sorted_insert(&mut self.pool, id);
        self.total_bytes += segment.size;
        self.segments += 1;

        heap_log!(
            self.quiet,
            debug,
            "grew heap by {:#x}:{} ({} bytes held)",
            segment.base,
            segment.size,
            self.total_bytes
        );
        Ok(())
    }

    /// Describe the used block containing `address`.
    pub fn describe_block(&self, address: usize) -> Result<BlockInfo> {
        self.used
            .iter(&self.pool)
            .find(|(_, block)| block.range().contains(&address))
            .map(|(_, block)| block.info())
            .ok_or(HeapError::NotFound)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_records: self.pool.records(),
            used_records: self.used.len(),
            free_records: self.free.len(),
            vacant_records: self.pool.vacant_count(),
            total_bytes: self.total_bytes,
            used_bytes: self.used_bytes,
            free_bytes: self.total_bytes - self.used_bytes,
            segments: self.segments,
        }
    }

    /// Used blocks, in address order.
    pub fn used_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.used.iter(&self.pool).map(|(_, block)| block.info())
    }

    /// Free blocks, in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlockInfo> + '_ {
        self.free.iter(&self.pool).map(|(_, block)| FreeBlockInfo {
            start: block.start,
            size: block.size,
            segment: Segment {
                base: block.segment_base,
                size: block.segment_size,
            },
        })
    }

    /// Copy up to `out.len()` used blocks into `out`, in address order, and
    /// return how many were written.
    pub fn list_used_blocks(&self, out: &mut [BlockInfo]) -> usize {
        let mut written = 0;
        for (slot, info) in out.iter_mut().zip(self.used_blocks()) {
            *slot = info;
            written += 1;
        }
        written
    }

    /// Walk both chains and the pool, and report everything that breaks the
    /// heap's invariants.
    pub fn self_check(&self) -> Validity {
        let mut validity = Validity::default();

        let used = self.used.validate(&self.pool, false, &mut validity);
        let free = self.free.validate(&self.pool, true, &mut validity);

        if used.size != self.used_bytes {
            validity.accounting += 1;
        }
        if free.size + self.used_bytes != self.total_bytes {
            validity.accounting += 1;
        }

        validity.overlaps += self.cross_chain_overlaps();

        let vacant = self.pool.vacant_ids().take(self.pool.records() + 1).count();
        let reachable = used.length + free.length + vacant;
        validity.lost_records += self.pool.records().abs_diff(reachable);

        validity
    }

    // Both chains are sorted, so one merge pass finds every used block that
    // overlaps a free one.
    fn cross_chain_overlaps(&self) -> usize {
        let mut overlaps = 0;
        let mut used = self.used.iter(&self.pool).peekable();
        let mut free = self.free.iter(&self.pool).peekable();

        while let (Some((_, u)), Some((_, f))) = (used.peek(), free.peek()) {
            if u.end() <= f.start {
                used.next();
            } else if f.end() <= u.start {
                free.next();
            } else {
                overlaps += 1;
                if u.end() <= f.end() {
                    used.next();
                } else {
                    free.next();
                }
            }
        }

        overlaps
    }

    #[cfg(feature = "strict_checks")]
    fn check_invariants(&self) {
        let validity = self.self_check();
        if !validity.is_valid() {
            // A corrupted heap cannot be continued from.
            panic!("heap invariants broken: {:?}\n{}", validity, self);
        }
    }

    #[cfg(not(feature = "strict_checks"))]
    fn check_invariants(&self) {}
}

impl<S: RawSupplier> fmt::Display for RawHeap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawHeap(used: {}, free: {}, {}/{} bytes used)",
            self.used.display(&self.pool),
            self.free.display(&self.pool),
            self.used_bytes,
            self.total_bytes
        )
    }
}

impl<S: RawSupplier> Drop for RawHeap<S> {
    fn drop(&mut self) {
        // Every segment has exactly one block starting at its base, in
        // either chain.
        for (_, block) in self.used.iter(&self.pool).chain(self.free.iter(&self.pool)) {
            if block.start != block.segment_base {
                continue;
            }
            if let Err(err) = self.supplier.release(block.segment_base, block.segment_size) {
                heap_log!(self.quiet, warn, "failed to release segment {:#x}: {}", block.segment_base, err);
            }
        }
        self.pool.release_batches(&mut self.supplier);
    }
}
