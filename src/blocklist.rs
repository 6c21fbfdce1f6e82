use core::fmt;

use crate::block::{Block, BlockId};
use crate::pool::BlockPool;

/// An enum for easy comparison of blocks and their order
pub(crate) enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

impl Relation {
    /// How `this` is placed relative to `other`.
    pub fn of(this: &Block, other: &Block) -> Relation {
        if this.end() < other.start {
            Relation::Before
        } else if this.end() == other.start {
            Relation::AdjacentBefore
        } else if this.start < other.end() {
            Relation::Overlapping
        } else if this.start == other.end() {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }
}

/// A `Chain` is a doubly linked list of blocks, kept sorted by start address.
///
/// The links live in the block records themselves, so every operation takes
/// the [`BlockPool`] the records belong to. A block is a member of at most
/// one chain at a time.
///
/// It maintains a few internal invariants:
///
/// - `head` has no `prev`, the last member has no `next`.
/// - For each member, `next.prev` points back at it.
/// - Each member starts before its `next`, and they do not overlap.
#[derive(Default)]
pub(crate) struct Chain {
    head: Option<BlockId>,
    len: usize,
}

impl Chain {
    pub const fn new() -> Self {
        Chain { head: None, len: 0 }
    }

    #[cfg(test)]
    pub fn head(&self) -> Option<BlockId> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter<'pool>(&self, pool: &'pool BlockPool) -> ChainIter<'pool> {
        ChainIter {
            pool,
            next: self.head,
        }
    }

    /// Insert `id` before the first member that starts after it, or at the
    /// end of the chain.
    pub fn sorted_insert(&mut self, pool: &mut BlockPool, id: BlockId) {
        let start = pool.get(id).start;

        let mut prev = None;
        let mut cursor = self.head;
        while let Some(member) = cursor {
            let block = pool.get(member);
            if block.start > start {
                break;
            }
            prev = cursor;
            cursor = block.next;
        }

        self.link(pool, id, prev, cursor);
    }

    fn link(
        &mut self,
        pool: &mut BlockPool,
        id: BlockId,
        prev: Option<BlockId>,
        next: Option<BlockId>,
    ) {
        let block = pool.get_mut(id);
        block.prev = prev;
        block.next = next;

        match prev {
            Some(p) => pool.get_mut(p).next = Some(id),
            None => self.head = Some(id),
        }
        if let Some(n) = next {
            pool.get_mut(n).prev = Some(id);
        }
        self.len += 1;
    }

    /// Unlink `id` from this chain. `id` must be a member.
    pub fn remove(&mut self, pool: &mut BlockPool, id: BlockId) {
        let block = pool.get_mut(id);
        let prev = block.prev.take();
        let next = block.next.take();

        match prev {
            Some(p) => pool.get_mut(p).next = next,
            None => {
                debug_assert_eq!(self.head, Some(id), "removing a block from the wrong chain");
                self.head = next;
            }
        }
        if let Some(n) = next {
            pool.get_mut(n).prev = prev;
        }
        self.len -= 1;
    }

    pub fn display<'a>(&'a self, pool: &'a BlockPool) -> ChainDisplay<'a> {
        ChainDisplay { chain: self, pool }
    }

    /// Walk the chain, adding every defect found to `validity`.
    ///
    /// With `merged` set, two members of the same segment that touch are
    /// counted as a defect, as they should have been coalesced.
    pub fn validate(&self, pool: &BlockPool, merged: bool, validity: &mut Validity) -> ChainTotals {
        let mut totals = ChainTotals::default();

        let mut previous: Option<(BlockId, &Block)> = None;
        for (id, block) in self.iter(pool) {
            if block.prev != previous.map(|(p, _)| p) {
                validity.broken_links += 1;
            }
            if block.start < block.segment_base || block.end() > block.segment().end {
                validity.cross_segment += 1;
            }

            // The first in the chain has nothing to compare against.
            if let Some((_, p)) = previous {
                match Relation::of(p, block) {
                    Relation::Before => {}
                    Relation::AdjacentBefore => {
                        // Right order; only a defect if these should be merged.
                        if merged && p.segment_base == block.segment_base {
                            validity.adjacents += 1;
                        }
                    }
                    Relation::Overlapping => {
                        // This is really bad.
                        validity.overlaps += 1;
                    }
                    Relation::AdjacentAfter | Relation::After => {
                        validity.out_of_orders += 1;
                    }
                }
            }

            totals.length += 1;
            totals.size += block.size;
            previous = Some((id, block));

            if totals.length > pool.records() {
                // A cycle; stop before looping forever
                validity.broken_links += 1;
                break;
            }
        }

        if totals.length != self.len {
            validity.broken_links += 1;
        }

        totals
    }
}

pub(crate) struct ChainIter<'pool> {
    pool: &'pool BlockPool,
    next: Option<BlockId>,
}

impl<'pool> Iterator for ChainIter<'pool> {
    type Item = (BlockId, &'pool Block);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        let block = self.pool.get(id);
        self.next = block.next;
        Some((id, block))
    }
}

pub(crate) struct ChainDisplay<'a> {
    chain: &'a Chain,
    pool: &'a BlockPool,
}

impl fmt::Display for ChainDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chain(")?;
        let mut start = true;
        for (id, block) in self.chain.iter(self.pool) {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}[{:#x}, {}]", id, block.start, block.size)?;
        }

        write!(f, ")")
    }
}

/// Length and byte count of a chain, as found by walking it.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTotals {
    pub length: usize,
    pub size: usize,
}

/// Validity contains a representation of all invalid states found in a
/// heap.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping other blocks, in the same chain or across
    /// the free and used chains.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of free blocks directly adjacent to a free block of the same
    /// segment, and not merged.
    pub adjacents: usize,
    /// Number of blocks that do not have an address less than their next.
    pub out_of_orders: usize,
    /// Number of `prev` links that do not point back, cycles, or chain lengths
    /// that disagree with the recorded length.
    pub broken_links: usize,
    /// Number of blocks reaching outside their own segment.
    pub cross_segment: usize,
    /// Number of byte totals that disagree with the chains.
    pub accounting: usize,
    /// Number of records not reachable from either chain or the vacant pool.
    pub lost_records: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}
