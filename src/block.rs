//! Block metadata records and the small value types stamped on them.

use core::fmt;
use core::num::NonZeroU32;
use core::ops::Range;

use static_assertions::const_assert;

/// Number of bytes a [`Tag`] can hold.
pub const TAG_CAPACITY: usize = 15;
const_assert!(TAG_CAPACITY < u8::MAX as usize);

/// A short label describing the call site or purpose of an allocation.
///
/// Tags are stored inline in the block record, so anything longer than
/// [`TAG_CAPACITY`] bytes is truncated (at a `char` boundary).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag {
    bytes: [u8; TAG_CAPACITY],
    len: u8,
}

impl Tag {
    pub const EMPTY: Tag = Tag {
        bytes: [0; TAG_CAPACITY],
        len: 0,
    };

    pub fn new(label: &str) -> Tag {
        let mut len = label.len().min(TAG_CAPACITY);
        while !label.is_char_boundary(len) {
            len -= 1;
        }

        let mut tag = Tag::EMPTY;
        tag.bytes[..len].copy_from_slice(&label.as_bytes()[..len]);
        tag.len = len as u8;
        tag
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from a &str, cut at a char boundary.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Tag {
    fn default() -> Self {
        Tag::EMPTY
    }
}

impl From<&str> for Tag {
    fn from(label: &str) -> Self {
        Tag::new(label)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of whoever allocated a block: a process id, a thread id, or
/// [`Identity::KERNEL`]. Diagnostic only.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(pub u32);

impl Identity {
    pub const KERNEL: Identity = Identity(0);

    /// The id of the calling process.
    #[cfg(feature = "use_libc")]
    pub fn current_process() -> Identity {
        let pid = unsafe { libc::getpid() };
        Identity(pid as u32)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable handle of a block record inside the [`BlockPool`](crate::pool::BlockPool).
///
/// Ids are 1-based so that `Option<BlockId>` is the size of a `u32`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BlockId(NonZeroU32);

impl BlockId {
    pub(crate) fn from_index(index: usize) -> Option<BlockId> {
        let raw = u32::try_from(index).ok()?.checked_add(1)?;
        NonZeroU32::new(raw).map(BlockId)
    }

    pub(crate) fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.index())
    }
}

/// A metadata record describing one contiguous byte range.
///
/// While vacant, `next` links the record into the pool's freelist; otherwise
/// `prev`/`next` link it into the free or the used chain.
#[derive(Clone, Debug)]
#[repr(C, align(16))]
pub(crate) struct Block {
    pub start: usize,
    pub size: usize,
    pub segment_base: usize,
    pub segment_size: usize,
    pub owner: Option<Identity>,
    pub tag: Tag,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
}

/// Records are carved out of supplier memory, so every supplier granularity
/// must be at least this aligned.
pub(crate) const RECORD_ALIGN: usize = core::mem::align_of::<Block>();
const_assert!(RECORD_ALIGN <= 16);
const_assert!(core::mem::size_of::<Block>() <= 64);

impl Block {
    pub const VACANT: Block = Block {
        start: 0,
        size: 0,
        segment_base: 0,
        segment_size: 0,
        owner: None,
        tag: Tag::EMPTY,
        prev: None,
        next: None,
    };

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }

    pub fn segment(&self) -> Range<usize> {
        self.segment_base..(self.segment_base + self.segment_size)
    }

    /// Whether this block covers its whole backing segment.
    pub fn spans_segment(&self) -> bool {
        self.start == self.segment_base && self.size == self.segment_size
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            owner: self.owner,
            tag: self.tag,
            start: self.start,
            end: self.end(),
        }
    }
}

/// A snapshot of a used block, as returned by
/// [`Heap::describe_block`](crate::allocators::Heap::describe_block).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub owner: Option<Identity>,
    pub tag: Tag,
    pub start: usize,
    pub end: usize,
}

impl BlockInfo {
    pub const EMPTY: BlockInfo = BlockInfo {
        owner: None,
        tag: Tag::EMPTY,
        start: 0,
        end: 0,
    };

    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

impl Default for BlockInfo {
    fn default() -> Self {
        BlockInfo::EMPTY
    }
}
