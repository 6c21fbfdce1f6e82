/// Tuning knobs for a [`RawHeap`](crate::heap::RawHeap).
///
/// All builder methods are `const`, so a configured heap can live in a
/// `static`:
///
/// ```
/// use segment_heap::HeapConfig;
///
/// const CONFIG: HeapConfig = HeapConfig::new()
///     .with_alignment(16)
///     .with_growth_multiple(16 * 1024)
///     .with_max_heap_bytes(64 * 1024 * 1024);
/// assert_eq!(CONFIG.alignment, 16);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Every block size is a multiple of this. A power of two.
    pub alignment: usize,
    /// Growth requests are rounded up to a multiple of this before being
    /// rounded to the supplier's granularity.
    pub growth_multiple: usize,
    /// Number of block records requested from the supplier at once.
    pub records_per_batch: usize,
    /// Upper bound on the bytes held in backing segments.
    pub max_heap_bytes: Option<usize>,
    /// Whether a segment that becomes entirely free is handed back to the
    /// supplier. When off, free segments are kept for later requests.
    pub release_segments: bool,
    /// Keep the heap from logging. Set this on a heap that is also the global
    /// allocator, as a logger that allocates would come back into it while
    /// it is locked. Calls through `GlobalAlloc` are always quiet.
    pub quiet: bool,
}

pub const DEFAULT_GROWTH_MULTIPLE: usize = 64 * 1024;
pub const DEFAULT_RECORDS_PER_BATCH: usize = 64;

impl HeapConfig {
    pub const fn new() -> Self {
        HeapConfig {
            alignment: core::mem::size_of::<usize>(),
            growth_multiple: DEFAULT_GROWTH_MULTIPLE,
            records_per_batch: DEFAULT_RECORDS_PER_BATCH,
            max_heap_bytes: None,
            release_segments: true,
            quiet: false,
        }
    }

    /// Panic unless the knobs are usable. Fields can be set directly, so
    /// [`RawHeap::new`](crate::heap::RawHeap::new) checks them again here.
    pub const fn validate(&self) {
        assert!(self.alignment.is_power_of_two(), "alignment must be a power of two");
        assert!(self.growth_multiple > 0, "growth multiple must be positive");
        assert!(self.records_per_batch > 0, "a batch must hold at least one record");
    }

    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        self.alignment = alignment;
        self
    }

    pub const fn with_growth_multiple(mut self, growth_multiple: usize) -> Self {
        assert!(growth_multiple > 0, "growth multiple must be positive");
        self.growth_multiple = growth_multiple;
        self
    }

    pub const fn with_records_per_batch(mut self, records: usize) -> Self {
        assert!(records > 0, "a batch must hold at least one record");
        self.records_per_batch = records;
        self
    }

    pub const fn with_max_heap_bytes(mut self, max: usize) -> Self {
        self.max_heap_bytes = Some(max);
        self
    }

    pub const fn with_release_segments(mut self, release: bool) -> Self {
        self.release_segments = release;
        self
    }

    pub const fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
