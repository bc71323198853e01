use std::{mem, ptr::NonNull};

use crate::{
    alignment::{self, effective_alignment},
    freelist::FreeList,
    header::{AllocHeader, ALLOC_HEADER_SIZE},
    region::{self, Region, MIN_INITIAL_REGION_SIZE, REGION_HEADER_SIZE},
    source::PageSource,
    span::{SpanDescriptor, SPAN_DESC_SIZE},
    stats::AllocStats,
    Pointer,
};

/// Upper bound on merge passes per deallocation. The scan restarts after
/// every merge and normally settles after a handful of passes; the bound
/// keeps a corrupted list from looping forever.
const MAX_COALESCE_PASSES: usize = 100;

/// The free list engine. Owns a chain of OS supplied regions, partitions
/// them into allocations and free spans, and serves aligned byte requests
/// out of a single shared free list, growing the chain when nothing fits.
///
/// Allocating splits the first fitting span, leaving the unused prefix and
/// suffix on the free list:
///
/// ```text
/// Before:
///       +-------------------------------------------------+
///       |                   Free span                     |
///       +-------------------------------------------------+
/// After allocate(size, align):
///       +----------+--------+---------------+-------------+
///       |   Free   | Header |    Payload    |    Free     |
///       +----------+--------+---------------+-------------+
///                           ^
///                           returned pointer, `align`ed
/// ```
///
/// Deallocating runs the other way: the header below the pointer gives back
/// the original span, which rejoins the list and is merged with any address
/// adjacent free neighbour in the same region.
///
/// The engine assumes exclusive access; it is an ordinary single threaded
/// object. [`GlobalHeap`](crate::GlobalHeap) is the shared, mutex guarded
/// wrapper.
pub struct FreeListAllocator {
    /// Where regions come from and go back to.
    source: PageSource,
    /// One free list shared across all regions.
    free_spans: FreeList,
    /// Head of the region chain, newest first.
    regions: Pointer<Region>,
    /// Number of regions in the chain.
    region_count: usize,
    /// Lower bound on the body of every region the engine requests.
    initial_region_size: usize,
    /// Public counters.
    stats: AllocStats,
    /// Span bytes consumed by live allocations, headers and padding
    /// included. Feeds the fragmentation ratio.
    live_span_bytes: usize,
}

// The engine exclusively owns every byte its raw pointers reach, so moving
// it to another thread is sound.
unsafe impl Send for FreeListAllocator {}

impl FreeListAllocator {
    /// Initial region size used by [`new`](Self::new).
    pub const DEFAULT_INITIAL_REGION_SIZE: usize = 64 * 1024;

    /// Builds an engine with the default initial region size.
    pub fn new(source: PageSource) -> Self {
        Self::with_initial_region_size(source, Self::DEFAULT_INITIAL_REGION_SIZE)
    }

    /// Builds an engine that starts with a region of `initial_region_size`
    /// bytes, raised if necessary to the smallest size that still fits a
    /// region descriptor and a useful free span. The initial region is
    /// mapped right away; if the OS refuses, the engine starts empty and
    /// the first allocation tries again through the grow path.
    pub fn with_initial_region_size(source: PageSource, initial_region_size: usize) -> Self {
        let initial_region_size = initial_region_size.max(MIN_INITIAL_REGION_SIZE);

        let mut engine = Self {
            source,
            free_spans: FreeList::new(),
            regions: None,
            region_count: 0,
            initial_region_size,
            stats: AllocStats::default(),
            live_span_bytes: 0,
        };

        unsafe {
            if engine.request_region(initial_region_size).is_none() {
                log::warn!("could not map the initial {initial_region_size} byte region");
            }
        }

        engine
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Zero `size` yields `None` without touching any state. An `align` of
    /// zero or one that is not a power of two is replaced by the natural
    /// pointer alignment. On success the returned pointer is owned by the
    /// engine, honours `align`, and exactly `size` bytes starting at it may
    /// be written. `None` means neither the free list nor a freshly grown
    /// region could take the request.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let align = effective_alignment(align);

        unsafe {
            let Some(descriptor) = self.find_or_grow(size, align) else {
                self.stats.failed_allocations += 1;
                return None;
            };

            let address = self.place(descriptor, size, align);

            self.stats.allocation_count += 1;
            self.stats.total_allocated += size;
            self.stats.current_usage += size;

            Some(address)
        }
    }

    /// Returns `address` to the free list and merges it with any adjacent
    /// free spans.
    ///
    /// A null `address` is a no-op. A pointer that no owned region contains
    /// is reported and dropped; there is no header below it we could trust.
    /// `size_hint` is informational only, the header is authoritative.
    ///
    /// # Safety
    ///
    /// `address` must be null, foreign, or a pointer obtained from
    /// [`allocate`](Self::allocate) on this engine that has not been freed
    /// since, with no outstanding references into its payload.
    pub unsafe fn deallocate(&mut self, address: *mut u8, _size_hint: usize) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        if self.region_containing(address.as_ptr() as usize).is_none() {
            log::warn!("ignoring deallocation of foreign pointer {address:p}");
            return;
        }

        let header_address = AllocHeader::from_user_address(address);
        let header = header_address.as_ptr().read();
        let start = AllocHeader::span_start_of(header_address);

        self.free_spans.insert_span(start, header.span);

        self.stats.deallocation_count += 1;
        self.stats.total_deallocated += header.requested;
        self.stats.current_usage = self.stats.current_usage.saturating_sub(header.requested);
        self.live_span_bytes = self.live_span_bytes.saturating_sub(header.span);

        self.coalesce();
    }

    /// Whether `address` lies inside any region owned by this engine.
    pub fn owns(&self, address: *const u8) -> bool {
        self.region_containing(address as usize).is_some()
    }

    /// Snapshot of the counters. The fragmentation ratio is derived at
    /// snapshot time from the live span and payload byte gauges.
    pub fn stats(&self) -> AllocStats {
        let mut stats = self.stats;

        stats.fragmentation_ratio = if self.live_span_bytes > 0 {
            let overhead = self.live_span_bytes.saturating_sub(self.stats.current_usage);
            overhead as f64 / self.live_span_bytes as f64
        } else {
            0.0
        };

        stats
    }

    /// Zeroes all counters and gauges.
    pub fn reset_stats(&mut self) {
        self.stats = AllocStats::default();
        self.live_span_bytes = 0;
    }

    /// Number of regions currently owned.
    pub fn region_count(&self) -> usize {
        self.region_count
    }

    /// The page source backing this engine.
    pub fn page_source(&self) -> &PageSource {
        &self.source
    }

    /// Logs every free span at debug level. Purely a debugging aid.
    pub fn dump_free_list(&self) {
        log::debug!("free list holds {} spans", self.free_spans.len());

        unsafe {
            for descriptor in self.free_spans.iter() {
                log::debug!(
                    "  span at {:#x}, {} bytes",
                    SpanDescriptor::start(descriptor),
                    descriptor.as_ref().data.size,
                );
            }
        }
    }

    /// First fit search, growing the heap and retrying exactly once when
    /// nothing on the list is suitable.
    unsafe fn find_or_grow(&mut self, size: usize, align: usize) -> Pointer<SpanDescriptor> {
        if let Some(descriptor) = self.free_spans.find_fit(size, align) {
            return Some(descriptor);
        }

        let length = region::grow_request_size(size, align, self.initial_region_size)?;
        self.request_region(length)?;

        self.free_spans.find_fit(size, align)
    }

    /// Maps a new region of at least `length` bytes, chains it at the head
    /// of the region list and splices its body into the free list as one
    /// span.
    unsafe fn request_region(&mut self, length: usize) -> Pointer<Region> {
        let address = self.source.acquire(length)?;
        let length = self.source.align_to_page(length);

        let region = address.cast::<Region>();
        region.as_ptr().write(Region {
            next: self.regions,
            size: length,
        });

        self.regions = Some(region);
        self.region_count += 1;

        self.free_spans
            .insert_span(Region::body_of(region), length - REGION_HEADER_SIZE);

        log::debug!("new region of {length} bytes at {region:p}");

        Some(region)
    }

    /// Carves an allocation out of `descriptor`, which must fit it. Returns
    /// the user pointer and leaves any worthwhile leftovers on the free
    /// list.
    unsafe fn place(&mut self, descriptor: NonNull<SpanDescriptor>, size: usize, align: usize) -> NonNull<u8> {
        let span_base = SpanDescriptor::start(descriptor);
        let span_size = descriptor.as_ref().data.size;

        self.free_spans.remove_span(descriptor);
        let base = descriptor.cast::<u8>();

        // Offsets relative to the span base. The user pointer lands on the
        // first `align` boundary that leaves room for the header below it.
        let user = alignment::align_up(span_base + ALLOC_HEADER_SIZE, align) - span_base;
        let mut start = 0;
        let mut prefix = user - ALLOC_HEADER_SIZE;

        // A prefix big enough to describe itself becomes its own free span,
        // anything smaller is absorbed into the allocation.
        if prefix >= SPAN_DESC_SIZE {
            self.free_spans.insert_span(base, prefix);
            start = prefix;
            prefix = 0;
        }

        // The suffix is cut on a descriptor aligned boundary so the span
        // written there is valid; the rounding slack stays with the
        // allocation. Span starts and sizes are always pointer aligned, so
        // the cut can never overshoot the span end.
        let cut = alignment::align_up(user + size, mem::align_of::<SpanDescriptor>());
        let span = if span_size - cut >= SPAN_DESC_SIZE {
            let suffix = NonNull::new_unchecked(base.as_ptr().add(cut));
            self.free_spans.insert_span(suffix, span_size - cut);
            cut - start
        } else {
            span_size - start
        };

        let header = NonNull::new_unchecked(
            base.as_ptr().add(user - ALLOC_HEADER_SIZE).cast::<AllocHeader>(),
        );
        header.as_ptr().write(AllocHeader {
            span,
            requested: size,
            prefix,
        });

        self.live_span_bytes += span;

        AllocHeader::user_address_of(header)
    }

    /// Merges address adjacent free spans until a full scan finds none.
    /// Only spans inside the same region are merged; two spans that touch
    /// numerically across a region boundary stay separate.
    unsafe fn coalesce(&mut self) {
        let mut passes = 0;

        while let Some((mut earlier, later)) = self.adjacent_pair() {
            passes += 1;
            if passes > MAX_COALESCE_PASSES {
                log::warn!(
                    "coalesce stopped after {MAX_COALESCE_PASSES} passes, \
                     free list left partially merged"
                );
                return;
            }

            earlier.as_mut().data.size += later.as_ref().data.size;
            self.free_spans.remove_span(later);
        }
    }

    /// Finds any two free spans where one ends exactly where the other
    /// begins inside the same region, regardless of their list order.
    unsafe fn adjacent_pair(&self) -> Option<(NonNull<SpanDescriptor>, NonNull<SpanDescriptor>)> {
        let mut current = self.free_spans.head();

        while let Some(earlier) = current {
            let end = SpanDescriptor::end(earlier);
            let mut candidate = self.free_spans.head();

            while let Some(later) = candidate {
                if later != earlier
                    && SpanDescriptor::start(later) == end
                    && self.same_region(earlier, later)
                {
                    return Some((earlier, later));
                }

                candidate = later.as_ref().next;
            }

            current = earlier.as_ref().next;
        }

        None
    }

    unsafe fn same_region(&self, a: NonNull<SpanDescriptor>, b: NonNull<SpanDescriptor>) -> bool {
        match (
            self.region_containing(SpanDescriptor::start(a)),
            self.region_containing(SpanDescriptor::start(b)),
        ) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// The region whose mapping contains `address`, if any.
    fn region_containing(&self, address: usize) -> Pointer<Region> {
        let mut current = self.regions;

        while let Some(region) = current {
            unsafe {
                if Region::contains(region, address) {
                    return Some(region);
                }

                current = region.as_ref().next;
            }
        }

        None
    }
}

impl Drop for FreeListAllocator {
    /// Returns every region to the page source. Live pointers into the
    /// engine, if the caller leaked any, dangle from here on.
    fn drop(&mut self) {
        self.free_spans = FreeList::new();
        let mut current = self.regions.take();

        while let Some(region) = current {
            unsafe {
                current = region.as_ref().next;
                let length = region.as_ref().size;
                self.source.release(region.as_ptr().cast(), length);
            }
        }

        self.region_count = 0;
    }
}
