use std::ptr::NonNull;

use crate::{
    header::ALLOC_HEADER_SIZE,
    list::LinkedList,
    span::{Span, SpanDescriptor, MIN_SPAN_SIZE},
    Pointer,
};

/// The free list. One doubly linked list of [`SpanDescriptor`] nodes shared
/// across every region, most recently released spans first. It is not
/// segregated by size or by region; allocation is a plain front to back
/// first fit walk.
///
/// Spans from different regions mix freely in the list:
///
/// ```text
///                   Points to span in next region           Points to same region
///                +--------------------------------------+   +-----------------------+
///                |                                      |   |                       |
/// +--------+-----|------------------+      +--------+---|---|-----------------------|-----+
/// |        | +---|---+    +-------+ |      |        | +-|---|-+    +-------+    +---|---+ |
/// | Region | | Free  | -> | Alloc | | ---> | Region | | Free  | -> | Alloc | -> | Free  | |
/// |        | +-------+    +-------+ |      |        | +-------+    +-------+    +-------+ |
/// +--------+------------------------+      +--------+-------------------------------------+
/// ```
pub(crate) type FreeList = LinkedList<Span>;

impl FreeList {
    /// Writes a fresh span descriptor at `address` and links it at the head
    /// of the list.
    ///
    /// # Safety
    ///
    /// `address` must point to at least `size` unused bytes inside a region,
    /// aligned for a descriptor, and `size` must be at least
    /// [`MIN_SPAN_SIZE`].
    pub unsafe fn insert_span(&mut self, address: NonNull<u8>, size: usize) -> NonNull<SpanDescriptor> {
        debug_assert!(size >= MIN_SPAN_SIZE);
        debug_assert_eq!(
            address.as_ptr() as usize % std::mem::align_of::<SpanDescriptor>(),
            0
        );

        self.push_front(Span { size }, address)
    }

    /// Unlinks `descriptor`. Its bytes are about to be reused, either by an
    /// allocation or by a merge into a neighbouring span.
    ///
    /// # Safety
    ///
    /// `descriptor` must be linked in this list.
    pub unsafe fn remove_span(&mut self, descriptor: NonNull<SpanDescriptor>) {
        self.remove(descriptor);
    }

    /// First fit search. Walks the list from the head and returns the first
    /// span that can hold `size` bytes at `align`, or `None` if no span is
    /// suitable.
    ///
    /// # Safety
    ///
    /// All linked descriptors must be valid.
    pub unsafe fn find_fit(&self, size: usize, align: usize) -> Pointer<SpanDescriptor> {
        let mut current = self.head();

        while let Some(descriptor) = current {
            if span_fits(descriptor, size, align) {
                return Some(descriptor);
            }

            current = descriptor.as_ref().next;
        }

        None
    }
}

/// Whether a span can hold a header plus `size` payload bytes at `align`.
///
/// The user pointer must land on an `align` boundary with the header right
/// below it, so the usable payload starts at
/// `align_up(start + header, align)`. The span fits when the bytes consumed
/// by that placement, prefix included, don't exceed its length.
///
/// # Safety
///
/// `descriptor` must point to a live span descriptor.
pub(crate) unsafe fn span_fits(
    descriptor: NonNull<SpanDescriptor>,
    size: usize,
    align: usize,
) -> bool {
    let start = SpanDescriptor::start(descriptor);

    // Checked math so absurd sizes or alignments fail the fit instead of
    // wrapping around the address space.
    let Some(user) = (start + ALLOC_HEADER_SIZE).checked_next_multiple_of(align) else {
        return false;
    };
    let prefix = user - ALLOC_HEADER_SIZE - start;

    match prefix.checked_add(ALLOC_HEADER_SIZE).and_then(|n| n.checked_add(size)) {
        Some(needed) => needed <= descriptor.as_ref().data.size,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::NATURAL_ALIGNMENT;

    /// A page worth of descriptor aligned bytes to carve spans from.
    #[repr(align(4096))]
    struct Arena([u8; 4096]);

    fn arena() -> Box<Arena> {
        Box::new(Arena([0; 4096]))
    }

    fn address_at(arena: &mut Arena, offset: usize) -> NonNull<u8> {
        NonNull::new(unsafe { arena.0.as_mut_ptr().add(offset) }).unwrap()
    }

    #[test]
    fn first_fit_prefers_the_head() {
        let mut arena = arena();
        let mut list = FreeList::new();

        unsafe {
            let far = list.insert_span(address_at(&mut arena, 1024), 512);
            let near = list.insert_span(address_at(&mut arena, 0), 512);

            // Both spans fit, the one inserted last is found first.
            let found = list.find_fit(64, NATURAL_ALIGNMENT).unwrap();
            assert_eq!(found, near);

            list.remove_span(near);
            let found = list.find_fit(64, NATURAL_ALIGNMENT).unwrap();
            assert_eq!(found, far);
        }
    }

    #[test]
    fn undersized_spans_are_skipped() {
        let mut arena = arena();
        let mut list = FreeList::new();

        unsafe {
            list.insert_span(address_at(&mut arena, 0), 64);
            let big = list.insert_span(address_at(&mut arena, 512), 1024);

            // 64 bytes can't hold header + 128 bytes of payload.
            let found = list.find_fit(128, NATURAL_ALIGNMENT).unwrap();
            assert_eq!(found, big);

            assert!(list.find_fit(4096, NATURAL_ALIGNMENT).is_none());
        }
    }

    #[test]
    fn fit_accounts_for_alignment_prefix() {
        let mut arena = arena();
        let mut list = FreeList::new();

        unsafe {
            // The arena base is 4096 aligned, so placing a 256 aligned user
            // pointer inside a span starting 8 bytes further costs a prefix
            // of up to 256 bytes that a tight span cannot pay.
            let tight = list.insert_span(address_at(&mut arena, 8), 256 + ALLOC_HEADER_SIZE);
            assert!(!span_fits(tight, 256, 256));

            let roomy = list.insert_span(address_at(&mut arena, 1024), 1024);
            assert!(span_fits(roomy, 256, 256));
        }
    }

    #[test]
    fn oversized_requests_do_not_wrap() {
        let mut arena = arena();
        let mut list = FreeList::new();

        unsafe {
            let span = list.insert_span(address_at(&mut arena, 0), 4096);
            assert!(!span_fits(span, usize::MAX, NATURAL_ALIGNMENT));
            assert!(!span_fits(span, 64, (usize::MAX >> 1) + 1));
        }
    }
}
