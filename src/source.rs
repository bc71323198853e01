use std::ptr::NonNull;

use crate::platform;

/// Counters kept by a [`PageSource`]. All sizes are in page rounded bytes,
/// the totals only ever grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageSourceStats {
    /// Total bytes obtained from the OS.
    pub total_allocated: usize,
    /// Total bytes returned to the OS.
    pub total_deallocated: usize,
    /// Bytes currently mapped.
    pub current_usage: usize,
    /// Number of successful mapping calls.
    pub allocation_count: usize,
    /// Number of successful unmapping calls.
    pub deallocation_count: usize,
}

/// Hands out page aligned regions of anonymous memory obtained directly from
/// the operating system, bypassing the platform heap entirely. Sizes are
/// rounded up to whole pages on the way in and on the way out, so callers
/// can release with the same value they acquired with.
#[derive(Debug)]
pub struct PageSource {
    page_size: usize,
    stats: PageSourceStats,
}

impl PageSource {
    /// Builds a page source, reading the OS page size once.
    pub fn new() -> Self {
        let page_size = platform::page_size();

        // Every platform we target reports a small power of two.
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(page_size <= 64 * 1024);

        Self {
            page_size,
            stats: PageSourceStats::default(),
        }
    }

    /// The OS page size read at construction.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Rounds `size` up to the next page boundary.
    pub fn align_to_page(&self, size: usize) -> usize {
        (size + self.page_size - 1) & !(self.page_size - 1)
    }

    /// Maps at least `size` bytes of zero-filled memory, rounded up to whole
    /// pages. Returns `None` on failure, and for `size == 0` without
    /// touching the OS at all.
    pub fn acquire(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let length = size.checked_next_multiple_of(self.page_size)?;
        let address = unsafe { platform::map(length)? };

        self.stats.allocation_count += 1;
        self.stats.total_allocated += length;
        self.stats.current_usage += length;

        log::trace!("mapped {length} bytes at {address:p}");

        Some(address)
    }

    /// Returns a mapping to the OS. `size` must equal the value originally
    /// passed to [`acquire`](Self::acquire); it is rounded the same way. A
    /// null `address` is a no-op. If the kernel rejects the call the failure
    /// is reported and swallowed, the allocator has no way to recover a
    /// mapping the OS won't take back.
    ///
    /// # Safety
    ///
    /// `address` must be null or a pointer obtained from `acquire` that has
    /// not been released yet, with no outstanding references into the
    /// mapping.
    pub unsafe fn release(&mut self, address: *mut u8, size: usize) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        let length = self.align_to_page(size);

        if platform::unmap(address, length) {
            self.stats.deallocation_count += 1;
            self.stats.total_deallocated += length;
            self.stats.current_usage = self.stats.current_usage.saturating_sub(length);
            log::trace!("unmapped {length} bytes at {address:p}");
        } else {
            log::error!("failed to unmap {length} bytes at {address:p}, mapping leaked");
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PageSourceStats {
        self.stats
    }

    /// Zeroes the counters.
    pub fn reset_stats(&mut self) {
        self.stats = PageSourceStats::default();
    }
}

impl Default for PageSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trip() {
        let mut source = PageSource::new();
        let page = source.page_size();

        let address = source.acquire(page).unwrap();

        unsafe {
            // Freshly mapped memory is zero-filled and writable.
            for i in 0..page {
                assert_eq!(*address.as_ptr().add(i), 0);
            }
            address.as_ptr().write_bytes(0xAA, page);
            assert_eq!(*address.as_ptr().add(page - 1), 0xAA);
        }

        let stats = source.stats();
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.total_allocated, page);
        assert_eq!(stats.current_usage, page);

        unsafe { source.release(address.as_ptr(), page) };

        let stats = source.stats();
        assert_eq!(stats.deallocation_count, 1);
        assert_eq!(stats.total_deallocated, page);
        assert_eq!(stats.current_usage, 0);
    }

    #[test]
    fn sizes_round_up_to_whole_pages() {
        let source = PageSource::new();
        let page = source.page_size();

        assert_eq!(source.align_to_page(1), page);
        assert_eq!(source.align_to_page(page), page);
        assert_eq!(source.align_to_page(page + 1), page * 2);
    }

    #[test]
    fn odd_sizes_account_in_pages() {
        let mut source = PageSource::new();
        let page = source.page_size();

        let address = source.acquire(page + 1).unwrap();
        assert_eq!(source.stats().current_usage, page * 2);

        unsafe { source.release(address.as_ptr(), page + 1) };
        assert_eq!(source.stats().current_usage, 0);
    }

    #[test]
    fn zero_and_null_are_no_ops() {
        let mut source = PageSource::new();

        assert!(source.acquire(0).is_none());
        unsafe { source.release(std::ptr::null_mut(), 4096) };

        assert_eq!(source.stats(), PageSourceStats::default());
    }

    #[test]
    fn reset_clears_counters() {
        let mut source = PageSource::new();

        let address = source.acquire(1).unwrap();
        unsafe { source.release(address.as_ptr(), 1) };
        assert_ne!(source.stats(), PageSourceStats::default());

        source.reset_stats();
        assert_eq!(source.stats(), PageSourceStats::default());
    }
}
