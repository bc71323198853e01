/// Counters kept by a [`FreeListAllocator`](crate::FreeListAllocator).
///
/// The totals and counts are monotonic until reset. Byte figures track the
/// sizes callers requested, not the larger spans actually consumed; the gap
/// between the two shows up in `fragmentation_ratio`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AllocStats {
    /// Total payload bytes handed out.
    pub total_allocated: usize,
    /// Total payload bytes returned.
    pub total_deallocated: usize,
    /// Payload bytes currently live.
    pub current_usage: usize,
    /// Number of successful allocations.
    pub allocation_count: usize,
    /// Number of deallocations.
    pub deallocation_count: usize,
    /// Number of allocation requests that could not be satisfied.
    pub failed_allocations: usize,
    /// Fraction of the bytes consumed by live allocations that are header
    /// and padding overhead rather than payload. 0.0 when nothing is live.
    pub fragmentation_ratio: f64,
}
