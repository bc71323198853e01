use std::{
    alloc::{self, GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::{Mutex, PoisonError},
};

use crate::{
    alignment::NATURAL_ALIGNMENT,
    allocator::FreeListAllocator,
    source::PageSource,
    stats::AllocStats,
};

/// Process wide heap façade. Wraps one lazily built
/// [`FreeListAllocator`] behind a mutex so it can stand in for the platform
/// heap, including as the program's `#[global_allocator]`:
///
/// ```no_run
/// use spanalloc::GlobalHeap;
///
/// #[global_allocator]
/// static HEAP: GlobalHeap = GlobalHeap::new();
///
/// fn main() {
///     let numbers = vec![1, 2, 3];
///     assert_eq!(numbers.len(), 3);
///     assert!(HEAP.stats().allocation_count > 0);
/// }
/// ```
///
/// The page source and the engine are constructed on first use and never
/// torn down, so the façade stays safe to call until process exit no matter
/// how statics are destroyed around it. Every entry point takes the mutex
/// for its whole duration, which makes all heap operations appear in one
/// total order.
///
/// The engine never allocates through the façade and the façade itself
/// never logs, so its entry points cannot re-enter themselves. The engine's
/// own diagnostics do go through [`log`]; when the façade is installed as
/// the global allocator, any registered logger must not allocate while
/// handling them, or it will deadlock on the façade mutex.
pub struct GlobalHeap {
    engine: Mutex<Option<FreeListAllocator>>,
    initial_region_size: usize,
}

impl GlobalHeap {
    /// Initial region size used by [`new`](Self::new).
    pub const DEFAULT_INITIAL_REGION_SIZE: usize = 64 * 1024;

    /// Builds a façade with the default initial region size. Nothing is
    /// mapped until the first call.
    pub const fn new() -> Self {
        Self::with_initial_region_size(Self::DEFAULT_INITIAL_REGION_SIZE)
    }

    /// Builds a façade whose engine will start with a region of
    /// `initial_region_size` bytes.
    pub const fn with_initial_region_size(initial_region_size: usize) -> Self {
        Self {
            engine: Mutex::new(None),
            initial_region_size,
        }
    }

    /// Runs `operation` on the engine under the mutex, building the engine
    /// first if this is the first call.
    fn with_engine<R>(&self, operation: impl FnOnce(&mut FreeListAllocator) -> R) -> R {
        // A panic can only poison the lock between engine calls, never in
        // the middle of one, so the state behind a poisoned lock is intact.
        let mut guard = self.engine.lock().unwrap_or_else(PoisonError::into_inner);

        let engine = guard.get_or_insert_with(|| {
            FreeListAllocator::with_initial_region_size(PageSource::new(), self.initial_region_size)
        });

        operation(engine)
    }

    /// Allocates `size` bytes at natural pointer alignment. A zero `size`
    /// is served as one byte so distinct live allocations keep distinct
    /// addresses. When the heap is exhausted this signals out of memory
    /// through [`alloc::handle_alloc_error`] instead of returning.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        match self.allocate_nothrow(size) {
            Some(address) => address,
            None => {
                let layout = Layout::from_size_align(size.max(1), NATURAL_ALIGNMENT)
                    .unwrap_or(Layout::new::<usize>());
                alloc::handle_alloc_error(layout)
            }
        }
    }

    /// Same as [`allocate`](Self::allocate) but reports exhaustion as
    /// `None`.
    pub fn allocate_nothrow(&self, size: usize) -> Option<NonNull<u8>> {
        let size = size.max(1);
        self.with_engine(|engine| engine.allocate(size, NATURAL_ALIGNMENT))
    }

    /// Returns an allocation to the engine. Null and foreign pointers are
    /// tolerated the way the engine tolerates them. `size_hint` is
    /// informational only.
    ///
    /// # Safety
    ///
    /// `address` must be null, foreign, or a live pointer obtained from
    /// this façade, with no outstanding references into its payload.
    pub unsafe fn deallocate(&self, address: *mut u8, size_hint: usize) {
        self.with_engine(|engine| unsafe { engine.deallocate(address, size_hint) });
    }

    /// Whether `address` lies inside memory owned by the engine.
    pub fn owns(&self, address: *const u8) -> bool {
        self.with_engine(|engine| engine.owns(address))
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> AllocStats {
        self.with_engine(|engine| engine.stats())
    }

    /// Zeroes the engine counters.
    pub fn reset_stats(&self) {
        self.with_engine(|engine| engine.reset_stats());
    }
}

impl Default for GlobalHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        let align = layout.align();

        match self.with_engine(|engine| engine.allocate(size, align)) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, layout: Layout) {
        self.with_engine(|engine| unsafe { engine.deallocate(address, layout.size()) });
    }
}
