//! Allocation Tracking
//!
//! Install [`TrackingAllocator`] as the `#[global_allocator]` of a benchmark
//! binary to enable the `alloc` profiler. Counters are per thread, so each
//! worker thread of a fork sees only its own allocations.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static ALLOC_BYTES: Cell<u64> = const { Cell::new(0) };
    static ALLOC_COUNT: Cell<u64> = const { Cell::new(0) };
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Global allocator that counts bytes and calls on the current thread
pub struct TrackingAllocator;

#[inline(always)]
fn record(size: usize) {
    if !INSTALLED.load(Ordering::Relaxed) {
        INSTALLED.store(true, Ordering::Relaxed);
    }
    // try_with: the thread-local may already be gone during thread exit
    let _ = ALLOC_BYTES.try_with(|b| b.set(b.get().wrapping_add(size as u64)));
    let _ = ALLOC_COUNT.try_with(|c| c.set(c.get().wrapping_add(1)));
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record(new_size);
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

/// Zero the current thread's counters
#[inline]
pub fn reset_allocation_counter() {
    let _ = ALLOC_BYTES.try_with(|b| b.set(0));
    let _ = ALLOC_COUNT.try_with(|c| c.set(0));
}

/// `(bytes, count)` allocated on the current thread since the last reset
#[inline]
pub fn current_allocation() -> (u64, u64) {
    let bytes = ALLOC_BYTES.try_with(Cell::get).unwrap_or(0);
    let count = ALLOC_COUNT.try_with(Cell::get).unwrap_or(0);
    (bytes, count)
}

/// Whether [`TrackingAllocator`] serves this process's allocations
pub fn allocation_tracking_installed() -> bool {
    // Force one allocation so the flag is set even in a fresh process
    drop(std::hint::black_box(Box::new(0u64)));
    INSTALLED.load(Ordering::Relaxed)
}
