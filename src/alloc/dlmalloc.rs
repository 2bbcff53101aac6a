use std::alloc::{GlobalAlloc, Layout};

use dlmalloc::GlobalDlmalloc;

// https://gee.cs.oswego.edu/dl/html/malloc.html

/// Requests at or below this alignment take dlmalloc's plain `malloc()`
/// path, anything stricter goes through `memalign()`.
pub const DLMALLOC_MIN_ALIGN: usize = 2 * std::mem::size_of::<usize>();

/// A backing allocator for [`crate::Tracker`] built on Doug Lea's malloc.
/// Keeps the tracked heap apart from the system heap, so a tracker over
/// `DlMalloc` can sit next to (or underneath) a tracker over `System`
/// without the two ever seeing each other's blocks.
pub struct DlMalloc(GlobalDlmalloc);

impl DlMalloc {
    pub const fn new() -> Self {
        Self(GlobalDlmalloc)
    }
}

impl Default for DlMalloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for DlMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: identical contract to the caller's
        unsafe { self.0.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { self.0.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, data: *mut u8, layout: Layout) {
        // SAFETY: the caller is required to give us a pointer from this
        // allocator with the layout it was allocated with
        unsafe { self.0.dealloc(data, layout) }
    }

    unsafe fn realloc(&self, data: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { self.0.realloc(data, layout, new_size) }
    }
}
