use std::{
    alloc::{GlobalAlloc, Layout},
    io,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use once_cell::sync::Lazy;

use crate::util::num::{align_up, round_up};

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain anonymous memory, owned by this value alone
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned region of at least `size` bytes,
    /// without reserving swap for it. Always at least one page.
    pub fn map_noreserve(size: usize) -> io::Result<MmapRegion> {
        let size = round_up(size.max(1), *PAGE_SIZE)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        // SAFETY: an anonymous private mapping at an address of the kernel's
        // choosing aliases nothing
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)?;
        Ok(MmapRegion { ptr, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr` is page-aligned and `size` bytes of it were mapped
        // by us and never partially unmapped
        unsafe {
            munmap(self.ptr.as_ptr() as _, self.size);
        }
    }
}

/// A bump allocator over one [`MmapRegion`]. `alloc()` is a pointer bump,
/// `dealloc()` does nothing, and allocation fails (returns null) once the
/// region is used up.
///
/// Since nothing is ever given back, a freed block stays readable until the
/// arena is dropped. That makes it the backing allocator to use when
/// double frees must be observable without touching unmapped memory.
pub struct StackArena {
    arena: MmapRegion,
    sp: AtomicUsize,
}

impl StackArena {
    /// A [`StackArena`] that can hold up to `capacity` bytes.
    pub fn new(capacity: usize) -> io::Result<Self> {
        log::debug!(target: "memwatch", "StackArena::new({capacity})");
        Ok(Self {
            arena: MmapRegion::map_noreserve(capacity)?,
            sp: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.arena.size()
    }

    /// Bytes handed out so far, alignment padding included
    pub fn used(&self) -> usize {
        self.sp.load(Ordering::Acquire)
    }
}

unsafe impl GlobalAlloc for StackArena {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let base = self.arena.ptr.as_ptr() as usize;
        let mut sp = self.sp.load(Ordering::Relaxed);
        loop {
            let Some(start) = align_up(base + sp, layout.align()).map(|addr| addr - base) else {
                return ptr::null_mut();
            };
            let end = match start.checked_add(layout.size()) {
                Some(end) if end <= self.arena.size => end,
                _ => return ptr::null_mut(),
            };
            match self
                .sp
                .compare_exchange_weak(sp, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                // SAFETY: `start..end` lies inside the mapping
                Ok(_) => return unsafe { self.arena.ptr.as_ptr().add(start) },
                Err(current) => sp = current,
            }
        }
    }

    unsafe fn dealloc(&self, _: *mut u8, _: Layout) {}
}
