//! All the pointer arithmetic for a tracked block lives here. A block looks
//! like this:
//!
//! ```plaintext
//! block ---> +--------------------+
//!            | padding...         | offset bytes, a multiple of `align`
//!            | RecordHeader       |
//! user ----> +--------------------+
//!            | payload            | size bytes
//!            +--------------------+
//!            | tail sentinels     | tail bytes, all TAIL_SENTINEL
//!            +--------------------+
//! ```
//!
//! The header always ends exactly at the user pointer, so the header of any
//! user pointer can be found without knowing how the block was laid out.

use std::{
    alloc::Layout,
    mem,
    ptr::{self, NonNull},
    slice,
};

use super::record::{RecordHeader, TAIL_SENTINEL};
use crate::util::num::align_up;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    /// Requested payload size
    pub size: usize,
    /// Block start to user pointer
    pub offset: usize,
    pub tail: usize,
    pub align: usize,
}

impl BlockLayout {
    /// Lay out a block for `size` payload bytes. The user pointer is aligned
    /// to the largest of `min_align`, `request_align` and the header's own
    /// alignment. `None` if the block size overflows.
    pub fn new(size: usize, request_align: usize, min_align: usize, tail: usize) -> Option<Self> {
        let align = request_align
            .max(min_align)
            .max(mem::align_of::<RecordHeader>());
        let offset = align_up(mem::size_of::<RecordHeader>(), align)?;
        let layout = Self {
            size,
            offset,
            tail,
            align,
        };
        // Make sure the total is representable as a `Layout`
        layout.backing_layout()?;
        Some(layout)
    }

    /// The layout recorded in a live header
    pub fn of(record: &RecordHeader) -> Self {
        Self {
            size: record.size,
            offset: record.offset,
            tail: record.tail,
            align: record.align,
        }
    }

    /// Total bytes requested from the backing allocator
    pub fn total(&self) -> Option<usize> {
        self.offset.checked_add(self.size)?.checked_add(self.tail)
    }

    pub fn backing_layout(&self) -> Option<Layout> {
        Layout::from_size_align(self.total()?, self.align).ok()
    }

    /// Where the user's pointer goes in a block starting at `block`
    pub fn user_ptr(&self, block: NonNull<u8>) -> NonNull<u8> {
        // SAFETY: `offset` is inside the block by construction, so this is
        // in bounds and non-null
        unsafe { NonNull::new_unchecked(block.as_ptr().add(self.offset)) }
    }

    /// Where the header goes in a block starting at `block`
    pub fn header_ptr(&self, block: NonNull<u8>) -> NonNull<RecordHeader> {
        header_of(self.user_ptr(block).as_ptr())
    }

    /// Where the block started, given its header
    pub fn block_ptr(&self, header: NonNull<RecordHeader>) -> NonNull<u8> {
        let user = RecordHeader::user_ptr(header.as_ptr());
        // SAFETY: the header sits `offset - size_of::<RecordHeader>()` bytes
        // into the same block
        unsafe { NonNull::new_unchecked(user.sub(self.offset)) }
    }

    /// The tail padding region of a block whose user pointer is `user`.
    ///
    /// # Safety
    ///
    /// `user` must be the user pointer of a live block with this layout.
    pub unsafe fn tail<'a>(&self, user: *mut u8) -> &'a mut [u8] {
        unsafe { slice::from_raw_parts_mut(user.add(self.size), self.tail) }
    }

    /// Fill the tail padding with sentinels.
    ///
    /// # Safety
    ///
    /// `user` must be the user pointer of a block with this layout.
    pub unsafe fn write_tail(&self, user: *mut u8) {
        if self.tail > 0 {
            unsafe { ptr::write_bytes(user.add(self.size), TAIL_SENTINEL, self.tail) }
        }
    }
}

/// The header belonging to user pointer `user`. Only arithmetic, nothing is
/// read.
pub fn header_of(user: *mut u8) -> NonNull<RecordHeader> {
    let header = user.wrapping_sub(mem::size_of::<RecordHeader>()) as *mut RecordHeader;
    NonNull::new(header).unwrap_or(NonNull::dangling())
}
