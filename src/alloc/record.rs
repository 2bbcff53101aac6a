//! The metadata block in front of every tracked allocation.

use std::{fmt, panic::Location, str};

use serde::{Serialize, Serializer};

use crate::config::MAX_STACK_DEPTH;

/// Written at allocation, checked on every free and every sweep.
pub const MAGIC_LIVE: u32 = 0x4D57_A110;
/// Written on free, so a second free (or a dangling header) is caught.
pub const MAGIC_FREED: u32 = 0;
/// Blocks allocated from inside the tracker itself. Same layout, not
/// registered, not accounted.
pub const MAGIC_UNTRACKED: u32 = 0x4D57_0B5E;
/// Every tail padding byte holds this.
pub const TAIL_SENTINEL: u8 = 0xFD;

/// Maximum length of a project tag, in bytes.
pub const PROJECT_TAG_LEN: usize = 32;

/// A bounded, inline, `Copy` string. Truncated on a char boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize> {
    buf: [u8; N],
    len: u8,
}

impl<const N: usize> FixedStr<N> {
    pub const fn empty() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    pub fn new(s: &str) -> Self {
        // `len` is a `u8`
        let limit = N.min(u8::MAX as usize);
        let mut take = s.len().min(limit);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        let mut buf = [0; N];
        buf[..take].copy_from_slice(&s.as_bytes()[..take]);
        Self {
            buf,
            len: take as u8,
        }
    }

    /// `FixedStr::new()` from a C string, lossy
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match str::from_utf8(bytes) {
            Ok(s) => Self::new(s),
            Err(e) => Self::new(str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default()),
        }
    }

    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.buf[..self.len as usize]).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> Serialize for FixedStr<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub type ProjectTag = FixedStr<PROJECT_TAG_LEN>;

/// Where an allocation was requested from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Site {
    /// Supplied by the call site (`file!()`/`line!()` or `#[track_caller]`)
    Source { file: &'static str, line: u32 },
    /// Only a return address is known, resolve it lazily
    Caller(usize),
    Unknown,
}

impl Site {
    /// The location of whoever called the function this is called from.
    #[track_caller]
    pub fn here() -> Self {
        let location = Location::caller();
        Self::Source {
            file: location.file(),
            line: location.line(),
        }
    }

    pub const fn file_line(&self) -> Option<(&'static str, u32)> {
        match *self {
            Self::Source { file, line } => Some((file, line)),
            _ => None,
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source { file, line } => write!(f, "{file}:{line}"),
            Self::Caller(address) => write!(f, "{address:#x}"),
            Self::Unknown => f.write_str("<unknown>"),
        }
    }
}

const FLAG_ARRAY: u32 = 1;

/// Metadata every block carries. Lives immediately before the user pointer,
/// see [`super::layout::BlockLayout`] for where exactly.
///
/// `prev`/`next` belong to the registry, nobody else touches them.
#[repr(C)]
pub struct RecordHeader {
    pub(crate) prev: *mut RecordHeader,
    pub(crate) next: *mut RecordHeader,
    /// Requested payload size
    pub(crate) size: usize,
    /// Distance from block start to the user pointer
    pub(crate) offset: usize,
    /// Alignment the block was requested from the backing allocator with
    pub(crate) align: usize,
    /// Number of sentinel bytes after the payload
    pub(crate) tail: usize,
    pub(crate) serial: u64,
    pub(crate) thread: u64,
    pub(crate) module_base: usize,
    pub(crate) site: Site,
    pub(crate) frames: [usize; MAX_STACK_DEPTH],
    pub(crate) frame_count: u32,
    pub(crate) flags: u32,
    pub(crate) project: ProjectTag,
    pub(crate) magic: u32,
}

impl RecordHeader {
    pub(crate) fn new(size: usize, offset: usize, align: usize, tail: usize) -> Self {
        Self {
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            size,
            offset,
            align,
            tail,
            serial: 0,
            thread: 0,
            module_base: 0,
            site: Site::Unknown,
            frames: [0; MAX_STACK_DEPTH],
            frame_count: 0,
            flags: 0,
            project: ProjectTag::empty(),
            magic: MAGIC_UNTRACKED,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_array(&self) -> bool {
        self.flags & FLAG_ARRAY != 0
    }

    pub(crate) fn set_array(&mut self, is_array: bool) {
        if is_array {
            self.flags |= FLAG_ARRAY;
        } else {
            self.flags &= !FLAG_ARRAY;
        }
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..(self.frame_count as usize).min(MAX_STACK_DEPTH)]
    }

    /// Read the magic through a volatile load; the header may be garbage.
    pub(crate) fn magic(this: *const Self) -> u32 {
        // SAFETY: caller passes a pointer that is at least readable, the
        // detector's contract
        unsafe { std::ptr::addr_of!((*this).magic).read_volatile() }
    }

    /// The user pointer of this record
    pub(crate) fn user_ptr(this: *const Self) -> *mut u8 {
        (this as *mut u8).wrapping_add(std::mem::size_of::<Self>())
    }
}

/// A `Copy` view of a record, taken under the registry lock so it can be
/// reported after the lock is gone.
#[derive(Clone, Copy, Debug)]
pub struct RecordSnapshot {
    pub address: usize,
    pub size: usize,
    pub is_array: bool,
    pub serial: u64,
    pub thread: u64,
    pub project: ProjectTag,
    pub site: Site,
    pub module_base: usize,
    pub frames: [usize; MAX_STACK_DEPTH],
    pub frame_count: usize,
    pub magic: u32,
}

impl RecordSnapshot {
    pub(crate) fn of(record: &RecordHeader) -> Self {
        Self {
            address: RecordHeader::user_ptr(record) as usize,
            size: record.size,
            is_array: record.is_array(),
            serial: record.serial,
            thread: record.thread,
            project: record.project,
            site: record.site,
            module_base: record.module_base,
            frames: record.frames,
            frame_count: record.frames().len(),
            magic: record.magic,
        }
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.frame_count]
    }
}
