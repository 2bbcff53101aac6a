//! Faults the tracker can detect, and what happens after one has been
//! reported.

use std::{fmt, process};

use super::record::{ProjectTag, RecordSnapshot, Site};
use crate::{
    config::FatalAction,
    stack::Module,
    util::print::putstr,
};

/// A detected heap fault. Everything here is fatal except a module mismatch
/// under [`crate::config::ModuleCheck::Warn`].
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    /// Magic missing on free: double free, a pointer we never handed out, or
    /// a header that got overwritten. `stale` is whatever the header still
    /// says, if the magic shows it was ours once.
    InvalidPointer {
        address: usize,
        magic: u32,
        freed_at: Site,
        stale: Option<RecordSnapshot>,
    },
    ArrayMismatch {
        record: RecordSnapshot,
        freed_as_array: bool,
        freed_at: Site,
    },
    /// `GlobalAlloc::dealloc()` with a layout that doesn't match the record
    SizeMismatch {
        record: RecordSnapshot,
        freed_size: usize,
        freed_at: Site,
    },
    TailCorruption {
        record: RecordSnapshot,
        /// Offset past the end of the payload of the first bad byte
        first_bad: usize,
        freed_at: Site,
    },
    ModuleMismatch {
        record: RecordSnapshot,
        allocated_in: Option<Module>,
        freed_in: Option<Module>,
    },
    /// A live record whose list neighbours don't point back at it
    BrokenLink { record: usize },
    OutOfMemory {
        size: usize,
        project: ProjectTag,
        site: Site,
    },
}

impl Fault {
    /// The record the fault is about, if one could be read.
    pub fn record(&self) -> Option<&RecordSnapshot> {
        match self {
            Self::InvalidPointer { stale, .. } => stale.as_ref(),
            Self::ArrayMismatch { record, .. }
            | Self::SizeMismatch { record, .. }
            | Self::TailCorruption { record, .. }
            | Self::ModuleMismatch { record, .. } => Some(record),
            Self::BrokenLink { .. } | Self::OutOfMemory { .. } => None,
        }
    }
}

fn module_name(module: &Option<Module>) -> &str {
    match module {
        Some(m) if !m.name.is_empty() => m.name.as_str(),
        Some(_) => "<anonymous module>",
        None => "<unknown module>",
    }
}

fn array_form(is_array: bool) -> &'static str {
    if is_array {
        "array"
    } else {
        "scalar"
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPointer {
                address,
                magic,
                freed_at,
                stale,
            } => {
                write!(
                    f,
                    "invalid pointer {address:#x} freed at {freed_at} (magic {magic:#010x}): \
                     double free or heap corruption"
                )?;
                if let Some(stale) = stale {
                    write!(
                        f,
                        "; block was {} bytes for project {} allocated at {}",
                        stale.size, stale.project, stale.site
                    )?;
                }
                Ok(())
            }
            Self::ArrayMismatch {
                record,
                freed_as_array,
                freed_at,
            } => write!(
                f,
                "{} deallocation of {} allocation {:#x} ({} bytes, project {}): allocated at {}, freed at {}",
                array_form(*freed_as_array),
                array_form(record.is_array),
                record.address,
                record.size,
                record.project,
                record.site,
                freed_at
            ),
            Self::SizeMismatch {
                record,
                freed_size,
                freed_at,
            } => write!(
                f,
                "block {:#x} of {} bytes (project {}, allocated at {}) freed as {} bytes at {}",
                record.address, record.size, record.project, record.site, freed_size, freed_at
            ),
            Self::TailCorruption {
                record,
                first_bad,
                freed_at,
            } => write!(
                f,
                "buffer overrun: block {:#x} of {} bytes (project {}, allocated at {}) \
                 written {} byte(s) past its end, detected at {}",
                record.address,
                record.size,
                record.project,
                record.site,
                first_bad + 1,
                freed_at
            ),
            Self::ModuleMismatch {
                record,
                allocated_in,
                freed_in,
            } => write!(
                f,
                "block {:#x} of {} bytes (project {}, allocated at {}) allocated in {} but freed in {}",
                record.address,
                record.size,
                record.project,
                record.site,
                module_name(allocated_in),
                module_name(freed_in)
            ),
            Self::BrokenLink { record } => write!(
                f,
                "registry corrupted: record at {record:#x} is not linked to its neighbours"
            ),
            Self::OutOfMemory {
                size,
                project,
                site,
            } => write!(
                f,
                "out of memory: {size} bytes for project {project} at {site}"
            ),
        }
    }
}

/// Terminate the way `action` says. The diagnostic has to be out already.
#[cold]
pub fn fatal(action: FatalAction, fault: &Fault) -> ! {
    match action {
        FatalAction::Panic => panic!("memwatch: {fault}"),
        FatalAction::Trap => {
            // SAFETY: raising a signal has no memory safety requirements
            #[cfg(unix)]
            unsafe {
                libc::raise(libc::SIGSEGV);
            }
            putstr("memwatch: SIGSEGV was handled, aborting\n");
            process::abort()
        }
        FatalAction::Abort => process::abort(),
    }
}
