//! Using a [`Tracker`] as the process allocator, and the process-wide handle
//! the free functions (and the C ABI) report through.
//!
//! ```no_run
//! use memwatch::{alloc::global, Tracker};
//!
//! #[global_allocator]
//! static TRACKER: Tracker = Tracker::new(
//!     std::alloc::System,
//!     memwatch::stack::BacktraceInspector::new(),
//! )
//! .with_project(env!("CARGO_PKG_NAME"));
//!
//! fn main() {
//!     global::install(&TRACKER).unwrap();
//!     global::install_exit_hook().unwrap();
//!     // ...
//! }
//! ```

use std::{
    alloc::{GlobalAlloc, Layout},
    io,
    path::Path,
    ptr,
};

use once_cell::sync::OnceCell;

use super::{
    record::Site,
    tag::current_override,
    tracker::Tracker,
};
use crate::{
    error::{Error, Result},
    stack::StackInspector,
};

// Allocations through `GlobalAlloc` have no site of their own; the captured
// frames stand in for it. Faults never unwind out of here.
unsafe impl<B: GlobalAlloc, I: StackInspector> GlobalAlloc for Tracker<B, I> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let project = current_override();
        let project = project
            .as_ref()
            .map_or(self.default_project(), |tag| tag.as_str());
        match self.alloc_anchored(layout, project, Site::Unknown, false, false) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: same contract as ours
        unsafe { self.dealloc_anchored(ptr, Site::Unknown, false, Some(layout.size()), false) }
    }
}

/// The reporting half of a tracker, type-erased so one can be installed
/// process-wide whatever its backing allocator and inspector are.
pub trait Audit: Sync {
    fn check_leaks(&self) -> usize;
    fn check_corruption(&self) -> usize;
    fn total_live_bytes(&self) -> usize;
    fn project_live_bytes(&self, project: &str) -> usize;
    fn dump_to_file(&self, path: &Path) -> Result<()>;
    fn retain_unit(&self);
    fn release_unit(&self);
}

impl<B, I> Audit for Tracker<B, I>
where
    B: GlobalAlloc + Sync,
    I: StackInspector,
{
    fn check_leaks(&self) -> usize {
        Tracker::check_leaks(self)
    }

    fn check_corruption(&self) -> usize {
        Tracker::check_corruption(self)
    }

    fn total_live_bytes(&self) -> usize {
        Tracker::total_live_bytes(self)
    }

    fn project_live_bytes(&self, project: &str) -> usize {
        Tracker::project_live_bytes(self, project)
    }

    fn dump_to_file(&self, path: &Path) -> Result<()> {
        Tracker::dump_to_file(self, path)
    }

    fn retain_unit(&self) {
        Tracker::retain_unit(self)
    }

    fn release_unit(&self) {
        Tracker::release_unit(self)
    }
}

static PROCESS: OnceCell<&'static dyn Audit> = OnceCell::new();

/// Make `tracker` the one the free functions below report on. Once per
/// process.
pub fn install(tracker: &'static dyn Audit) -> Result<()> {
    PROCESS.set(tracker).map_err(|_| Error::AlreadyInstalled)?;
    log::debug!(target: "memwatch", "process tracker installed");
    Ok(())
}

pub fn installed() -> Option<&'static dyn Audit> {
    PROCESS.get().copied()
}

/// Hold one unit reference on the installed tracker until the process
/// exits, so its leak check runs from `atexit()`.
pub fn install_exit_hook() -> Result<()> {
    let tracker = installed().ok_or(Error::NotInstalled)?;
    tracker.retain_unit();
    // SAFETY: `release_at_exit` is a plain `extern "C" fn()` with no
    // preconditions
    if unsafe { libc::atexit(release_at_exit) } != 0 {
        tracker.release_unit();
        return Err(io::Error::other("atexit() registration failed").into());
    }
    Ok(())
}

extern "C" fn release_at_exit() {
    if let Some(tracker) = installed() {
        tracker.release_unit();
    }
}

/// Leak check on the installed tracker. `0` if there is none.
pub fn check_leaks() -> usize {
    installed().map_or(0, |t| t.check_leaks())
}

pub fn check_corruption() -> usize {
    installed().map_or(0, |t| t.check_corruption())
}

pub fn total_live_bytes() -> usize {
    installed().map_or(0, |t| t.total_live_bytes())
}

pub fn project_live_bytes(project: &str) -> usize {
    installed().map_or(0, |t| t.project_live_bytes(project))
}

pub fn dump_to_file(path: impl AsRef<Path>) -> Result<()> {
    installed()
        .ok_or(Error::NotInstalled)?
        .dump_to_file(path.as_ref())
}
