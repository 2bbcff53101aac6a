//! The allocation facade: one [`Tracker`] owns a registry, a sink and a
//! configuration, and wraps a backing allocator with all the checks.
//!
//! Every entry point runs inside [`stack::anchored()`] so stack captures
//! start at the caller, and inside a [`HookGuard`] so that whatever the
//! tracker allocates for itself (symbol names, report vectors, log records)
//! is served untracked instead of recursing into the registry.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use log::Level;
use once_cell::sync::OnceCell;

use super::{
    accountant::ProjectAccount,
    consistency, detector,
    fatal::{fatal, Fault},
    layout::{header_of, BlockLayout},
    leaks::{Attribution, LeakReport},
    record::{
        ProjectTag, RecordHeader, RecordSnapshot, Site, MAGIC_FREED, MAGIC_LIVE, MAGIC_UNTRACKED,
    },
    registry::{Registry, RegistryState},
    tag::{effective_tag, thread_id, HookGuard},
};
use crate::{
    config::{Config, FatalAction, ModuleCheck, OomBehavior, SinkKind, MAX_STACK_DEPTH},
    error::{Error, Result},
    sink::{Sink, SinkWriter},
    stack::{self, is_internal_symbol, BacktraceInspector, Frame, StackInspector},
};

/// Used until [`Tracker::configure()`] is called. Every block records its own
/// layout, so configuring after the first allocation is fine.
static DEFAULT_CONFIG: Config = Config::DEFAULT;

/// Project tag for allocations that don't name one.
pub const DEFAULT_PROJECT: &str = "global";

/// A diagnostic allocator over the backing allocator `B`, attributing
/// allocations with the stack inspector `I`.
///
/// Usable as an explicit handle ([`Tracker::allocate()`],
/// [`Tracker::deallocate()`]) and as a `#[global_allocator]`.
pub struct Tracker<B = System, I = BacktraceInspector> {
    backing: B,
    inspector: I,
    project: &'static str,
    registry: Registry,
    sink: Sink,
    config: OnceCell<Config>,
    verbose: AtomicBool,
    serial: AtomicU64,
    units: AtomicUsize,
    torn_down: AtomicBool,
}

impl<B, I> Tracker<B, I> {
    pub const fn new(backing: B, inspector: I) -> Self {
        Self {
            backing,
            inspector,
            project: DEFAULT_PROJECT,
            registry: Registry::new(),
            sink: Sink::new(),
            config: OnceCell::new(),
            verbose: AtomicBool::new(false),
            serial: AtomicU64::new(0),
            units: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Set the build-time project tag: the one `GlobalAlloc` allocations are
    /// charged to when no override is active. Usually
    /// `env!("CARGO_PKG_NAME")`.
    pub const fn with_project(mut self, project: &'static str) -> Self {
        self.project = project;
        self
    }

    pub fn default_project(&self) -> &'static str {
        self.project
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(System, BacktraceInspector::new())
    }
}

impl<B: GlobalAlloc, I: StackInspector> Tracker<B, I> {
    /// Freeze the configuration and point the sink where it says. Only the
    /// first call succeeds.
    pub fn configure(&self, config: Config) -> Result<()> {
        config.validate()?;
        if self.config.get().is_some() {
            return Err(Error::AlreadyConfigured);
        }
        self.sink.open(&config.sink)?;
        let verbose = config.verbose;
        self.config
            .set(config)
            .map_err(|_| Error::AlreadyConfigured)?;
        self.verbose.store(verbose, Ordering::Relaxed);
        log::debug!(target: "memwatch", "tracker configured: {:?}", self.config());
        Ok(())
    }

    pub fn config(&self) -> &Config {
        self.config.get().unwrap_or(&DEFAULT_CONFIG)
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Allocate `size` bytes for `project`. The tag is replaced by this
    /// thread's project override, if one is active.
    pub fn allocate(
        &self,
        size: usize,
        project: &str,
        site: Site,
        is_array: bool,
    ) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, 1).map_err(|_| Error::LayoutOverflow { size })?;
        self.allocate_aligned(layout, project, site, is_array)
    }

    /// [`Tracker::allocate()`] with an alignment requirement. The user
    /// pointer is aligned to at least `layout.align()` and the configured
    /// alignment.
    pub fn allocate_aligned(
        &self,
        layout: Layout,
        project: &str,
        site: Site,
        is_array: bool,
    ) -> Result<NonNull<u8>> {
        self.alloc_anchored(layout, project, site, is_array, true)
    }

    /// Release a block returned by [`Tracker::allocate()`]. `site` is where
    /// the free happens (`Site::Caller` for a bare return address). A null
    /// `ptr` is a no-op.
    ///
    /// Detected faults are written to the sink and then handed to the fatal
    /// action; this only returns if the block was valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by this tracker. Passing
    /// anything else is what the checks are there to catch, but reading the
    /// header of a foreign pointer may itself fault.
    pub unsafe fn deallocate(&self, ptr: *mut u8, site: Site, is_array: bool) {
        unsafe { self.dealloc_anchored(ptr, site, is_array, None, true) }
    }

    pub(crate) fn alloc_anchored(
        &self,
        layout: Layout,
        project: &str,
        site: Site,
        is_array: bool,
        unwind: bool,
    ) -> Result<NonNull<u8>> {
        let mut result = Err(Error::OutOfMemory {
            size: layout.size(),
        });
        stack::anchored(&mut || {
            result = self.alloc_traced(layout, project, site, is_array, unwind);
        });
        result
    }

    /// `expected_size` is the size `GlobalAlloc::dealloc()` was told.
    pub(crate) unsafe fn dealloc_anchored(
        &self,
        ptr: *mut u8,
        site: Site,
        is_array: bool,
        expected_size: Option<usize>,
        unwind: bool,
    ) {
        stack::anchored(&mut || unsafe {
            self.dealloc_traced(ptr, site, is_array, expected_size, unwind)
        });
    }

    fn backing_alloc(&self, layout: &BlockLayout) -> Option<NonNull<u8>> {
        let layout = layout.backing_layout()?;
        // SAFETY: a block layout is never zero-sized, it always holds a header
        NonNull::new(unsafe { self.backing.alloc(layout) })
    }

    fn alloc_untracked(&self, request: Layout) -> Result<NonNull<u8>> {
        let size = request.size();
        let layout = BlockLayout::new(size, request.align(), self.config().alignment, 0)
            .ok_or(Error::LayoutOverflow { size })?;
        let block = self
            .backing_alloc(&layout)
            .ok_or(Error::OutOfMemory { size })?;
        // SAFETY: the header slot is inside the block we just got
        unsafe {
            layout
                .header_ptr(block)
                .as_ptr()
                .write(RecordHeader::new(size, layout.offset, layout.align, 0));
        }
        Ok(layout.user_ptr(block))
    }

    fn alloc_traced(
        &self,
        request: Layout,
        project: &str,
        site: Site,
        is_array: bool,
        unwind: bool,
    ) -> Result<NonNull<u8>> {
        if HookGuard::is_active() {
            return self.alloc_untracked(request);
        }
        let _guard = HookGuard::enter();
        let config = self.config();
        let size = request.size();
        let layout = BlockLayout::new(size, request.align(), config.alignment, config.tail_padding)
            .ok_or(Error::LayoutOverflow { size })?;
        let tag = effective_tag(project);

        let Some(block) = self.backing_alloc(&layout) else {
            return Err(self.out_of_memory(size, tag, site, unwind));
        };

        let mut record = RecordHeader::new(size, layout.offset, layout.align, layout.tail);
        record.set_array(is_array);
        record.serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        record.thread = thread_id();
        record.project = tag;
        record.site = site;
        let depth = config.stack_depth.min(MAX_STACK_DEPTH);
        if depth > 0 {
            let n = self.inspector.capture_addresses(&mut record.frames[..depth]);
            record.frame_count = n as u32;
            if config.module_check != ModuleCheck::Off {
                record.module_base = consistency::charged_module(&self.inspector, record.frames());
            }
        }
        record.magic = MAGIC_LIVE;
        let serial = record.serial;

        let header = layout.header_ptr(block);
        let user = layout.user_ptr(block);
        // SAFETY: header and tail both lie inside the fresh block
        unsafe {
            header.as_ptr().write(record);
            layout.write_tail(user.as_ptr());
        }
        let live = {
            let mut state = self.registry.lock();
            // SAFETY: fully initialised above, not in any list yet
            unsafe { state.insert(header) };
            state.live_bytes()
        };

        if self.is_verbose() {
            self.sink.line(
                Level::Info,
                format_args!(
                    "memwatch: alloc #{serial} {tag} {:#x} {size} bytes{} at {site} ({live} live)",
                    user.as_ptr() as usize,
                    if is_array { " (array)" } else { "" },
                ),
            );
        }
        Ok(user)
    }

    #[cold]
    fn out_of_memory(&self, size: usize, project: ProjectTag, site: Site, unwind: bool) -> Error {
        match self.config().on_oom {
            OomBehavior::Standard => Error::OutOfMemory { size },
            OomBehavior::Fatal => self.fail(Fault::OutOfMemory { size, project, site }, unwind),
        }
    }

    unsafe fn dealloc_traced(
        &self,
        ptr: *mut u8,
        site: Site,
        is_array: bool,
        expected_size: Option<usize>,
        unwind: bool,
    ) {
        let Some(user) = NonNull::new(ptr) else {
            return;
        };
        let header = header_of(user.as_ptr());
        if RecordHeader::magic(header.as_ptr()) == MAGIC_UNTRACKED {
            // SAFETY: untracked blocks are never linked, nobody else sees them
            unsafe { self.release(header) };
            return;
        }

        // A tracked block freed from inside our own reporting (the logger
        // behind the sink, the symbol cache) is still unlinked and checked,
        // but stays quiet: that thread may be holding the sink.
        let nested = HookGuard::is_active();
        let _guard = HookGuard::enter();
        let config = self.config();

        // Read everything under the lock: neighbours rewrite our links.
        let checked = {
            let _state = self.registry.lock();
            let magic = RecordHeader::magic(header.as_ptr());
            if magic == MAGIC_LIVE {
                // SAFETY: live magic, so this is one of our headers and the
                // whole block is still allocated
                let record = unsafe { header.as_ref() };
                Ok((RecordSnapshot::of(record), unsafe { detector::check_tail(record) }))
            } else {
                // SAFETY: a freed header of ours is still readable as long as
                // the backing allocator hasn't unmapped it
                let stale = (magic == MAGIC_FREED)
                    .then(|| RecordSnapshot::of(unsafe { header.as_ref() }));
                Err((magic, stale))
            }
        };
        let (record, tail) = match checked {
            Ok(checked) => checked,
            Err((magic, stale)) => self.fail(
                Fault::InvalidPointer {
                    address: ptr as usize,
                    magic,
                    freed_at: site,
                    stale,
                },
                unwind,
            ),
        };

        if record.is_array != is_array {
            self.fail(
                Fault::ArrayMismatch {
                    record,
                    freed_as_array: is_array,
                    freed_at: site,
                },
                unwind,
            );
        }
        if let Some(freed_size) = expected_size.filter(|&size| size != record.size) {
            self.fail(
                Fault::SizeMismatch {
                    record,
                    freed_size,
                    freed_at: site,
                },
                unwind,
            );
        }
        if let Err(first_bad) = tail {
            self.report_sweep(record.address);
            self.fail(
                Fault::TailCorruption {
                    record,
                    first_bad,
                    freed_at: site,
                },
                unwind,
            );
        }

        let (removed, live) = {
            let mut state = self.registry.lock();
            // SAFETY: magic was live when we looked, `remove()` re-validates
            // the links before touching anything
            let removed = unsafe { state.remove(header) };
            (removed, state.live_bytes())
        };
        if let Err(broken) = removed {
            self.fail(Fault::BrokenLink { record: broken.record }, unwind);
        }

        if config.module_check != ModuleCheck::Off && !nested {
            self.check_module(&record, site, unwind);
        }

        if self.is_verbose() && !nested {
            self.sink.line(
                Level::Info,
                format_args!(
                    "memwatch: free #{} {} {:#x} {} bytes at {site} ({live} live)",
                    record.serial, record.project, record.address, record.size,
                ),
            );
        }
        // SAFETY: unlinked above, so this thread owns the block outright
        unsafe { self.release(header) };
    }

    fn check_module(&self, record: &RecordSnapshot, site: Site, unwind: bool) {
        let caller = match site {
            Site::Caller(address) => Some(address),
            _ => None,
        };
        let mut frames = [0usize; MAX_STACK_DEPTH];
        let depth = self.config().stack_depth.min(MAX_STACK_DEPTH);
        let n = if caller.is_none() && depth > 0 {
            self.inspector.capture_addresses(&mut frames[..depth])
        } else {
            0
        };
        let Err(fault) = consistency::check(&self.inspector, record, caller, &frames[..n]) else {
            return;
        };
        match self.config().module_check {
            ModuleCheck::Fatal => self.fail(fault, unwind),
            _ => {
                if self.config().sink != SinkKind::Log {
                    log::warn!(target: "memwatch", "{fault}");
                }
                self.report_fault(&fault, Level::Warn);
            }
        }
    }

    /// Give a block back to the backing allocator.
    ///
    /// # Safety
    ///
    /// `header` must belong to a block of ours that is not linked into the
    /// registry and will never be used again.
    unsafe fn release(&self, header: NonNull<RecordHeader>) {
        // SAFETY: caller guarantees the header is ours and intact
        let layout = BlockLayout::of(unsafe { header.as_ref() });
        if let Some(backing) = layout.backing_layout() {
            let block = layout.block_ptr(header);
            // SAFETY: same block and layout the backing allocator handed out
            unsafe { self.backing.dealloc(block.as_ptr(), backing) };
        }
    }

    /// Write the diagnostic for `fault` and run the fatal action. `unwind`
    /// is false when called from `GlobalAlloc`, which must not panic.
    #[cold]
    fn fail(&self, fault: Fault, unwind: bool) -> ! {
        self.report_fault(&fault, Level::Error);
        let action = match self.config().fatal_action {
            FatalAction::Panic if !unwind => FatalAction::Abort,
            action => action,
        };
        fatal(action, &fault)
    }

    fn resolve_frames(&self, addresses: &[usize]) -> Vec<Frame> {
        addresses
            .iter()
            .flat_map(|&address| self.inspector.resolve(address))
            .filter(|frame| !frame.symbol_name.as_deref().is_some_and(is_internal_symbol))
            .collect()
    }

    fn report_fault(&self, fault: &Fault, level: Level) {
        let allocated = fault
            .record()
            .map(|record| self.resolve_frames(record.frames()))
            .unwrap_or_default();
        let mut here = [0usize; MAX_STACK_DEPTH];
        let depth = self.config().stack_depth.min(MAX_STACK_DEPTH);
        let n = self.inspector.capture_addresses(&mut here[..depth]);
        let detected = self.resolve_frames(&here[..n]);

        self.sink.lines(|w| {
            w.line(level, format_args!("memwatch: {fault}"));
            write_stack(w, level, "allocated from", &allocated);
            write_stack(w, level, "detected at", &detected);
        });
    }

    /// Sweep the whole registry after one bad record turned up, so the
    /// diagnostic shows everything else that is broken too.
    fn report_sweep(&self, skip: usize) {
        let faults = detector::sweep(&self.registry);
        let others: Vec<&Fault> = faults
            .iter()
            .filter(|fault| fault.record().map_or(true, |r| r.address != skip))
            .collect();
        if others.is_empty() {
            return;
        }
        self.sink.lines(|w| {
            w.line(
                Level::Error,
                format_args!("memwatch: {} other corrupted record(s):", others.len()),
            );
            for fault in others {
                w.line(Level::Error, format_args!("  {fault}"));
            }
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let _guard = HookGuard::enter();
        f(&mut self.registry.lock())
    }

    /// Report every live block as a leak. Returns how many there are, and
    /// switches verbose logging on if there were any. Safe to call any
    /// number of times; nothing is changed.
    pub fn check_leaks(&self) -> usize {
        let _guard = HookGuard::enter();
        let report = self.leak_report();
        self.sink.lines(|w| report.write_to(w));
        if !report.is_empty() {
            self.set_verbose(true);
        }
        report.count
    }

    /// Everything still live, resolved.
    pub fn leak_report(&self) -> LeakReport {
        let _guard = HookGuard::enter();
        let (records, walk) = self.registry.snapshot();
        if let Err(broken) = walk {
            let fault = Fault::BrokenLink {
                record: broken.record,
            };
            self.sink
                .line(Level::Error, format_args!("memwatch: {fault}, report is partial"));
        }
        LeakReport::build(&self.inspector, &records)
    }

    pub fn write_leak_report_json(&self, path: impl AsRef<Path>) -> Result<()> {
        self.leak_report().write_json(path)
    }

    /// Check the magic and tail of every live block. Returns the number of
    /// bad records; deciding what to do about them is up to the caller.
    pub fn check_corruption(&self) -> usize {
        let _guard = HookGuard::enter();
        let faults = detector::sweep(&self.registry);
        self.sink.lines(|w| {
            if faults.is_empty() {
                w.line(Level::Info, format_args!("memwatch: no heap corruption detected"));
                return;
            }
            w.line(
                Level::Error,
                format_args!("memwatch: {} corrupted record(s) detected", faults.len()),
            );
            for fault in &faults {
                w.line(Level::Error, format_args!("  {fault}"));
            }
        });
        faults.len()
    }

    pub fn total_live_bytes(&self) -> usize {
        self.with_state(|state| state.live_bytes())
    }

    /// High-water mark of [`Tracker::total_live_bytes()`].
    pub fn peak_live_bytes(&self) -> usize {
        self.with_state(|state| state.peak_bytes())
    }

    pub fn live_allocations(&self) -> usize {
        self.with_state(|state| state.len())
    }

    pub fn project_live_bytes(&self, project: &str) -> usize {
        self.with_state(|state| state.accounts.query(project))
    }

    pub fn projects(&self) -> Vec<ProjectAccount> {
        self.with_state(|state| state.accounts.iter().copied().collect())
    }

    /// Write a `project\tfile\tline\tsize` row for every live block.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        let rows: Vec<(ProjectTag, String, u32, usize)> = {
            let _guard = HookGuard::enter();
            let (records, _) = self.registry.snapshot();
            records
                .iter()
                .map(|record| {
                    let attribution = Attribution::of(&self.inspector, record);
                    let file = attribution
                        .file
                        .unwrap_or_else(|| record.site.to_string());
                    (record.project, file, attribution.line.unwrap_or(0), record.size)
                })
                .collect()
        };
        writeln!(out, "project\tfile\tline\tsize")?;
        for (project, file, line, size) in rows {
            writeln!(out, "{project}\t{file}\t{line}\t{size}")?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.dump(&mut out)
    }

    /// Take a reference on the tracker's lifetime. When the last
    /// [`UnitGuard`] goes, [`Tracker::teardown()`] runs.
    pub fn register_unit(&self) -> UnitGuard<'_, B, I> {
        self.retain_unit();
        UnitGuard { tracker: self }
    }

    pub(crate) fn retain_unit(&self) {
        self.units.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_unit(&self) {
        if self.units.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.teardown();
        }
    }

    /// End-of-life bookkeeping: the automatic leak check, if enabled. Runs
    /// once; later calls do nothing and return `None`.
    pub fn teardown(&self) -> Option<usize> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return None;
        }
        if !self.config().auto_leak_check {
            return Some(0);
        }
        let leaks = self.check_leaks();
        log::info!(target: "memwatch", "teardown: {leaks} leak(s)");
        Some(leaks)
    }
}

fn write_stack(w: &mut SinkWriter<'_>, level: Level, label: &str, frames: &[Frame]) {
    if frames.is_empty() {
        return;
    }
    w.line(level, format_args!("  {label}:"));
    for frame in frames {
        w.line(level, format_args!("    {:#x} {frame}", frame.address));
    }
}

/// One unit's reference on a tracker. See [`Tracker::register_unit()`].
#[must_use = "the unit is released as soon as the guard is dropped"]
pub struct UnitGuard<'a, B: GlobalAlloc, I: StackInspector> {
    tracker: &'a Tracker<B, I>,
}

impl<B: GlobalAlloc, I: StackInspector> Drop for UnitGuard<'_, B, I> {
    fn drop(&mut self) {
        self.tracker.release_unit();
    }
}

/// Allocate through a tracker, tagged with the calling crate's name and
/// the call site. `track_alloc!(t, [n])` is the array form.
#[macro_export]
macro_rules! track_alloc {
    ($tracker:expr, [$size:expr]) => {
        $tracker.allocate(
            $size,
            ::core::env!("CARGO_PKG_NAME"),
            $crate::Site::Source {
                file: ::core::file!(),
                line: ::core::line!(),
            },
            true,
        )
    };
    ($tracker:expr, $size:expr) => {
        $tracker.allocate(
            $size,
            ::core::env!("CARGO_PKG_NAME"),
            $crate::Site::Source {
                file: ::core::file!(),
                line: ::core::line!(),
            },
            false,
        )
    };
}

/// Free a block from [`track_alloc!`], recording the call site. Has to be
/// used inside `unsafe`, like [`Tracker::deallocate()`].
#[macro_export]
macro_rules! track_free {
    ($tracker:expr, [$ptr:expr]) => {
        $tracker.deallocate(
            $ptr,
            $crate::Site::Source {
                file: ::core::file!(),
                line: ::core::line!(),
            },
            true,
        )
    };
    ($tracker:expr, $ptr:expr) => {
        $tracker.deallocate(
            $ptr,
            $crate::Site::Source {
                file: ::core::file!(),
                line: ::core::line!(),
            },
            false,
        )
    };
}
