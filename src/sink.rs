//! The diagnostic output sink. Every line is formatted into a stack buffer
//! first, so writing never allocates, and then written under the sink lock
//! so lines from different threads don't interleave.

use std::{
    cell::Cell,
    fmt::{self, Write as _},
    fs::{File, OpenOptions},
    io::{self, Write},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::Level;

use crate::{
    config::SinkKind,
    util::print::{putbytes, LineBuf},
};

enum Target {
    Stderr,
    Stdout,
    File(File),
    Log,
    /// fd 2 through `putbytes()`, for a thread that is already writing
    Raw,
}

thread_local! {
    static WRITING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as holding the sink lock.
struct Writing;

impl Writing {
    fn enter() -> Self {
        WRITING.with(|writing| writing.set(true));
        Writing
    }

    fn active() -> bool {
        WRITING.with(Cell::get)
    }
}

impl Drop for Writing {
    fn drop(&mut self) {
        WRITING.with(|writing| writing.set(false));
    }
}

pub struct Sink {
    target: Mutex<Target>,
}

impl Sink {
    pub const fn new() -> Self {
        Self {
            target: Mutex::new(Target::Stderr),
        }
    }

    /// Point the sink at `kind`. Files are opened for append here, once.
    pub fn open(&self, kind: &SinkKind) -> io::Result<()> {
        let target = match kind {
            SinkKind::Stderr => Target::Stderr,
            SinkKind::Stdout => Target::Stdout,
            SinkKind::File(path) => Target::File(
                OpenOptions::new().create(true).append(true).open(path)?,
            ),
            SinkKind::Log => Target::Log,
        };
        *self.lock() = target;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Target> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one line.
    pub fn line(&self, level: Level, args: fmt::Arguments<'_>) {
        self.lines(|w| w.line(level, args));
    }

    /// Write several lines without letting anyone else in between.
    ///
    /// A thread that gets back here while it is already writing (a logger
    /// that frees memory into the tracker, say) must not wait for its own
    /// lock: its lines go straight to stderr instead.
    pub fn lines<F>(&self, f: F)
    where
        F: FnOnce(&mut SinkWriter<'_>),
    {
        if Writing::active() {
            let mut raw = Target::Raw;
            let mut writer = SinkWriter {
                target: &mut raw,
                buf: LineBuf::new(),
            };
            f(&mut writer);
            return;
        }
        let _writing = Writing::enter();
        let mut target = self.lock();
        let mut writer = SinkWriter {
            target: &mut target,
            buf: LineBuf::new(),
        };
        f(&mut writer);
        writer.flush();
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed out by [`Sink::lines()`], holds the sink lock.
pub struct SinkWriter<'a> {
    target: &'a mut Target,
    buf: LineBuf,
}

impl SinkWriter<'_> {
    pub fn line(&mut self, level: Level, args: fmt::Arguments<'_>) {
        self.buf.clear();
        // `LineBuf` never fails, it truncates
        let _ = self.buf.write_fmt(args);
        if let Target::Log = self.target {
            log::log!(target: "memwatch", level, "{}", self.buf.as_str());
            if level == Level::Error {
                // Fatal diagnostics must survive an uninitialised logger
                self.buf.finish_line();
                putbytes(libc::STDERR_FILENO, self.buf.as_bytes());
            }
            return;
        }
        self.buf.finish_line();
        let bytes = self.buf.as_bytes();
        // A failing sink has nowhere to report to
        let _ = match &mut *self.target {
            Target::Stderr => io::stderr().lock().write_all(bytes),
            Target::Stdout => io::stdout().lock().write_all(bytes),
            Target::File(file) => file.write_all(bytes),
            Target::Raw => {
                putbytes(libc::STDERR_FILENO, bytes);
                Ok(())
            }
            Target::Log => Ok(()),
        };
    }

    pub fn flush(&mut self) {
        let _ = match &mut *self.target {
            Target::Stderr => io::stderr().flush(),
            Target::Stdout => io::stdout().flush(),
            Target::File(file) => file.flush(),
            Target::Log => {
                log::logger().flush();
                Ok(())
            }
            Target::Raw => Ok(()),
        };
    }
}

/// Initialise `env_logger` from `RUST_LOG`, defaulting to `info`. For
/// binaries that use [`SinkKind::Log`]. Does nothing if a logger is already
/// set.
pub fn init_env_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
