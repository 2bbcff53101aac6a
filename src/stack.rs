//! Call stack introspection. The tracker only *consumes* this: it captures
//! raw return addresses on the hot path (no allocation), and asks for them
//! to be symbolicated much later, when something has to be reported.

use std::{
    ffi::{c_void, CStr},
    fmt, hint,
    sync::{Mutex, PoisonError},
};

use hashbrown::HashMap;
use serde::Serialize;

use crate::{alloc::record::FixedStr, serialize::serde_addr};

/// One resolved call frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Frame {
    #[serde(with = "serde_addr")]
    pub address: usize,
    pub symbol_name: Option<String>,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
    pub module_name: Option<String>,
    #[serde(with = "serde_addr")]
    pub base_address: usize,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.symbol_name.as_deref().unwrap_or("<unknown>"),
            self.file_name.as_deref().unwrap_or("?"),
            self.line_number.unwrap_or(0)
        )
    }
}

/// The loaded binary an address belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Module {
    pub base: usize,
    pub name: FixedStr<128>,
}

/// Consumed interface for walking and symbolicating the current stack.
pub trait StackInspector: Sync {
    /// Write return addresses of the current thread into `out`, innermost
    /// first, starting with the caller of the [`anchored()`] frame if one is
    /// on the stack. Returns how many were written.
    ///
    /// Called from inside the allocator: must not allocate.
    fn capture_addresses(&self, out: &mut [usize]) -> usize;

    /// The module containing `address`. Must not allocate.
    fn module_of(&self, address: usize) -> Option<Module>;

    /// Symbolicate `address`, innermost inlined frame first. May allocate.
    fn resolve(&self, address: usize) -> Vec<Frame>;

    /// Capture and symbolicate the current stack, up to `max` addresses.
    fn capture_stack(&self, max: usize) -> Vec<Frame> {
        let mut buf = [0usize; 64];
        let max = max.min(buf.len());
        let n = self.capture_addresses(&mut buf[..max]);
        buf[..n].iter().flat_map(|&address| self.resolve(address)).collect()
    }

    /// The first frame in `addresses` that isn't part of the allocation
    /// machinery, i.e. the code that actually asked for the memory.
    fn attribute(&self, addresses: &[usize]) -> Option<Frame> {
        addresses
            .iter()
            .flat_map(|&address| self.resolve(address))
            .find(|frame| !frame.symbol_name.as_deref().is_some_and(is_internal_symbol))
    }

    /// The module of the first frame in `addresses` whose function isn't
    /// allocation machinery: the binary that asked for (or gave back) the
    /// memory. Only the outermost inlined frame at each address counts,
    /// since that is the function the address physically lies in.
    fn caller_module(&self, addresses: &[usize]) -> Option<Module> {
        let address = addresses.iter().copied().find(|&address| {
            !self
                .resolve(address)
                .last()
                .and_then(|frame| frame.symbol_name.as_deref())
                .is_some_and(is_internal_symbol)
        })?;
        self.module_of(address)
    }
}

/// Symbols belonging to the tracker, the stack walker, or the allocator
/// shims the compiler inserts between user code and a global allocator.
pub fn is_internal_symbol(name: &str) -> bool {
    const INTERNAL: &[&str] = &[
        "memwatch::",
        "backtrace::",
        "__rust_alloc",
        "__rust_dealloc",
        "__rust_realloc",
        "__rg_",
        "__rdl_",
        "alloc::alloc::",
        "std::alloc::",
        "core::alloc::",
    ];
    let name = name.trim_start_matches('<');
    INTERNAL.iter().any(|prefix| name.starts_with(prefix))
}

/// Run `f` inside a frame the inspector can recognise, so captures made
/// from `f` begin at whoever called into the tracker.
#[inline(never)]
pub fn anchored(f: &mut dyn FnMut()) {
    f();
    // Keeps the call to `f` from becoming a tail call, which would take our
    // frame off the stack.
    hint::black_box(());
}

pub fn anchor_address() -> usize {
    anchored as fn(&mut dyn FnMut()) as usize
}

/// [`StackInspector`] built on the `backtrace` crate, with `dladdr()` for
/// module lookup. Resolutions are cached per address.
pub struct BacktraceInspector {
    cache: Mutex<Option<HashMap<usize, Vec<Frame>>>>,
}

impl BacktraceInspector {
    pub const fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }
}

impl Default for BacktraceInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl StackInspector for BacktraceInspector {
    fn capture_addresses(&self, out: &mut [usize]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let anchor = anchor_address();
        let mut n = 0;
        backtrace::trace(|frame| {
            if frame.symbol_address() as usize == anchor {
                // Everything so far was tracker internals
                n = 0;
                return true;
            }
            if n < out.len() {
                out[n] = frame.ip() as usize;
                n += 1;
            }
            // Keep walking until the anchor turns up, however deep.
            true
        });
        n
    }

    fn module_of(&self, address: usize) -> Option<Module> {
        module_of(address)
    }

    fn resolve(&self, address: usize) -> Vec<Frame> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let cache = cache.get_or_insert_with(HashMap::new);
        if let Some(frames) = cache.get(&address) {
            return frames.clone();
        }

        let module = module_of(address);
        let mut frames = Vec::new();
        backtrace::resolve(address as *mut c_void, |symbol| {
            frames.push(Frame {
                address,
                symbol_name: symbol.name().map(|name| format!("{name:#}")),
                file_name: symbol.filename().map(|path| path.display().to_string()),
                line_number: symbol.lineno(),
                module_name: module.map(|m| m.name.as_str().to_owned()),
                base_address: module.map_or(0, |m| m.base),
            });
        });
        if frames.is_empty() {
            frames.push(Frame {
                address,
                module_name: module.map(|m| m.name.as_str().to_owned()),
                base_address: module.map_or(0, |m| m.base),
                ..Frame::default()
            });
        }
        cache.insert(address, frames.clone());
        frames
    }
}

#[cfg(unix)]
fn module_of(address: usize) -> Option<Module> {
    let mut info = libc::Dl_info {
        dli_fname: std::ptr::null(),
        dli_fbase: std::ptr::null_mut(),
        dli_sname: std::ptr::null(),
        dli_saddr: std::ptr::null_mut(),
    };
    // SAFETY: `dladdr()` only inspects the loader's tables, `info` is a
    // valid out-pointer
    if unsafe { libc::dladdr(address as *const c_void, &mut info) } == 0 {
        return None;
    }
    let name = if info.dli_fname.is_null() {
        FixedStr::empty()
    } else {
        // SAFETY: non-null `dli_fname` is a NUL-terminated string owned by
        // the loader, valid while the module is loaded (we copy it out)
        FixedStr::from_bytes(unsafe { CStr::from_ptr(info.dli_fname) }.to_bytes())
    };
    Some(Module {
        base: info.dli_fbase as usize,
        name,
    })
}

#[cfg(not(unix))]
fn module_of(_address: usize) -> Option<Module> {
    None
}

/// Walks nothing, knows nothing. For trackers that don't want stack
/// attribution at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullInspector;

impl StackInspector for NullInspector {
    fn capture_addresses(&self, _out: &mut [usize]) -> usize {
        0
    }

    fn module_of(&self, _address: usize) -> Option<Module> {
        None
    }

    fn resolve(&self, _address: usize) -> Vec<Frame> {
        Vec::new()
    }
}
