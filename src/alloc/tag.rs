//! Thread-local state: the project tag override stack, and the guard that
//! marks "this thread is already inside the tracker".
//!
//! Both are `const`-initialised with no destructor, so touching them never
//! allocates and they stay usable while a thread is being torn down.

use std::{
    cell::{Cell, RefCell},
    sync::atomic::{AtomicU64, Ordering},
};

use super::record::ProjectTag;
use crate::error::{Error, Result};

/// How many overrides can be nested on one thread.
pub const TAG_STACK_DEPTH: usize = 16;

struct TagStack {
    tags: [ProjectTag; TAG_STACK_DEPTH],
    len: usize,
}

impl TagStack {
    const fn new() -> Self {
        Self {
            tags: [ProjectTag::empty(); TAG_STACK_DEPTH],
            len: 0,
        }
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OVERRIDES: RefCell<TagStack> = const { RefCell::new(TagStack::new()) };
    static HOOK_DEPTH: Cell<u32> = const { Cell::new(0) };
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Small numeric id of the current thread, assigned on first use. Unlike
/// `std::thread::current()` this never allocates.
pub fn thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Attribute this thread's allocations to `name` until the matching
/// [`restore_project_tag()`]. Overrides nest.
pub fn override_project_tag(name: &str) -> Result<()> {
    OVERRIDES.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.len == TAG_STACK_DEPTH {
            return Err(Error::TagStackFull);
        }
        let i = stack.len;
        stack.tags[i] = ProjectTag::new(name);
        stack.len += 1;
        Ok(())
    })
}

/// Drop the innermost override, returning it. `None` if there was none.
pub fn restore_project_tag() -> Option<ProjectTag> {
    OVERRIDES.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.len == 0 {
            return None;
        }
        stack.len -= 1;
        Some(stack.tags[stack.len])
    })
}

/// The innermost override on this thread.
pub fn current_override() -> Option<ProjectTag> {
    OVERRIDES.with(|stack| {
        let stack = stack.borrow();
        stack.len.checked_sub(1).map(|i| stack.tags[i])
    })
}

/// The tag an allocation requested with `requested` is charged to.
pub fn effective_tag(requested: &str) -> ProjectTag {
    current_override().unwrap_or_else(|| ProjectTag::new(requested))
}

/// RAII form of the override: restores when dropped.
#[must_use = "the override is restored as soon as the scope is dropped"]
pub struct ProjectScope {
    _private: (),
}

impl ProjectScope {
    pub fn enter(name: &str) -> Result<Self> {
        override_project_tag(name)?;
        Ok(Self { _private: () })
    }
}

impl Drop for ProjectScope {
    fn drop(&mut self) {
        restore_project_tag();
    }
}

/// Marks the current thread as running tracker code. Anything allocated
/// while one of these is alive on the thread is served untracked.
pub struct HookGuard {
    _private: (),
}

impl HookGuard {
    pub fn enter() -> Self {
        HOOK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }

    /// Is this thread already inside the tracker?
    pub fn is_active() -> bool {
        HOOK_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        HOOK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}
