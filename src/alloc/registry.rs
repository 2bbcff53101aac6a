//! The set of live records: an intrusive doubly linked list threaded through
//! the record headers, plus the totals that have to change atomically with
//! it. One lock guards all of it.
//!
//! Nothing here allocates, and nothing here calls out to the backing
//! allocator or the stack inspector while the lock is held. Buffers for
//! walks are sized and allocated before the lock is taken
//! ([`Registry::with_buffer()`]).

use std::{
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{
    accountant::Accounts,
    record::{RecordHeader, RecordSnapshot, MAGIC_FREED, MAGIC_LIVE},
};

/// A record's neighbours don't point back at it. The list is left as it was.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokenLink {
    pub record: usize,
}

pub struct RegistryState {
    head: *mut RecordHeader,
    tail: *mut RecordHeader,
    len: usize,
    live_bytes: usize,
    peak_bytes: usize,
    pub(crate) accounts: Accounts,
}

// SAFETY: the raw pointers are only ever dereferenced with the registry lock
// held, and the records they point at are owned by the registry until removed.
unsafe impl Send for RegistryState {}

impl RegistryState {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
            live_bytes: 0,
            peak_bytes: 0,
            accounts: Accounts::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Link `record` at the tail and credit its size.
    ///
    /// # Safety
    ///
    /// `record` must be a fully initialised header that is not in any list.
    pub unsafe fn insert(&mut self, record: NonNull<RecordHeader>) {
        let record = record.as_ptr();
        unsafe {
            (*record).prev = self.tail;
            (*record).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = record;
            } else {
                (*self.tail).next = record;
            }
            self.tail = record;

            self.len += 1;
            self.live_bytes += (*record).size;
            self.peak_bytes = self.peak_bytes.max(self.live_bytes);
            self.accounts.credit(&(*record).project, (*record).size);
        }
    }

    /// Check that `record` is wired into the list the way a member has to be.
    ///
    /// # Safety
    ///
    /// `record` must be readable. Its neighbours, if non-null, must be too.
    unsafe fn links_ok(&self, record: *mut RecordHeader) -> bool {
        unsafe {
            let prev = (*record).prev;
            let next = (*record).next;
            let prev_ok = if prev.is_null() {
                self.head == record
            } else {
                (*prev).next == record
            };
            let next_ok = if next.is_null() {
                self.tail == record
            } else {
                (*next).prev == record
            };
            prev_ok && next_ok
        }
    }

    /// Unlink `record`, debit its size and clear its magic.
    ///
    /// # Safety
    ///
    /// `record` must carry [`MAGIC_LIVE`] (which means it was inserted and
    /// not yet removed, unless the heap is corrupt).
    pub unsafe fn remove(&mut self, record: NonNull<RecordHeader>) -> Result<(), BrokenLink> {
        let record = record.as_ptr();
        unsafe {
            if !self.links_ok(record) {
                return Err(BrokenLink {
                    record: record as usize,
                });
            }
            let prev = (*record).prev;
            let next = (*record).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*record).prev = ptr::null_mut();
            (*record).next = ptr::null_mut();
            (*record).magic = MAGIC_FREED;

            self.len -= 1;
            self.live_bytes = self.live_bytes.saturating_sub((*record).size);
            self.accounts.debit(&(*record).project, (*record).size);
        }
        Ok(())
    }

    /// Walk every live record, oldest first. Stops early (and reports the
    /// offending node) if a record's magic is gone or its links are broken,
    /// since following its `next` pointer would then be a guess.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), BrokenLink>
    where
        F: FnMut(&RecordHeader),
    {
        let mut cursor = self.head;
        let mut seen = 0usize;
        while !cursor.is_null() {
            // SAFETY: every pointer reachable from `head` is a live record
            // owned by the registry. `insert()` and `remove()` keep it that
            // way under the lock we hold via `&self`
            let record = unsafe { &*cursor };
            f(record);
            seen += 1;
            if RecordHeader::magic(record) != MAGIC_LIVE
                || !unsafe { self.links_ok(cursor) }
                || seen > self.len
            {
                return Err(BrokenLink {
                    record: cursor as usize,
                });
            }
            cursor = record.next;
        }
        Ok(())
    }

    /// `for_each()`, appending a [`RecordSnapshot`] of every record to `out`
    /// as long as it has spare capacity. Never grows `out`.
    pub fn snapshot_into(&self, out: &mut Vec<RecordSnapshot>) -> Result<(), BrokenLink> {
        self.for_each(|record| {
            if out.len() < out.capacity() {
                out.push(RecordSnapshot::of(record));
            }
        })
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::new()),
        }
    }

    /// Take the registry lock. Nothing panics with it held, so a poisoned
    /// lock still guards consistent state.
    pub fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the lock with a buffer that has room for one item per
    /// live record plus `extra`. The buffer is allocated, and given back,
    /// with the lock released; if the registry grew in between we go again.
    pub fn with_buffer<T, R, F>(&self, extra: usize, f: F) -> (Vec<T>, R)
    where
        F: FnOnce(&RegistryState, &mut Vec<T>) -> R,
    {
        let mut wanted = self.lock().len() + extra;
        let (mut buf, state) = loop {
            let buf = Vec::with_capacity(wanted);
            let state = self.lock();
            let needed = state.len() + extra;
            if needed <= buf.capacity() {
                break (buf, state);
            }
            drop(state);
            wanted = needed;
        };
        let result = f(&state, &mut buf);
        drop(state);
        (buf, result)
    }

    /// A [`RecordSnapshot`] of every live record, oldest first.
    pub fn snapshot(&self) -> (Vec<RecordSnapshot>, Result<(), BrokenLink>) {
        self.with_buffer(0, RegistryState::snapshot_into)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::record::ProjectTag;

    fn record(size: usize, project: &str) -> Box<RecordHeader> {
        let mut header = Box::new(RecordHeader::new(size, 0, 16, 0));
        header.magic = MAGIC_LIVE;
        header.project = ProjectTag::new(project);
        header
    }

    fn sizes(state: &RegistryState) -> Vec<usize> {
        let mut snapshot = Vec::with_capacity(state.len());
        state.snapshot_into(&mut snapshot).unwrap();
        snapshot.iter().map(|r| r.size).collect()
    }

    #[test]
    fn insert_and_remove_keep_order_and_totals() {
        let registry = Registry::new();
        let mut a = record(10, "a");
        let mut b = record(20, "b");
        let mut c = record(30, "a");
        let mut state = registry.lock();
        unsafe {
            state.insert(NonNull::from(&mut *a));
            state.insert(NonNull::from(&mut *b));
            state.insert(NonNull::from(&mut *c));
        }
        assert_eq!(sizes(&state), [10, 20, 30]);
        assert_eq!(state.live_bytes(), 60);
        assert_eq!(state.accounts.query("a"), 40);

        unsafe { state.remove(NonNull::from(&mut *b)).unwrap() };
        assert_eq!(sizes(&state), [10, 30]);
        assert_eq!(b.magic, MAGIC_FREED);

        unsafe {
            state.remove(NonNull::from(&mut *a)).unwrap();
            state.remove(NonNull::from(&mut *c)).unwrap();
        }
        assert!(state.is_empty());
        assert_eq!(state.live_bytes(), 0);
        assert_eq!(state.peak_bytes(), 60);
        assert_eq!(state.accounts.query("a"), 0);
    }

    #[test]
    fn removing_an_unlinked_record_is_refused() {
        let registry = Registry::new();
        let mut a = record(10, "a");
        let mut stray = record(99, "a");
        let mut state = registry.lock();
        unsafe { state.insert(NonNull::from(&mut *a)) };
        let err = unsafe { state.remove(NonNull::from(&mut *stray)) }.unwrap_err();
        assert_eq!(err.record, &*stray as *const RecordHeader as usize);
        assert_eq!(sizes(&state), [10]);
        assert_eq!(state.live_bytes(), 10);
        unsafe { state.remove(NonNull::from(&mut *a)).unwrap() };
    }

    #[test]
    fn walk_stops_at_a_record_with_bad_magic() {
        let registry = Registry::new();
        let mut a = record(1, "a");
        let mut b = record(2, "a");
        let mut state = registry.lock();
        unsafe {
            state.insert(NonNull::from(&mut *a));
            state.insert(NonNull::from(&mut *b));
        }
        a.magic = 0xBAD;
        let mut snapshot = Vec::with_capacity(state.len());
        let walk = state.snapshot_into(&mut snapshot);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(walk.unwrap_err().record, &*a as *const RecordHeader as usize);
    }

    #[test]
    fn snapshot_buffer_is_sized_before_locking() {
        let registry = Registry::new();
        let mut records: Vec<_> = (1..=5).map(|size| record(size, "b")).collect();
        {
            let mut state = registry.lock();
            for header in &mut records {
                unsafe { state.insert(NonNull::from(&mut **header)) };
            }
        }
        let (snapshot, walk) = registry.snapshot();
        walk.unwrap();
        assert_eq!(snapshot.iter().map(|r| r.size).collect::<Vec<_>>(), [1, 2, 3, 4, 5]);

        let (buf, capacity) = registry.with_buffer::<u8, _, _>(3, |state, buf| {
            assert_eq!(state.len(), 5);
            buf.capacity()
        });
        assert!(capacity >= 8);
        assert!(buf.is_empty());

        let mut state = registry.lock();
        for header in &mut records {
            unsafe { state.remove(NonNull::from(&mut **header)).unwrap() };
        }
    }

    #[test]
    fn snapshot_into_never_grows_the_buffer() {
        let registry = Registry::new();
        let mut a = record(1, "a");
        let mut b = record(2, "a");
        let mut state = registry.lock();
        unsafe {
            state.insert(NonNull::from(&mut *a));
            state.insert(NonNull::from(&mut *b));
        }
        let mut out = Vec::with_capacity(1);
        let capacity = out.capacity();
        state.snapshot_into(&mut out).unwrap();
        assert_eq!(out.len(), capacity.min(2));
        assert_eq!(out.capacity(), capacity);
        unsafe {
            state.remove(NonNull::from(&mut *a)).unwrap();
            state.remove(NonNull::from(&mut *b)).unwrap();
        }
    }
}
