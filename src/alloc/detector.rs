//! Heap corruption checks: header magic and tail sentinels, for a single
//! record or for everything in the registry.

use super::{
    fatal::Fault,
    layout::BlockLayout,
    record::{RecordHeader, RecordSnapshot, Site, MAGIC_LIVE, TAIL_SENTINEL},
    registry::{Registry, RegistryState},
};

/// Compare every tail padding byte of `record` against the sentinel.
/// `Err(i)` names the first bad byte, `i` bytes past the payload.
///
/// # Safety
///
/// `record` must be the header of a block that is still allocated.
pub unsafe fn check_tail(record: &RecordHeader) -> Result<(), usize> {
    if record.tail == 0 {
        return Ok(());
    }
    let layout = BlockLayout::of(record);
    let user = RecordHeader::user_ptr(record);
    // SAFETY: caller guarantees the block (tail included) is allocated
    let tail = unsafe { layout.tail(user) };
    match tail.iter().position(|&b| b != TAIL_SENTINEL) {
        Some(i) => Err(i),
        None => Ok(()),
    }
}

pub fn magic_ok(record: *const RecordHeader) -> bool {
    RecordHeader::magic(record) == MAGIC_LIVE
}

/// Check every live record. Returns one fault per bad record; a broken link
/// ends the walk, since nothing past it can be trusted.
pub fn sweep(registry: &Registry) -> Vec<Fault> {
    // One fault per record visited (at most `len + 1` before a broken link
    // is noticed), plus the broken link itself.
    registry.with_buffer(2, sweep_into).0
}

fn push_bounded(faults: &mut Vec<Fault>, fault: Fault) {
    if faults.len() < faults.capacity() {
        faults.push(fault);
    }
}

/// The body of [`sweep()`], run under the registry lock. Appends to `faults`
/// only while it has spare capacity, so it never allocates.
pub fn sweep_into(state: &RegistryState, faults: &mut Vec<Fault>) {
    let walk = state.for_each(|record| {
        let snapshot = RecordSnapshot::of(record);
        if !magic_ok(record) {
            push_bounded(
                faults,
                Fault::InvalidPointer {
                    address: snapshot.address,
                    magic: snapshot.magic,
                    freed_at: Site::Unknown,
                    stale: Some(snapshot),
                },
            );
            return;
        }
        // SAFETY: every record reachable from the registry is allocated
        if let Err(first_bad) = unsafe { check_tail(record) } {
            push_bounded(
                faults,
                Fault::TailCorruption {
                    record: snapshot,
                    first_bad,
                    freed_at: Site::Unknown,
                },
            );
        }
    });
    if let Err(broken) = walk {
        // A bad magic already got its own entry above
        let reported = faults
            .last()
            .and_then(Fault::record)
            .is_some_and(|r| r.address == RecordHeader::user_ptr(broken.record as *const _) as usize);
        if !reported {
            push_bounded(
                faults,
                Fault::BrokenLink {
                    record: broken.record,
                },
            );
        }
    }
}
