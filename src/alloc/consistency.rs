//! Was the block freed by the same binary that allocated it?
//!
//! A module is identified by its load base address. An allocation or free
//! is charged to the module of its first captured frame past the tracker
//! and the allocator shims, which is the code that called `alloc` or
//! `dealloc`. Start-up and exit frames further out never count.

use super::{
    fatal::Fault,
    record::{FixedStr, RecordSnapshot},
};
use crate::stack::{Module, StackInspector};

/// The module a set of captured frames is charged to. `0` if unknown.
pub fn charged_module<I: StackInspector + ?Sized>(inspector: &I, frames: &[usize]) -> usize {
    inspector.caller_module(frames).map_or(0, |module| module.base)
}

/// Compare where `record` was allocated against where it is being freed.
/// `caller` is an explicit free-site address; otherwise `frames` (captured
/// at the free) are used. Unknown modules on either side pass.
pub fn check<I: StackInspector + ?Sized>(
    inspector: &I,
    record: &RecordSnapshot,
    caller: Option<usize>,
    frames: &[usize],
) -> Result<(), Fault> {
    if record.module_base == 0 {
        return Ok(());
    }
    let freed_base = match caller {
        Some(address) => inspector.module_of(address).map_or(0, |m| m.base),
        None => charged_module(inspector, frames),
    };
    if freed_base == 0 || freed_base == record.module_base {
        return Ok(());
    }
    Err(Fault::ModuleMismatch {
        record: *record,
        allocated_in: inspector.module_of(record.module_base),
        freed_in: inspector.module_of(freed_base).or(Some(Module {
            base: freed_base,
            name: FixedStr::empty(),
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alloc::record::{ProjectTag, Site},
        config::MAX_STACK_DEPTH,
        stack::{Frame, NullInspector},
    };

    /// Addresses below 0x100 are the tracker's own code and addresses below
    /// 0x1000 the rest of the program, all in the module based at 0x10.
    /// Everything else belongs to a module based at the address rounded down
    /// to 0x1000, with 0x5000 standing in for libc.
    struct FakeModules;

    impl StackInspector for FakeModules {
        fn capture_addresses(&self, _out: &mut [usize]) -> usize {
            0
        }

        fn module_of(&self, address: usize) -> Option<Module> {
            if address < 0x1000 {
                return Some(Module {
                    base: 0x10,
                    name: FixedStr::new("app"),
                });
            }
            Some(Module {
                base: address & !0xFFF,
                name: FixedStr::new("plugin"),
            })
        }

        fn resolve(&self, address: usize) -> Vec<Frame> {
            let symbol = match address {
                0..=0xFF => "memwatch::alloc::tracker::Tracker<B,I>::allocate",
                0x300 => "_start",
                0x100..=0xFFF => "app::main",
                0x5000..=0x5FFF => "__libc_start_main",
                _ => "plugin::load",
            };
            // An inlined shim on top of the function that holds the address
            vec![
                Frame {
                    address,
                    symbol_name: Some("alloc::alloc::exchange_malloc".to_owned()),
                    ..Frame::default()
                },
                Frame {
                    address,
                    symbol_name: Some(symbol.to_owned()),
                    ..Frame::default()
                },
            ]
        }
    }

    fn record(module_base: usize) -> RecordSnapshot {
        RecordSnapshot {
            address: 0x9000,
            size: 8,
            is_array: false,
            serial: 1,
            thread: 1,
            project: ProjectTag::new("p"),
            site: Site::Unknown,
            module_base,
            frames: [0; MAX_STACK_DEPTH],
            frame_count: 0,
            magic: 0,
        }
    }

    #[test]
    fn frames_are_charged_to_the_first_caller_past_the_tracker() {
        assert_eq!(charged_module(&FakeModules, &[0x10, 0x2345, 0x3456, 0x20]), 0x2000);
        assert_eq!(charged_module(&FakeModules, &[0x10, 0x20, 0x200, 0x2345]), 0x10);
        // Nothing but tracker frames: no caller to charge
        assert_eq!(charged_module(&FakeModules, &[0x10, 0x20]), 0);
        assert_eq!(charged_module(&NullInspector, &[0x2345]), 0);
    }

    #[test]
    fn start_up_and_exit_frames_do_not_count() {
        // main, called from libc, called from _start in the executable
        let allocated = [0x10, 0x200, 0x5000, 0x300];
        // a thread-local destructor run by libc on the way out of `exit()`
        let freed = [0x10, 0x20, 0x250, 0x5010, 0x5020, 0x300];
        let base = charged_module(&FakeModules, &allocated);
        assert_eq!(base, 0x10);
        assert_eq!(charged_module(&FakeModules, &freed), base);
        assert!(check(&FakeModules, &record(base), None, &freed).is_ok());
    }

    #[test]
    fn same_module_passes() {
        assert!(check(&FakeModules, &record(0x2000), Some(0x2100), &[]).is_ok());
        assert!(check(&FakeModules, &record(0x2000), None, &[0x10, 0x2fff, 0x10]).is_ok());
    }

    #[test]
    fn cross_module_free_is_reported() {
        let fault = check(&FakeModules, &record(0x2000), Some(0x5000), &[]).unwrap_err();
        match fault {
            Fault::ModuleMismatch {
                allocated_in,
                freed_in,
                ..
            } => {
                assert_eq!(allocated_in.unwrap().base, 0x2000);
                assert_eq!(freed_in.unwrap().base, 0x5000);
            }
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[test]
    fn unknown_modules_pass() {
        assert!(check(&FakeModules, &record(0), Some(0x5000), &[]).is_ok());
        assert!(check(&NullInspector, &record(0x2000), None, &[0x5000]).is_ok());
    }
}
