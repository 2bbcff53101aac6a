#![cfg(unix)]

use std::{
    fs,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    ptr::NonNull,
};

use memwatch::{
    config::{FatalAction, ModuleCheck, OomBehavior, SinkKind},
    os::mem::StackArena,
    override_project_tag, restore_project_tag,
    stack::{BacktraceInspector, NullInspector, StackInspector},
    track_alloc, track_free, Config, Error, ProjectScope, Site, Tracker,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("memwatch-it-{}-{name}", std::process::id()))
}

/// Freed blocks stay mapped in a `StackArena`, so reading a header after a
/// free is well defined.
fn tracker_with<I: StackInspector>(inspector: I, config: Config) -> Tracker<StackArena, I> {
    let tracker = Tracker::new(StackArena::new(4 << 20).unwrap(), inspector);
    tracker.configure(config).unwrap();
    tracker
}

fn tracker(config: Config) -> Tracker<StackArena, NullInspector> {
    tracker_with(NullInspector, config)
}

fn panicking() -> Config {
    Config {
        fatal_action: FatalAction::Panic,
        ..Config::default()
    }
}

fn panic_message<F: FnOnce()>(f: F) -> String {
    let err = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_err();
    match err.downcast::<String>() {
        Ok(message) => *message,
        Err(err) => err
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_default(),
    }
}

#[test]
fn balance_holds_for_random_sequences() {
    let tracker = tracker(Config::default());
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let projects = ["a", "b", "c"];
    let mut live: Vec<(NonNull<u8>, usize, &str)> = Vec::new();
    let mut expected = 0;

    for _ in 0..2000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..512);
            let project = projects[rng.gen_range(0..projects.len())];
            let ptr = tracker.allocate(size, project, Site::here(), false).unwrap();
            live.push((ptr, size, project));
            expected += size;
        } else {
            let (ptr, size, _) = live.swap_remove(rng.gen_range(0..live.len()));
            unsafe { tracker.deallocate(ptr.as_ptr(), Site::here(), false) };
            expected -= size;
        }
        assert_eq!(tracker.total_live_bytes(), expected);
    }

    for project in projects {
        let sum: usize = live
            .iter()
            .filter(|(_, _, p)| *p == project)
            .map(|(_, size, _)| size)
            .sum();
        assert_eq!(tracker.project_live_bytes(project), sum);
    }
    assert_eq!(tracker.live_allocations(), live.len());
    assert!(tracker.peak_live_bytes() >= expected);

    for (ptr, _, _) in live.drain(..) {
        unsafe { tracker.deallocate(ptr.as_ptr(), Site::here(), false) };
    }
    assert_eq!(tracker.total_live_bytes(), 0);
    assert_eq!(tracker.check_leaks(), 0);
}

#[test]
fn projects_are_accounted_independently_of_order() {
    for a_first in [true, false] {
        let tracker = tracker(Config::default());
        let (a, b) = if a_first {
            let a = tracker.allocate(100, "A", Site::here(), false).unwrap();
            (a, tracker.allocate(30, "B", Site::here(), false).unwrap())
        } else {
            let b = tracker.allocate(30, "B", Site::here(), false).unwrap();
            (tracker.allocate(100, "A", Site::here(), false).unwrap(), b)
        };
        assert_eq!(tracker.project_live_bytes("A"), 100);
        assert_eq!(tracker.project_live_bytes("B"), 30);
        assert_eq!(tracker.project_live_bytes("never"), 0);
        unsafe {
            tracker.deallocate(a.as_ptr(), Site::here(), false);
            tracker.deallocate(b.as_ptr(), Site::here(), false);
        }
        // Accounts stay around at zero
        let accounts = tracker.projects();
        assert_eq!(accounts.len(), 2);
        assert!(accounts.iter().all(|account| account.live_bytes == 0));
        assert!(accounts.iter().all(|account| account.total_allocations == 1));
    }
}

#[test]
fn round_trip_leaves_total_unchanged() {
    let tracker = tracker(Config {
        tail_padding: 16,
        ..Config::default()
    });
    let keep = track_alloc!(tracker, 77).unwrap();
    for size in [1, 7, 64, 4096, 100_000] {
        let before = tracker.total_live_bytes();
        let ptr = track_alloc!(tracker, size).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0x11, size);
            track_free!(tracker, ptr.as_ptr());
        }
        assert_eq!(tracker.total_live_bytes(), before);
    }
    unsafe { track_free!(tracker, keep.as_ptr()) };
    assert_eq!(tracker.total_live_bytes(), 0);
}

#[test]
fn tail_overrun_is_detected() {
    let tracker = tracker(Config {
        tail_padding: 8,
        ..panicking()
    });
    let fine = track_alloc!(tracker, 16).unwrap();
    let ptr = track_alloc!(tracker, 16).unwrap();
    assert_eq!(tracker.check_corruption(), 0);

    unsafe { ptr.as_ptr().add(17).write(0) };
    assert_eq!(tracker.check_corruption(), 1);

    let message = panic_message(|| unsafe { track_free!(tracker, ptr.as_ptr()) });
    assert!(message.contains("buffer overrun"), "{message}");
    assert!(message.contains("2 byte(s) past its end"), "{message}");
    // Never released
    assert_eq!(tracker.live_allocations(), 2);

    unsafe { track_free!(tracker, fine.as_ptr()) };
}

#[test]
fn double_free_is_detected_and_registry_survives() {
    let tracker = tracker(panicking());
    let a = tracker.allocate(24, "p", Site::here(), false).unwrap();
    let b = tracker.allocate(48, "p", Site::here(), false).unwrap();
    unsafe { tracker.deallocate(a.as_ptr(), Site::here(), false) };

    let message = panic_message(|| unsafe { tracker.deallocate(a.as_ptr(), Site::here(), false) });
    assert!(message.contains("invalid pointer"), "{message}");
    assert!(message.contains("block was 24 bytes"), "{message}");

    assert_eq!(tracker.check_corruption(), 0);
    let report = tracker.leak_report();
    assert_eq!(report.count, 1);
    assert_eq!(report.entries[0].address, b.as_ptr() as usize);
    assert_eq!(tracker.total_live_bytes(), 48);
    unsafe { tracker.deallocate(b.as_ptr(), Site::here(), false) };
    assert_eq!(tracker.live_allocations(), 0);
}

#[test]
fn array_mismatch_is_detected_before_release() {
    let tracker = tracker(panicking());
    let array = track_alloc!(tracker, [32]).unwrap();
    let scalar = track_alloc!(tracker, 8).unwrap();

    let message = panic_message(|| unsafe { track_free!(tracker, array.as_ptr()) });
    assert!(message.starts_with("memwatch: scalar deallocation of array allocation"), "{message}");
    assert!(message.contains("tests/tracker.rs"), "{message}");
    let message = panic_message(|| unsafe { track_free!(tracker, [scalar.as_ptr()]) });
    assert!(message.contains("array deallocation of scalar allocation"), "{message}");
    assert_eq!(tracker.total_live_bytes(), 40);

    unsafe {
        track_free!(tracker, [array.as_ptr()]);
        track_free!(tracker, scalar.as_ptr());
    }
    assert_eq!(tracker.total_live_bytes(), 0);
}

#[test]
fn leak_of_64_bytes_tagged_demo_is_reported() {
    let path = temp_path("leaks.log");
    let _ = fs::remove_file(&path);
    let tracker = tracker(Config {
        sink: SinkKind::File(path.clone()),
        ..Config::default()
    });
    let _leak = tracker.allocate(64, "demo", Site::here(), false).unwrap();

    assert!(!tracker.is_verbose());
    assert_eq!(tracker.check_leaks(), 1);
    assert!(tracker.is_verbose());
    // Reporting changes nothing
    assert_eq!(tracker.check_leaks(), 1);

    let log = fs::read_to_string(&path).unwrap();
    assert!(log.contains("1 memory leak(s) detected"), "{log}");
    assert!(log.contains("demo"), "{log}");
    assert!(log.contains("64 byte(s)"), "{log}");
    assert!(log.contains("demo: 1 leak(s), 64 byte(s)"), "{log}");

    let json = temp_path("leaks.json");
    tracker.write_leak_report_json(&json).unwrap();
    let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(report["count"], 1);
    assert_eq!(report["entries"][0]["project"], "demo");
    assert_eq!(report["entries"][0]["size"], 64);
    assert!(report["entries"][0]["address"].as_str().unwrap().starts_with("0x"));

    fs::remove_file(&path).unwrap();
    fs::remove_file(&json).unwrap();
}

#[test]
fn verbose_mode_logs_every_alloc_and_free() {
    let path = temp_path("verbose.log");
    let _ = fs::remove_file(&path);
    let tracker = tracker(Config {
        verbose: true,
        sink: SinkKind::File(path.clone()),
        ..Config::default()
    });
    let alloc_site = Site::here();
    let ptr = tracker.allocate(24, "chatty", alloc_site, false).unwrap();
    let free_site = Site::here();
    unsafe { tracker.deallocate(ptr.as_ptr(), free_site, false) };

    let log = fs::read_to_string(&path).unwrap();
    let address = ptr.as_ptr() as usize;
    let expected = format!(
        "memwatch: alloc #1 chatty {address:#x} 24 bytes at {alloc_site} (24 live)\n\
         memwatch: free #1 chatty {address:#x} 24 bytes at {free_site} (0 live)\n"
    );
    assert_eq!(log, expected);
    assert!(alloc_site.to_string().starts_with("tests/tracker.rs:"), "{alloc_site}");
    fs::remove_file(&path).unwrap();
}

#[test]
fn teardown_without_auto_leak_check_stays_quiet() {
    let tracker = tracker(Config {
        auto_leak_check: false,
        ..Config::default()
    });
    let leaked = tracker.allocate(8, "forgotten", Site::here(), false).unwrap();
    assert_eq!(tracker.teardown(), Some(0));
    assert!(!tracker.is_verbose());
    assert_eq!(tracker.teardown(), None);
    // Still live, nobody looked
    assert_eq!(tracker.project_live_bytes("forgotten"), 8);
    unsafe { tracker.deallocate(leaked.as_ptr(), Site::here(), false) };
}

#[test]
fn long_project_names_are_accounted_by_their_prefix() {
    let tracker = tracker(Config::default());
    let name = "a-project-name-well-past-the-tag-limit-of-thirty-two-bytes";
    let ptr = tracker.allocate(100, name, Site::here(), false).unwrap();
    assert_eq!(tracker.project_live_bytes(name), 100);
    unsafe { tracker.deallocate(ptr.as_ptr(), Site::here(), false) };
    assert_eq!(tracker.project_live_bytes(name), 0);
}

#[test]
fn override_applies_to_exactly_one_allocation() {
    let tracker = tracker(Config::default());
    override_project_tag("X").unwrap();
    let tagged = track_alloc!(tracker, 10).unwrap();
    restore_project_tag();
    let untagged = track_alloc!(tracker, 20).unwrap();

    assert_eq!(tracker.project_live_bytes("X"), 10);
    assert_eq!(tracker.project_live_bytes(env!("CARGO_PKG_NAME")), 20);

    {
        let _scope = ProjectScope::enter("Y").unwrap();
        let scoped = track_alloc!(tracker, 5).unwrap();
        assert_eq!(tracker.project_live_bytes("Y"), 5);
        unsafe { track_free!(tracker, scoped.as_ptr()) };
    }
    unsafe {
        track_free!(tracker, tagged.as_ptr());
        track_free!(tracker, untagged.as_ptr());
    }
    assert_eq!(tracker.project_live_bytes("X"), 0);
}

#[test]
fn concurrent_allocations_balance() {
    let tracker = tracker(Config {
        tail_padding: 4,
        ..Config::default()
    });
    // Every thread frees each third block straight away and hands the rest
    // back as (address, is_array).
    let kept: Vec<(usize, bool)> = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = &tracker;
                s.spawn(move |_| {
                    let _scope = ProjectScope::enter(&format!("thread-{i}")).unwrap();
                    let mut kept = Vec::new();
                    for n in 0..200 {
                        let is_array = n % 2 == 0;
                        let ptr = tracker
                            .allocate(n + 1, "ignored", Site::here(), is_array)
                            .unwrap();
                        if n % 3 == 0 {
                            unsafe { tracker.deallocate(ptr.as_ptr(), Site::here(), is_array) };
                        } else {
                            kept.push((ptr.as_ptr() as usize, is_array));
                        }
                    }
                    kept
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    })
    .unwrap();

    assert_eq!(kept.len(), 8 * 133);
    assert_eq!(tracker.live_allocations(), kept.len());
    assert_eq!(tracker.check_corruption(), 0);
    for i in 0..8 {
        assert_eq!(tracker.project_live_bytes(&format!("thread-{i}")), 13_400);
    }
    assert_eq!(tracker.project_live_bytes("ignored"), 0);

    for (address, is_array) in kept {
        unsafe { tracker.deallocate(address as *mut u8, Site::here(), is_array) };
    }
    assert_eq!(tracker.total_live_bytes(), 0);
}

#[test]
fn cross_module_free_is_reported() {
    let tracker = tracker_with(
        BacktraceInspector::new(),
        Config {
            module_check: ModuleCheck::Fatal,
            ..panicking()
        },
    );
    let ptr = tracker.allocate(16, "p", Site::here(), false).unwrap();
    let foreign = Site::Caller(libc::malloc as usize);

    let message = panic_message(|| unsafe { tracker.deallocate(ptr.as_ptr(), foreign, false) });
    assert!(message.contains("but freed in"), "{message}");

    // Same module is fine
    let ptr = tracker.allocate(16, "p", Site::here(), false).unwrap();
    unsafe { tracker.deallocate(ptr.as_ptr(), Site::here(), false) };
}

#[test]
fn cross_module_free_only_warns_by_default() {
    let tracker = tracker_with(BacktraceInspector::new(), panicking());
    let ptr = tracker.allocate(16, "p", Site::here(), false).unwrap();
    unsafe { tracker.deallocate(ptr.as_ptr(), Site::Caller(libc::malloc as usize), false) };
    assert_eq!(tracker.live_allocations(), 0);
}

#[test]
fn dump_writes_a_row_per_live_block() {
    let tracker = tracker(Config::default());
    let (a, line) = (track_alloc!(tracker, 10).unwrap(), line!());
    let b = tracker.allocate(3, "raw", Site::Caller(0x1234), false).unwrap();

    let path = temp_path("dump.tsv");
    tracker.dump_to_file(&path).unwrap();
    let dump = fs::read_to_string(&path).unwrap();
    let rows: Vec<&str> = dump.lines().collect();
    assert_eq!(rows[0], "project\tfile\tline\tsize");
    assert_eq!(
        rows[1],
        format!("{}\ttests/tracker.rs\t{line}\t10", env!("CARGO_PKG_NAME"))
    );
    assert_eq!(rows[2], "raw\t0x1234\t0\t3");
    assert_eq!(rows.len(), 3);

    unsafe {
        track_free!(tracker, a.as_ptr());
        track_free!(tracker, b.as_ptr());
    }
    fs::remove_file(&path).unwrap();
}

#[test]
fn exhaustion_is_an_error_by_default() {
    let tracker = Tracker::new(StackArena::new(1).unwrap(), NullInspector);
    let too_big = tracker.backing().capacity() * 2;
    assert!(matches!(
        tracker.allocate(too_big, "p", Site::here(), false),
        Err(Error::OutOfMemory { size }) if size == too_big
    ));
    assert!(matches!(
        tracker.allocate(usize::MAX - 16, "p", Site::here(), false),
        Err(Error::LayoutOverflow { .. })
    ));
    assert_eq!(tracker.live_allocations(), 0);
}

#[test]
fn exhaustion_can_be_fatal() {
    let tracker = Tracker::new(StackArena::new(1).unwrap(), NullInspector);
    tracker
        .configure(Config {
            on_oom: OomBehavior::Fatal,
            ..panicking()
        })
        .unwrap();
    let too_big = tracker.backing().capacity() * 2;
    let message = panic_message(|| {
        let _ = tracker.allocate(too_big, "big", Site::here(), false);
    });
    assert!(message.contains("out of memory"), "{message}");
    assert!(message.contains("project big"), "{message}");
}
