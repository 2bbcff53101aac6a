//! Leaks one 64-byte block tagged "demo" and reports it.
//!
//! ```text
//! MEMWATCH_SINK=log RUST_LOG=debug cargo run --example leak_report -- leaks.json
//! ```

use std::{alloc::System, env, process::ExitCode};

use memwatch::{
    sink::init_env_logger, stack::BacktraceInspector, track_alloc, track_free, Config, Site, Tracker,
};

static TRACKER: Tracker = Tracker::new(System, BacktraceInspector::new());

fn main() -> ExitCode {
    init_env_logger();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            log::error!("bad MEMWATCH_* configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = TRACKER.configure(config) {
        log::error!("configure: {err}");
        return ExitCode::FAILURE;
    }

    let kept = track_alloc!(TRACKER, 32).ok();
    let _leaked = TRACKER.allocate(64, "demo", Site::here(), false).ok();
    if let Some(ptr) = kept {
        unsafe { track_free!(TRACKER, ptr.as_ptr()) };
    }

    let leaks = TRACKER.check_leaks();
    log::info!("{leaks} leak(s), {} byte(s) still live", TRACKER.total_live_bytes());

    if let Some(path) = env::args().nth(1) {
        if let Err(err) = TRACKER.write_leak_report_json(&path) {
            log::error!("writing {path}: {err}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
