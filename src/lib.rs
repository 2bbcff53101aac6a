//! `memwatch`: a diagnostic allocator. Wraps a backing allocator and keeps a
//! registry of every live block, with per-project byte accounting, heap
//! corruption checks on every free, cross-module free detection and a leak
//! report at the end of the process.
//!
//! Use a [`Tracker`] as an explicit handle ([`track_alloc!`],
//! [`track_free!`]), or install one as the `#[global_allocator]` (see
//! [`alloc::global`]).

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
#[cfg(unix)]
pub mod os;
pub mod serialize;
pub mod sink;
pub mod stack;
pub mod util;

pub use alloc::{
    fatal::Fault,
    leaks::LeakReport,
    record::Site,
    tag::{override_project_tag, restore_project_tag, ProjectScope},
    tracker::{Tracker, UnitGuard},
};
pub use config::Config;
pub use error::{Error, Result};
