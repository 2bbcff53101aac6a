//! The tracker proper. [`tracker::Tracker`] composes everything else in
//! here.

pub mod accountant;
pub mod consistency;
pub mod detector;
pub mod dlmalloc;
pub mod fatal;
pub mod global;
pub mod layout;
pub mod leaks;
pub mod record;
pub mod registry;
pub mod tag;
pub mod tracker;
