//! C entry points over the process tracker [`MEMWATCH`], for hosts that link
//! this crate as a static library.

use std::{
    alloc::{Layout, System},
    ffi::{c_char, c_int, c_uint, CStr},
    ptr,
};

use libc::{c_void, size_t};

use crate::{
    alloc::{
        record::Site,
        tag::{override_project_tag, restore_project_tag},
        tracker::{Tracker, DEFAULT_PROJECT},
    },
    stack::BacktraceInspector,
};

pub static MEMWATCH: Tracker<System, BacktraceInspector> =
    Tracker::new(System, BacktraceInspector::new());

/// # Safety
///
/// `ptr` must be null or a NUL-terminated string that lives for `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// Allocate `size` bytes. `project` may be null (the default tag is used);
/// `file` may be null, otherwise it must have static storage duration, which
/// `__FILE__` does. Returns null on failure.
///
/// # Safety
///
/// See above for `project` and `file`.
#[no_mangle]
pub unsafe extern "C" fn memwatch_alloc(
    size: size_t,
    project: *const c_char,
    file: *const c_char,
    line: c_uint,
    is_array: bool,
) -> *mut c_void {
    let project = unsafe { str_arg(project) }.unwrap_or(DEFAULT_PROJECT);
    let file: Option<&'static str> = unsafe { str_arg(file) };
    let site = match file {
        Some(file) => Site::Source { file, line },
        None => Site::Unknown,
    };
    let Ok(layout) = Layout::from_size_align(size, 1) else {
        return ptr::null_mut();
    };
    match MEMWATCH.alloc_anchored(layout, project, site, is_array, false) {
        Ok(ptr) => ptr.as_ptr() as _,
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
///
/// `ptr` must be null or come from [`memwatch_alloc()`].
#[no_mangle]
pub unsafe extern "C" fn memwatch_free(ptr: *mut c_void, is_array: bool) {
    unsafe { MEMWATCH.dealloc_anchored(ptr as _, Site::Unknown, is_array, None, false) }
}

#[no_mangle]
pub extern "C" fn memwatch_check_leaks() -> size_t {
    MEMWATCH.check_leaks()
}

#[no_mangle]
pub extern "C" fn memwatch_check_corruption() -> size_t {
    MEMWATCH.check_corruption()
}

#[no_mangle]
pub extern "C" fn memwatch_total_live_bytes() -> size_t {
    MEMWATCH.total_live_bytes()
}

/// # Safety
///
/// `project` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn memwatch_project_live_bytes(project: *const c_char) -> size_t {
    unsafe { str_arg(project) }.map_or(0, |project| MEMWATCH.project_live_bytes(project))
}

/// `0` on success, `-1` if the name is invalid or the override stack is full.
///
/// # Safety
///
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn memwatch_override_project(name: *const c_char) -> c_int {
    match unsafe { str_arg(name) }.map(override_project_tag) {
        Some(Ok(())) => 0,
        _ => -1,
    }
}

/// `1` if an override was removed, `0` if there was none.
#[no_mangle]
pub extern "C" fn memwatch_restore_project() -> c_int {
    restore_project_tag().is_some() as c_int
}
