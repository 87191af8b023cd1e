//! Host probe: can the dynamic loader resolve a dylib path right now?
//!
//! Advisory input for auto-removal. The probe is host-local by design: the
//! same input can produce different outputs on different machines, which is
//! what makes the tool useful as a deployment aid.

/// Returns true if the current process's dynamic loader can resolve `path`.
///
/// Attempts a lazy, local load and releases the handle immediately. Any
/// resolution failure is `false`; no error propagates.
#[cfg(unix)]
pub fn dylib_exists(path: &str) -> bool {
    use std::ffi::CString;

    let Ok(c_path) = CString::new(path) else {
        return false;
    };
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
    if handle.is_null() {
        return false;
    }
    unsafe { libc::dlclose(handle) };
    true
}

/// Non-unix hosts have no dyld; nothing resolves.
#[cfg(not(unix))]
pub fn dylib_exists(_path: &str) -> bool {
    false
}
