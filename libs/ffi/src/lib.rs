//! C ABI for realm relays.
//!
//! ```c
//! #include "realm.h"
//!
//! char *listen = start_realm("example.com:443", "127.0.0.1", "8443", true, false);
//! if (listen != NULL) {
//!     /* ... */
//!     realm_string_free(listen);
//! }
//! stop_realm("example.com:443", "127.0.0.1", "8443", true, false);
//! ```
//!
//! Relays run in the background on a shared runtime; neither call blocks
//! beyond binding (start) or draining (stop).

use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::sync::Once;

use realm_relay::{control, logging, RelayConfig, VERSION};
use tracing::{info, warn};

static INIT_LOGGING: Once = Once::new();

fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let config = RelayConfig::from_env().unwrap_or_default();
        if logging::init(&config.log_level, config.log_json) {
            info!(version = VERSION, "realm library initialized");
        }
    });
}

/// Borrow a C string as UTF-8. NULL and invalid UTF-8 yield `None`.
///
/// # Safety
///
/// `ptr` must be NULL or point to a NUL-terminated string that outlives `'a`.
unsafe fn borrow_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Start (or reuse) a relay. Returns the bound local endpoint as a newly
/// allocated string, or NULL on failure.
///
/// # Safety
///
/// `remote`, `host` and `path` must be NULL or valid NUL-terminated
/// strings. The result must be released with `realm_string_free`.
#[no_mangle]
pub unsafe extern "C" fn start_realm(
    remote: *const c_char,
    host: *const c_char,
    path: *const c_char,
    tls: bool,
    insecure: bool,
) -> *mut c_char {
    init_logging();

    let (Some(remote), Some(host), Some(path)) =
        (borrow_str(remote), borrow_str(host), borrow_str(path))
    else {
        warn!(reason = "invalid_identity", "start_realm called with a NULL or non-UTF-8 argument");
        return ptr::null_mut();
    };

    match control::start_realm(remote, host, path, tls, insecure) {
        Ok(status) => match CString::new(status) {
            Ok(status) => status.into_raw(),
            Err(_) => ptr::null_mut(),
        },
        Err(e) => {
            warn!(remote, host, path, reason = e.reason_code(), error = %e, "start_realm failed");
            ptr::null_mut()
        }
    }
}

/// Stop a relay. Unknown relays and bad arguments are ignored.
///
/// # Safety
///
/// `remote`, `host` and `path` must be NULL or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn stop_realm(
    remote: *const c_char,
    host: *const c_char,
    path: *const c_char,
    tls: bool,
    insecure: bool,
) {
    let (Some(remote), Some(host), Some(path)) =
        (borrow_str(remote), borrow_str(host), borrow_str(path))
    else {
        return;
    };

    if let Err(e) = control::stop_realm(remote, host, path, tls, insecure) {
        warn!(remote, host, path, reason = e.reason_code(), error = %e, "stop_realm failed");
    }
}

/// Release a string returned by `start_realm`. NULL is a no-op.
///
/// # Safety
///
/// `s` must be NULL or a pointer returned by `start_realm` that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn realm_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
