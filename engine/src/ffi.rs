//! FFI layer for the mobile front end.
//!
//! This module provides C-compatible functions around [`Session`].
//! All structured data crosses the boundary as JSON strings.
//!
//! # Memory Management
//!
//! - Strings returned by `sparkwms_*` functions are allocated by Rust
//! - Caller must free them with `sparkwms_string_free`
//! - Session pointers must be freed with `sparkwms_session_free`
//!
//! # Error Handling
//!
//! Functions return JSON with either:
//! - `{"ok": <result>}` on success
//! - `{"error": {"kind": "<kind>", "message": "<message>"}}` on failure

use crate::backoff::BackoffPolicy;
use crate::config::SessionConfig;
use crate::{Error, Session};
use serde::{Deserialize, Serialize};
use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::Duration;

#[derive(Serialize)]
struct FfiError {
    kind: &'static str,
    message: String,
}

/// Result wrapper for FFI responses.
#[derive(Serialize)]
#[serde(untagged)]
enum FfiResult<T: Serialize> {
    Ok { ok: T },
    Err { error: FfiError },
}

impl<T: Serialize> FfiResult<T> {
    fn ok(value: T) -> Self {
        FfiResult::Ok { ok: value }
    }

    fn err(kind: &'static str, message: impl Into<String>) -> Self {
        FfiResult::Err {
            error: FfiError {
                kind,
                message: message.into(),
            },
        }
    }

    fn from_result<E: Into<Error>>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(e) => {
                let e = e.into();
                Self::err(e.kind(), e.to_string())
            }
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"error":{{"kind":"serialization","message":"{}"}}}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}

/// Options accepted by `sparkwms_session_open`. Missing fields keep the
/// values loaded from the environment.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SessionOptions {
    queue_path: Option<PathBuf>,
    connect_string: Option<String>,
    queue_on_send_failure: Option<bool>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
}

impl SessionOptions {
    fn apply(self, mut config: SessionConfig) -> SessionConfig {
        if let Some(path) = self.queue_path.filter(|p| !p.as_os_str().is_empty()) {
            config.queue_path = path;
        }
        if let Some(cs) = self.connect_string.filter(|s| !s.trim().is_empty()) {
            config.connect_string = Some(cs);
        }
        if let Some(enabled) = self.queue_on_send_failure {
            config.queue_on_send_failure = enabled;
        }
        if self.backoff_base_ms.is_some() || self.backoff_max_ms.is_some() {
            let current = &config.manager.backoff;
            config.manager.backoff = BackoffPolicy::new(
                self.backoff_base_ms
                    .map(Duration::from_millis)
                    .unwrap_or(current.base),
                self.backoff_max_ms
                    .map(Duration::from_millis)
                    .unwrap_or(current.max),
            );
        }
        if let Some(ms) = self.send_timeout_ms {
            config.manager.send_timeout = Duration::from_millis(ms);
        }
        config
    }
}

/// Convert a Rust string to a C string pointer.
/// Caller must free with `sparkwms_string_free`.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => {
            let error = r#"{"error":{"kind":"ffi","message":"string contained null bytes"}}"#;
            CString::new(error)
                .map(CString::into_raw)
                .unwrap_or(ptr::null_mut())
        }
    }
}

fn respond<T: Serialize>(result: FfiResult<T>) -> *mut c_char {
    to_c_string(result.to_json())
}

fn null_session() -> *mut c_char {
    respond(FfiResult::<()>::err("ffi", "null session pointer"))
}

fn invalid_argument(name: &str) -> *mut c_char {
    respond(FfiResult::<()>::err(
        "ffi",
        format!("{name} must be a valid UTF-8 string"),
    ))
}

/// Convert a C string pointer to a Rust string.
/// Returns None if pointer is null or invalid UTF-8.
unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

// ============================================================================
// Session Lifecycle
// ============================================================================

/// Open a session.
///
/// # Arguments
/// - `config_json`: JSON object with optional `queuePath`, `connectString`,
///   `queueOnSendFailure`, `backoffBaseMs`, `backoffMaxMs`, `sendTimeoutMs`;
///   null for environment defaults
///
/// # Returns
/// Pointer to Session, or null on failure (the reason is logged). Opening a
/// queue that another live session holds fails; free the old session first.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string or null
/// - Caller must free the returned pointer with `sparkwms_session_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_session_open(config_json: *const c_char) -> *mut Session {
    let options = match from_c_string(config_json) {
        Some(json) => match serde_json::from_str::<SessionOptions>(&json) {
            Ok(options) => options,
            Err(e) => {
                tracing::error!(error = %e, "Invalid session options");
                return ptr::null_mut();
            }
        },
        None => SessionOptions::default(),
    };

    let config = match SessionConfig::from_env() {
        Ok(config) => options.apply(config),
        Err(e) => {
            tracing::error!(error = %e, "Invalid session environment");
            return ptr::null_mut();
        }
    };

    match Session::open(config) {
        Ok(session) => Box::into_raw(Box::new(session)),
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "Failed to open session");
            ptr::null_mut()
        }
    }
}

/// Free a session. Stops the commit manager and waits for it.
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open`
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn sparkwms_session_free(session: *mut Session) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

/// Free a string allocated by the engine.
///
/// # Safety
/// - `s` must be a valid pointer from a `sparkwms_*` function
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn sparkwms_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Validate a commit and append it to the durable queue.
///
/// # Returns
/// JSON string: `{"ok": <sequence>}` or an error
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
/// - `device_id` and `location` must be valid null-terminated C strings or null
/// - Caller must free the returned string with `sparkwms_string_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_queue_enqueue(
    session: *const Session,
    device_id: *const c_char,
    location: *const c_char,
    item_id: i64,
    delta: i64,
) -> *mut c_char {
    let Some(session) = session.as_ref() else {
        return null_session();
    };
    let Some(device_id) = from_c_string(device_id) else {
        return invalid_argument("device_id");
    };
    let Some(location) = from_c_string(location) else {
        return invalid_argument("location");
    };

    respond(FfiResult::from_result(
        session.enqueue(&device_id, &location, item_id, delta),
    ))
}

/// Number of pending commits, or -1 on error.
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
#[no_mangle]
pub unsafe extern "C" fn sparkwms_queue_len(session: *const Session) -> i64 {
    match session.as_ref().map(Session::queue_length) {
        Some(Ok(len)) => len as i64,
        _ => -1,
    }
}

/// Pending entries, oldest first.
///
/// # Returns
/// JSON string: `{"ok": [QueueEntry, ...]}` or an error
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
/// - Caller must free the returned string with `sparkwms_string_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_queue_entries(session: *const Session) -> *mut c_char {
    let Some(session) = session.as_ref() else {
        return null_session();
    };
    respond(FfiResult::from_result(session.entries()))
}

// ============================================================================
// Delivery
// ============================================================================

/// Deliver a commit immediately, bypassing the queue.
///
/// # Returns
/// JSON string: `{"ok": true}` when confirmed, `{"ok": false}` when the
/// commit was queued after a failed send, or an error
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
/// - `device_id` and `location` must be valid null-terminated C strings or null
/// - Caller must free the returned string with `sparkwms_string_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_send_now(
    session: *const Session,
    device_id: *const c_char,
    location: *const c_char,
    item_id: i64,
    delta: i64,
) -> *mut c_char {
    let Some(session) = session.as_ref() else {
        return null_session();
    };
    let Some(device_id) = from_c_string(device_id) else {
        return invalid_argument("device_id");
    };
    let Some(location) = from_c_string(location) else {
        return invalid_argument("location");
    };

    respond(FfiResult::from_result(
        session.send_now(&device_id, &location, item_id, delta),
    ))
}

/// Probe the server.
///
/// # Returns
/// JSON string: `{"ok": <bool>}` or an error when no server is configured
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
/// - Caller must free the returned string with `sparkwms_string_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_health_check(session: *const Session) -> *mut c_char {
    let Some(session) = session.as_ref() else {
        return null_session();
    };
    respond(FfiResult::from_result(session.health_check()))
}

/// Report the platform's network availability (non-zero = available).
///
/// Returns 0 on success, -1 for a null session.
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
#[no_mangle]
pub unsafe extern "C" fn sparkwms_set_network_available(
    session: *const Session,
    available: i32,
) -> i32 {
    match session.as_ref() {
        Some(session) => {
            session.set_network_available(available != 0);
            0
        }
        None => -1,
    }
}

// ============================================================================
// Commit Manager
// ============================================================================

/// Start the background commit manager.
///
/// # Arguments
/// - `connect_string`: server base URL, optionally with a token as userinfo
/// - `queue_path`: null or empty for the session's queue
///
/// # Returns
/// JSON string: `{"ok": true}` or an error
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
/// - `connect_string` and `queue_path` must be valid null-terminated C strings or null
/// - Caller must free the returned string with `sparkwms_string_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_start_commit_manager(
    session: *const Session,
    connect_string: *const c_char,
    queue_path: *const c_char,
) -> *mut c_char {
    let Some(session) = session.as_ref() else {
        return null_session();
    };
    let connect_string = from_c_string(connect_string).unwrap_or_default();
    let queue_path = from_c_string(queue_path);

    respond(FfiResult::from_result(session.start_commit_manager(
        &connect_string,
        queue_path.as_deref().map(Path::new),
    )))
}

/// Stop the commit manager and wait for it.
///
/// # Returns
/// JSON string: `{"ok": <was running>}` or an error
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
/// - Caller must free the returned string with `sparkwms_string_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_stop_commit_manager(session: *const Session) -> *mut c_char {
    let Some(session) = session.as_ref() else {
        return null_session();
    };
    respond(FfiResult::from_result(session.stop_commit_manager()))
}

/// Current manager status.
///
/// # Returns
/// JSON string: `{"ok": ManagerStatus}` or `{"ok": null}` if never started
///
/// # Safety
/// - `session` must be a valid pointer from `sparkwms_session_open` or null
/// - Caller must free the returned string with `sparkwms_string_free`
#[no_mangle]
pub unsafe extern "C" fn sparkwms_manager_status(session: *const Session) -> *mut c_char {
    let Some(session) = session.as_ref() else {
        return null_session();
    };
    respond(FfiResult::ok(session.manager_status()))
}

// ============================================================================
// Utility
// ============================================================================

/// Install the stderr log subscriber. Returns 1 if installed, 0 if a
/// subscriber already existed.
#[no_mangle]
pub extern "C" fn sparkwms_init_logging() -> i32 {
    i32::from(crate::init_logging())
}

/// Get the engine version.
///
/// # Returns
/// Static string pointer (do not free)
#[no_mangle]
pub extern "C" fn sparkwms_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    unsafe fn take_json(ptr: *mut c_char) -> serde_json::Value {
        assert!(!ptr.is_null());
        let json = CStr::from_ptr(ptr).to_str().unwrap().to_string();
        sparkwms_string_free(ptr);
        serde_json::from_str(&json).unwrap()
    }

    fn open_in(dir: &TempDir) -> *mut Session {
        let options = serde_json::json!({
            "queuePath": dir.path().join("queue.log"),
            "queueOnSendFailure": true,
        });
        let options = CString::new(options.to_string()).unwrap();
        unsafe { sparkwms_session_open(options.as_ptr()) }
    }

    #[test]
    fn ffi_session_lifecycle() {
        let dir = TempDir::new().unwrap();
        let session = open_in(&dir);
        assert!(!session.is_null());

        unsafe {
            assert_eq!(sparkwms_queue_len(session), 0);
            sparkwms_session_free(session);
        }
    }

    #[test]
    fn ffi_enqueue_and_list() {
        let dir = TempDir::new().unwrap();
        let session = open_in(&dir);
        let device = CString::new("dev-1").unwrap();
        let location = CString::new("A1").unwrap();

        unsafe {
            let result = take_json(sparkwms_queue_enqueue(
                session,
                device.as_ptr(),
                location.as_ptr(),
                42,
                -5,
            ));
            assert_eq!(result["ok"], 1);
            assert_eq!(sparkwms_queue_len(session), 1);

            let entries = take_json(sparkwms_queue_entries(session));
            let entry = &entries["ok"][0];
            assert_eq!(entry["seq"], 1);
            assert_eq!(entry["commit"]["deviceId"], "dev-1");
            assert_eq!(entry["commit"]["itemId"], 42);
            assert_eq!(entry["commit"]["delta"], -5);

            sparkwms_session_free(session);
        }
    }

    #[test]
    fn ffi_validation_errors_carry_kind() {
        let dir = TempDir::new().unwrap();
        let session = open_in(&dir);
        let device = CString::new("dev-1").unwrap();
        let location = CString::new("A1").unwrap();

        unsafe {
            let result = take_json(sparkwms_queue_enqueue(
                session,
                device.as_ptr(),
                location.as_ptr(),
                32_768,
                1,
            ));
            assert_eq!(result["error"]["kind"], "validation");
            assert_eq!(sparkwms_queue_len(session), 0);

            let result = take_json(sparkwms_queue_enqueue(
                session,
                ptr::null(),
                location.as_ptr(),
                1,
                1,
            ));
            assert_eq!(result["error"]["kind"], "ffi");

            sparkwms_session_free(session);
        }
    }

    #[test]
    fn ffi_manager_errors() {
        let dir = TempDir::new().unwrap();
        let session = open_in(&dir);
        let empty = CString::new("").unwrap();

        unsafe {
            let result = take_json(sparkwms_start_commit_manager(
                session,
                empty.as_ptr(),
                ptr::null(),
            ));
            assert_eq!(result["error"]["kind"], "manager");

            let status = take_json(sparkwms_manager_status(session));
            assert!(status["ok"].is_null());

            let stopped = take_json(sparkwms_stop_commit_manager(session));
            assert_eq!(stopped["ok"], false);

            let health = take_json(sparkwms_health_check(session));
            assert_eq!(health["error"]["kind"], "delivery");

            assert_eq!(sparkwms_set_network_available(session, 0), 0);
            sparkwms_session_free(session);
        }
    }

    #[test]
    fn ffi_null_session() {
        unsafe {
            assert_eq!(sparkwms_queue_len(ptr::null()), -1);
            assert_eq!(sparkwms_set_network_available(ptr::null(), 1), -1);

            let result = take_json(sparkwms_queue_entries(ptr::null()));
            assert_eq!(result["error"]["kind"], "ffi");
        }
    }

    #[test]
    fn ffi_bad_options_return_null() {
        let options = CString::new("{not json").unwrap();
        let session = unsafe { sparkwms_session_open(options.as_ptr()) };
        assert!(session.is_null());
    }

    #[test]
    fn ffi_version() {
        unsafe {
            let version = sparkwms_version();
            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert_eq!(version_str, env!("CARGO_PKG_VERSION"));
        }
    }
}
