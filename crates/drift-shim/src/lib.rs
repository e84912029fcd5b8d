//! # drift-shim
//!
//! C ABI surface of the drift race detector. An instrumentation runtime calls
//! `drift_init` once, `drift_fork` for every thread (including the initial
//! one, with parent id 0), passes the returned `tls` handle back on every
//! event of that thread, and calls `drift_finalize` once all monitored threads
//! have stopped.
//!
//! Conditions the detector cannot recover from (thread numbers or clocks
//! exhausted) abort the process after logging, since continuing would
//! silently under-report.

// Allow unsafe FFI functions without safety docs - these are inherently unsafe C ABI
#![allow(clippy::missing_safety_doc)]

pub mod raw;
pub mod session;

pub use raw::{RaceHandler, RawAccess, RawRace};

use drift_config::logging::init_logging;
use drift_config::{log_shim_debug, log_shim_error, log_shim_warn, Config};
use drift_detector::{DetectorError, Race, RaceDetector, ThreadId};
use libc::{c_char, c_int, c_void};
use session::{thread, Session};
use std::ffi::CStr;

static NAME_C: &str = "drift-fasttrack\0";
static VERSION_C: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

fn fatal(op: &'static str, err: DetectorError) -> ! {
    log_shim_error!(
        "unrecoverable detector error",
        op = op,
        error = tracing::field::display(&err),
    );
    unsafe { libc::abort() }
}

unsafe fn collect_args(argc: c_int, argv: *const *const c_char) -> Vec<String> {
    if argv.is_null() || argc <= 0 {
        return Vec::new();
    }
    (0..argc as usize)
        .filter_map(|i| {
            let arg = unsafe { *argv.add(i) };
            (!arg.is_null()).then(|| unsafe { CStr::from_ptr(arg) }.to_string_lossy().into_owned())
        })
        .collect()
}

fn load_config(args: &[String]) -> Option<Config> {
    let mut config = Config::load().unwrap_or_else(|e| {
        log_shim_warn!("falling back to default config", error = tracing::field::display(&e));
        Config::default()
    });
    match config.apply_args(args) {
        Ok(()) => Some(config),
        Err(e) => {
            log_shim_error!("invalid detector arguments", error = tracing::field::display(&e));
            None
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create the process-wide detector. Flags in `argv` override the loaded
/// configuration. Returns false if they are malformed. Races are delivered to
/// `callback` (if any) together with `context`.
#[no_mangle]
pub unsafe extern "C" fn drift_init(
    argc: c_int,
    argv: *const *const c_char,
    callback: Option<RaceHandler>,
    context: *mut c_void,
) -> bool {
    let args = unsafe { collect_args(argc, argv) };
    let Some(config) = load_config(&args) else {
        return false;
    };
    init_logging(config.logging.level);

    let context = context as usize;
    let detector = RaceDetector::new(&config, move |race: &Race| {
        if let Some(callback) = callback {
            let raw = RawRace::from(race);
            callback(&raw, context as *mut c_void);
        }
    });

    if let Some(previous) = Session::install(Session::new(detector)) {
        log_shim_warn!("replacing an active detector");
        previous.shutdown();
    }
    log_shim_debug!("detector initialized", capacity = config.detector.capacity);
    true
}

/// Tear the detector down. No monitored thread may issue events afterwards.
#[no_mangle]
pub extern "C" fn drift_finalize() {
    match Session::take() {
        Some(session) => session.shutdown(),
        None => log_shim_warn!("finalize without an active detector"),
    }
}

#[no_mangle]
pub extern "C" fn drift_name() -> *const c_char {
    NAME_C.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn drift_version() -> *const c_char {
    VERSION_C.as_ptr() as *const c_char
}

// ============================================================================
// Threads
// ============================================================================

/// Register `child` and store its handle in `*tls`. `*tls` is set to null
/// when no detector is active.
#[no_mangle]
pub unsafe extern "C" fn drift_fork(parent: ThreadId, child: ThreadId, tls: *mut *mut c_void) {
    if tls.is_null() {
        log_shim_error!("fork without a tls slot", child = child);
        return;
    }
    let Some(session) = Session::current() else {
        log_shim_warn!("fork before init", child = child);
        unsafe { *tls = std::ptr::null_mut() };
        return;
    };
    let handle = match session.detector.fork(parent, child) {
        Ok(handle) => handle,
        Err(e) => fatal("fork", e),
    };
    unsafe { *tls = session.attach(child, handle) as *mut c_void };
}

/// Join `child` into `parent`. The child's `tls` handle is freed.
#[no_mangle]
pub extern "C" fn drift_join(parent: ThreadId, child: ThreadId) {
    if let Some(session) = Session::current() {
        session.detector.join(parent, child);
        session.detach(child);
    }
}

/// `tid` finished without being joined. Its `tls` handle is freed.
#[no_mangle]
pub unsafe extern "C" fn drift_finish(_tls: *mut c_void, tid: ThreadId) {
    if let Some(session) = Session::current() {
        session.detector.finish(tid);
        session.detach(tid);
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_detach(tls: *mut c_void, tid: ThreadId) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.detach(tid);
    }
}

// ============================================================================
// Synchronization
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn drift_acquire(
    tls: *mut c_void,
    mutex: usize,
    recursive: u32,
    write: bool,
) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.acquire(&t.handle, mutex, recursive, write);
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_release(tls: *mut c_void, mutex: usize, write: bool) {
    if let Some(t) = unsafe { thread(tls) } {
        if let Err(e) = t.detector.release(&t.handle, mutex, write) {
            fatal("release", e);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_happens_before(tls: *mut c_void, id: usize) {
    if let Some(t) = unsafe { thread(tls) } {
        if let Err(e) = t.detector.happens_before(&t.handle, id) {
            fatal("happens_before", e);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_happens_after(tls: *mut c_void, id: usize) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.happens_after(&t.handle, id);
    }
}

// ============================================================================
// Memory and call stacks
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn drift_read(tls: *mut c_void, pc: usize, addr: usize, size: usize) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.read(&t.handle, pc, addr, size);
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_write(tls: *mut c_void, pc: usize, addr: usize, size: usize) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.write(&t.handle, pc, addr, size);
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_func_enter(tls: *mut c_void, pc: usize) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.func_enter(&t.handle, pc);
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_func_exit(tls: *mut c_void) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.func_exit(&t.handle);
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_allocate(tls: *mut c_void, pc: usize, addr: usize, size: usize) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.allocate(&t.handle, pc, addr, size);
    }
}

#[no_mangle]
pub unsafe extern "C" fn drift_deallocate(tls: *mut c_void, addr: usize) {
    if let Some(t) = unsafe { thread(tls) } {
        t.detector.deallocate(&t.handle, addr);
    }
}
