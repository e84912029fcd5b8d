//! The process-wide detector slot and the per-thread `tls` handles.

use drift_detector::sync::SpinLock;
use drift_detector::{RaceDetector, ThreadHandle, ThreadId};
use std::collections::HashMap;
use std::sync::Arc;

/// What a `tls` pointer refers to. Owned by the session's thread table.
pub struct ShimThread {
    pub detector: Arc<RaceDetector>,
    pub handle: ThreadHandle,
}

struct TlsPtr(*mut ShimThread);

// Only dereferenced by the monitored thread it belongs to; the table just owns it.
unsafe impl Send for TlsPtr {}

pub struct Session {
    pub detector: Arc<RaceDetector>,
    threads: SpinLock<HashMap<ThreadId, TlsPtr>>,
}

static SESSION: SpinLock<Option<Arc<Session>>> = SpinLock::new(None);

impl Session {
    pub fn new(detector: RaceDetector) -> Self {
        Self {
            detector: Arc::new(detector),
            threads: SpinLock::new(HashMap::new()),
        }
    }

    /// Install `session` as the active one, returning whatever it replaced.
    pub fn install(session: Session) -> Option<Arc<Session>> {
        SESSION.lock().replace(Arc::new(session))
    }

    pub fn current() -> Option<Arc<Session>> {
        SESSION.lock().clone()
    }

    pub fn take() -> Option<Arc<Session>> {
        SESSION.lock().take()
    }

    /// The `tls` pointer for `tid`, creating it on first sight.
    pub fn attach(&self, tid: ThreadId, handle: ThreadHandle) -> *mut ShimThread {
        let mut threads = self.threads.lock();
        threads
            .entry(tid)
            .or_insert_with(|| {
                TlsPtr(Box::into_raw(Box::new(ShimThread {
                    detector: Arc::clone(&self.detector),
                    handle,
                })))
            })
            .0
    }

    /// Free the `tls` pointer of `tid`. Returns whether one existed.
    pub fn detach(&self, tid: ThreadId) -> bool {
        match self.threads.lock().remove(&tid) {
            // SAFETY: the pointer came from `Box::into_raw` in `attach` and
            // was removed from the table, so it is freed exactly once.
            Some(ptr) => {
                drop(unsafe { Box::from_raw(ptr.0) });
                true
            }
            None => false,
        }
    }

    pub fn attached(&self) -> usize {
        self.threads.lock().len()
    }

    /// Finalize the detector and free every remaining `tls` pointer.
    pub fn shutdown(&self) {
        self.detector.finalize();
        let threads = std::mem::take(&mut *self.threads.lock());
        for (_, ptr) in threads {
            // SAFETY: as in `detach`.
            drop(unsafe { Box::from_raw(ptr.0) });
        }
    }
}

/// Borrow the thread behind a `tls` pointer; `None` for null.
///
/// # Safety
/// `tls` must be null or a pointer handed out by [`Session::attach`] that has
/// not been freed yet.
pub unsafe fn thread<'a>(tls: *mut libc::c_void) -> Option<&'a ShimThread> {
    unsafe { (tls as *const ShimThread).as_ref() }
}
