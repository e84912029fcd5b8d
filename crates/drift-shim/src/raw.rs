//! `#[repr(C)]` race records handed to the instrumentation runtime.

use drift_detector::{AccessEntry, Race, MAX_STACK_DEPTH};
use libc::c_void;

/// Invoked once per race, on the thread whose access exposed it. The record
/// is only valid for the duration of the call.
pub type RaceHandler = extern "C" fn(race: *const RawRace, context: *mut c_void);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawAccess {
    pub thread_id: u64,
    pub write: bool,
    pub address: usize,
    pub size: usize,
    /// Number of valid frames in `stack_trace`, outermost first.
    pub stack_size: usize,
    pub stack_trace: [usize; MAX_STACK_DEPTH],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawRace {
    /// The earlier access.
    pub first: RawAccess,
    pub second: RawAccess,
}

impl From<&AccessEntry> for RawAccess {
    fn from(entry: &AccessEntry) -> Self {
        let mut stack_trace = [0; MAX_STACK_DEPTH];
        let stack_size = entry.stack.len().min(MAX_STACK_DEPTH);
        stack_trace[..stack_size].copy_from_slice(&entry.stack[..stack_size]);
        Self {
            thread_id: entry.thread_id,
            write: entry.write,
            address: entry.address,
            size: entry.size,
            stack_size,
            stack_trace,
        }
    }
}

impl From<&Race> for RawRace {
    fn from(race: &Race) -> Self {
        Self {
            first: RawAccess::from(&race.prior),
            second: RawAccess::from(&race.current),
        }
    }
}

impl RawAccess {
    pub fn stack(&self) -> &[usize] {
        &self.stack_trace[..self.stack_size.min(MAX_STACK_DEPTH)]
    }
}
