//! Race records handed to the embedding layer.

use crate::epoch::ThreadId;
use crate::var_state::RaceKind;

/// Hard cap on reported frames per access, whatever the configuration says.
pub const MAX_STACK_DEPTH: usize = 64;

/// One side of a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub thread_id: ThreadId,
    pub write: bool,
    pub address: usize,
    pub size: usize,
    /// Outermost frame first, the access pc last. Empty if the thread is gone.
    pub stack: Vec<usize>,
}

/// Two unordered conflicting accesses to one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Race {
    pub kind: RaceKind,
    /// The access recorded earlier
    pub prior: AccessEntry,
    /// The access that exposed the race
    pub current: AccessEntry,
}

/// Receives every race, synchronously, on the thread that made the current
/// access. It must not call back into the detector's access methods.
pub type RaceCallback = Box<dyn Fn(&Race) + Send + Sync>;
