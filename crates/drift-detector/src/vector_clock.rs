use crate::epoch::{Epoch, ThreadNumber};
use std::collections::HashMap;

/// Sparse vector clock: the highest epoch observed per thread number.
///
/// Missing entries read as clock 0. Entries only grow, except through
/// [`VectorClock::purge`] when a thread number is torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    entries: HashMap<ThreadNumber, Epoch>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock recorded for `thread`, 0 when unknown.
    pub fn get(&self, thread: ThreadNumber) -> u64 {
        self.entries.get(&thread).map_or(0, |e| e.clock())
    }

    pub fn epoch(&self, thread: ThreadNumber) -> Option<Epoch> {
        self.entries.get(&thread).copied()
    }

    /// Raise the entry of `epoch`'s thread to `epoch` if it is newer.
    pub fn update(&mut self, epoch: Epoch) {
        self.entries
            .entry(epoch.thread())
            .and_modify(|known| {
                if epoch > *known {
                    *known = epoch;
                }
            })
            .or_insert(epoch);
    }

    /// Overwrite the entry of `epoch`'s thread unconditionally.
    pub(crate) fn assign(&mut self, epoch: Epoch) {
        self.entries.insert(epoch.thread(), epoch);
    }

    /// Pointwise maximum with `other`.
    pub fn join(&mut self, other: &VectorClock) {
        for epoch in other.entries.values() {
            self.update(*epoch);
        }
    }

    pub fn purge(&mut self, thread: ThreadNumber) {
        self.entries.remove(&thread);
    }

    /// Whether the holder of this clock has observed `epoch`.
    pub fn has_observed(&self, epoch: Epoch) -> bool {
        !epoch.is_unobserved_by(self.get(epoch.thread()))
    }

    /// Pointwise minimum with `other`; entries missing on either side drop out.
    pub fn meet(&mut self, other: &VectorClock) {
        self.entries.retain(|thread, known| match other.entries.get(thread) {
            Some(theirs) => {
                if *theirs < *known {
                    *known = *theirs;
                }
                true
            }
            None => false,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Epoch> + '_ {
        self.entries.values().copied()
    }
}
