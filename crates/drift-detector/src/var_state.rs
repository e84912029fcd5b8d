//! Per-location race state machine.
//!
//! A location remembers its last write epoch and either one exclusive read
//! epoch or, once unordered readers from different threads pile up, one read
//! epoch per thread. Each access is checked against that history and then
//! folded into it.

use crate::epoch::{Epoch, ThreadNumber, ThreadNumberPool};
use crate::thread_state::ThreadClock;
use crate::vector_clock::VectorClock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadState {
    #[default]
    None,
    Exclusive(Epoch),
    Shared(Vec<Epoch>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninit,
    Written,
    ReadExclusive,
    ReadShared,
}

/// Which pair of accesses conflicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaceKind {
    /// Earlier write, current read
    WriteRead,
    /// Earlier write, current write
    WriteWrite,
    /// Earlier exclusive read, current write
    ReadWriteExclusive,
    /// One of several earlier shared reads, current write
    ReadWriteShared,
}

impl RaceKind {
    pub fn prior_is_write(self) -> bool {
        matches!(self, RaceKind::WriteRead | RaceKind::WriteWrite)
    }

    pub fn current_is_write(self) -> bool {
        !matches!(self, RaceKind::WriteRead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RaceKind::WriteRead => "wr",
            RaceKind::WriteWrite => "ww",
            RaceKind::ReadWriteExclusive => "rw_ex",
            RaceKind::ReadWriteShared => "rw_sh",
        }
    }
}

/// An earlier access the current one is not ordered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub kind: RaceKind,
    pub prior: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRule {
    /// Same epoch as the exclusive reader
    SameEpoch,
    /// Same epoch as this thread's shared-list entry
    SharedSameEpoch,
    Exclusive,
    /// Promotion from exclusive to shared
    Share,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRule {
    SameEpoch,
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<R> {
    pub rule: R,
    pub conflicts: Vec<Conflict>,
}

impl<R> Outcome<R> {
    fn quiet(rule: R) -> Self {
        Self {
            rule,
            conflicts: Vec::new(),
        }
    }
}

/// The accessing thread as seen by the race rules.
pub struct AccessContext<'a> {
    epoch: Epoch,
    vc: &'a VectorClock,
    pool: &'a ThreadNumberPool,
}

impl<'a> AccessContext<'a> {
    pub fn new(clock: &'a ThreadClock, pool: &'a ThreadNumberPool) -> Self {
        Self {
            epoch: clock.epoch(),
            vc: clock.vector(),
            pool,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn number(&self) -> ThreadNumber {
        self.epoch.thread()
    }

    /// Whether `prior` may still race with this access.
    fn unordered(&self, prior: Epoch) -> bool {
        prior.thread() != self.number()
            && !self.vc.has_observed(prior)
            && !self.pool.is_retired(prior)
    }
}

/// Race history of one location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarState {
    write: Option<Epoch>,
    read: ReadState,
}

impl VarState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_epoch(&self) -> Option<Epoch> {
        self.write
    }

    pub fn read_state(&self) -> &ReadState {
        &self.read
    }

    pub fn phase(&self) -> Phase {
        match (&self.read, self.write) {
            (ReadState::Shared(_), _) => Phase::ReadShared,
            (ReadState::Exclusive(_), _) => Phase::ReadExclusive,
            (ReadState::None, Some(_)) => Phase::Written,
            (ReadState::None, None) => Phase::Uninit,
        }
    }

    pub fn read(&mut self, ctx: &AccessContext<'_>) -> Outcome<ReadRule> {
        let me = ctx.epoch();
        match &self.read {
            ReadState::Exclusive(e) if *e == me => return Outcome::quiet(ReadRule::SameEpoch),
            ReadState::Shared(list) if list.contains(&me) => {
                return Outcome::quiet(ReadRule::SharedSameEpoch)
            }
            _ => {}
        }

        let mut conflicts = Vec::new();
        if let Some(w) = self.write {
            if ctx.unordered(w) {
                conflicts.push(Conflict {
                    kind: RaceKind::WriteRead,
                    prior: w,
                });
            }
        }

        let rule = match &mut self.read {
            ReadState::None => {
                self.read = ReadState::Exclusive(me);
                ReadRule::Exclusive
            }
            ReadState::Exclusive(prev) if prev.thread() == me.thread() => {
                *prev = me;
                ReadRule::Exclusive
            }
            ReadState::Exclusive(prev) => {
                let prev = *prev;
                self.read = ReadState::Shared(vec![prev, me]);
                ReadRule::Share
            }
            ReadState::Shared(list) => {
                match list.iter_mut().find(|e| e.thread() == me.thread()) {
                    Some(slot) => *slot = me,
                    None => list.push(me),
                }
                ReadRule::Shared
            }
        };

        Outcome { rule, conflicts }
    }

    pub fn write(&mut self, ctx: &AccessContext<'_>) -> Outcome<WriteRule> {
        let me = ctx.epoch();
        if self.write == Some(me) {
            return Outcome::quiet(WriteRule::SameEpoch);
        }

        let mut conflicts = Vec::new();
        if let Some(w) = self.write {
            if ctx.unordered(w) {
                conflicts.push(Conflict {
                    kind: RaceKind::WriteWrite,
                    prior: w,
                });
            }
        }

        let rule = match &self.read {
            ReadState::None => WriteRule::Exclusive,
            ReadState::Exclusive(r) => {
                if ctx.unordered(*r) {
                    conflicts.push(Conflict {
                        kind: RaceKind::ReadWriteExclusive,
                        prior: *r,
                    });
                }
                WriteRule::Exclusive
            }
            ReadState::Shared(list) => {
                if let Some(r) = list.iter().copied().find(|r| ctx.unordered(*r)) {
                    conflicts.push(Conflict {
                        kind: RaceKind::ReadWriteShared,
                        prior: r,
                    });
                }
                WriteRule::Shared
            }
        };

        self.read = ReadState::None;
        self.write = Some(me);
        Outcome { rule, conflicts }
    }

    fn epochs(&self) -> impl Iterator<Item = Epoch> + '_ {
        let reads: &[Epoch] = match &self.read {
            ReadState::None => &[],
            ReadState::Exclusive(e) => std::slice::from_ref(e),
            ReadState::Shared(list) => list,
        };
        self.write.into_iter().chain(reads.iter().copied())
    }

    /// Whether no future access can race with this history: every epoch is
    /// either retired or below the per-thread minimum of all live threads.
    pub fn is_settled(&self, horizon: &VectorClock, pool: &ThreadNumberPool) -> bool {
        self.epochs().all(|e| pool.is_retired(e) || horizon.has_observed(e))
    }

    /// Whether every recorded epoch belongs to `number`.
    pub fn touched_only_by(&self, number: ThreadNumber) -> bool {
        let mut epochs = self.epochs().peekable();
        epochs.peek().is_some() && epochs.all(|e| e.thread() == number)
    }

    /// Sort key for the lowest-clock policy; read-only entries sort first.
    pub fn write_clock(&self) -> u64 {
        self.write.map_or(0, |w| w.clock())
    }
}
