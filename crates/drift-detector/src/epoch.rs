//! Epochs and the thread-number pool.
//!
//! An epoch packs a recyclable thread number into the upper 16 bits of a `u64`
//! and that thread's logical clock into the lower 48 bits. Number 0 is never
//! handed out, which lets `Option<Epoch>` stay eight bytes wide.
//!
//! Recycled numbers never restart their clock. When a number is released at
//! final clock `c`, its floor becomes `c + 1` and the next owner starts there,
//! so every epoch below the floor belongs to a torn-down thread. Such retired
//! epochs are treated as observed by everyone.

use crate::error::{DetectorError, Result};
use crate::sync::SpinLock;
use std::fmt;
use std::num::{NonZeroU16, NonZeroU64};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier the instrumentation layer uses for a thread.
pub type ThreadId = u64;

pub const THREAD_BITS: u32 = 16;
pub const CLOCK_BITS: u32 = 48;
pub const MAX_CLOCK: u64 = (1 << CLOCK_BITS) - 1;
/// Upper bound on concurrently live monitored threads.
pub const MAX_THREADS: usize = (1 << THREAD_BITS) - 1;

const CLOCK_SPAN: NonZeroU64 = match NonZeroU64::new(1 << CLOCK_BITS) {
    Some(span) => span,
    None => panic!("clock span must be non-zero"),
};

const NO_OWNER: u64 = u64::MAX;

/// A recyclable thread number, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadNumber(NonZeroU16);

impl ThreadNumber {
    pub fn new(value: u16) -> Option<Self> {
        NonZeroU16::new(value).map(ThreadNumber)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }

    fn index(self) -> usize {
        usize::from(self.0.get())
    }
}

impl fmt::Display for ThreadNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (thread number, clock) pair packed into one comparable word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(NonZeroU64);

impl Epoch {
    /// Clocks wider than 48 bits are truncated; [`Epoch::advance`] never produces one.
    pub fn new(thread: ThreadNumber, clock: u64) -> Self {
        debug_assert!(clock <= MAX_CLOCK);
        let high = NonZeroU64::from(thread.0).saturating_mul(CLOCK_SPAN);
        Epoch(high | (clock & MAX_CLOCK))
    }

    pub fn thread(self) -> ThreadNumber {
        let high = (self.0.get() >> CLOCK_BITS) as u16;
        match NonZeroU16::new(high) {
            Some(number) => ThreadNumber(number),
            // `new` is the only constructor and always writes a non-zero number.
            None => unreachable!("epoch {:#x} carries no thread number", self.0),
        }
    }

    pub fn clock(self) -> u64 {
        self.0.get() & MAX_CLOCK
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }

    /// The next epoch of the same thread.
    pub fn advance(self) -> Result<Epoch> {
        let clock = self.clock();
        if clock == MAX_CLOCK {
            return Err(DetectorError::ClockOverflow {
                thread: self.thread(),
            });
        }
        Ok(Epoch::new(self.thread(), clock + 1))
    }

    /// Whether a thread that recorded `known_clock` for this epoch's thread
    /// has not yet observed this epoch.
    pub fn is_unobserved_by(self, known_clock: u64) -> bool {
        self.clock() >= known_clock
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.thread(), self.clock())
    }
}

struct FreeList {
    recycled: Vec<ThreadNumber>,
    next_fresh: usize,
    live: usize,
}

/// Bounded pool of thread numbers with per-number ownership and clock floors.
///
/// Allocation and release serialize on an internal lock. Owner and floor
/// lookups are lock-free so the access path can consult them while holding
/// an address shard.
pub struct ThreadNumberPool {
    free: SpinLock<FreeList>,
    owners: Box<[AtomicU64]>,
    floors: Box<[AtomicU64]>,
}

impl ThreadNumberPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_THREADS)
    }

    /// A pool handing out numbers `1..=capacity` (clamped to [`MAX_THREADS`]).
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = capacity.clamp(1, MAX_THREADS) + 1;
        Self {
            free: SpinLock::new(FreeList {
                recycled: Vec::new(),
                next_fresh: 1,
                live: 0,
            }),
            owners: (0..slots).map(|_| AtomicU64::new(NO_OWNER)).collect(),
            floors: (0..slots).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.owners.len() - 1
    }

    /// Bind a number to `tid` and return its starting epoch.
    ///
    /// The most recently released number is reused first; fresh numbers are
    /// minted in ascending order once nothing is left to recycle.
    pub fn allocate(&self, tid: ThreadId) -> Result<Epoch> {
        let mut free = self.free.lock();
        let number = match free.recycled.pop() {
            Some(number) => number,
            None => {
                let fresh = (free.next_fresh <= self.capacity())
                    .then(|| u16::try_from(free.next_fresh).ok())
                    .flatten()
                    .and_then(ThreadNumber::new)
                    .ok_or(DetectorError::ThreadNumbersExhausted {
                        max: self.capacity(),
                    })?;
                free.next_fresh += 1;
                fresh
            }
        };
        free.live += 1;

        self.owners[number.index()].store(tid, Ordering::Release);
        let start = self.floors[number.index()].load(Ordering::Acquire);
        Ok(Epoch::new(number, start))
    }

    /// Return a number whose owner finished at `last`.
    ///
    /// Every epoch of the number up to `last` is retired before this returns,
    /// so callers may purge the number from vector clocks afterwards. They must
    /// finish that purge before the number can be allocated again. A number
    /// whose clock space is used up is retired for good instead of recycled.
    pub fn release(&self, last: Epoch) {
        let number = last.thread();
        let mut free = self.free.lock();
        self.floors[number.index()].store(last.clock() + 1, Ordering::Release);
        self.owners[number.index()].store(NO_OWNER, Ordering::Release);
        free.live = free.live.saturating_sub(1);
        if last.clock() < MAX_CLOCK {
            free.recycled.push(number);
        }
    }

    /// Current owner of a number, if it is bound.
    pub fn owner(&self, number: ThreadNumber) -> Option<ThreadId> {
        match self.owners.get(number.index())?.load(Ordering::Acquire) {
            NO_OWNER => None,
            tid => Some(tid),
        }
    }

    pub fn floor(&self, number: ThreadNumber) -> u64 {
        self.floors
            .get(number.index())
            .map_or(0, |floor| floor.load(Ordering::Acquire))
    }

    /// Whether `epoch` was produced by a thread that has since been torn down.
    pub fn is_retired(&self, epoch: Epoch) -> bool {
        epoch.clock() < self.floor(epoch.thread())
    }

    pub fn live(&self) -> usize {
        self.free.lock().live
    }

    /// Forget every binding and floor. Only valid once no thread is live.
    pub fn reset(&self) {
        let mut free = self.free.lock();
        free.recycled.clear();
        free.next_fresh = 1;
        free.live = 0;
        for owner in self.owners.iter() {
            owner.store(NO_OWNER, Ordering::Release);
        }
        for floor in self.floors.iter() {
            floor.store(0, Ordering::Release);
        }
    }
}

impl Default for ThreadNumberPool {
    fn default() -> Self {
        Self::new()
    }
}
