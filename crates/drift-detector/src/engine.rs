//! The race detector: one method per event of the monitored program.

use crate::epoch::{ThreadId, ThreadNumberPool};
use crate::error::Result;
use crate::eviction::Evictor;
use crate::report::{AccessEntry, Race, RaceCallback, MAX_STACK_DEPTH};
use crate::stats::{DetectorStats, StatsSnapshot};
use crate::sync::SpinLock;
use crate::thread_state::{ThreadHandle, ThreadState};
use crate::var_state::{AccessContext, Conflict, VarState};
use crate::var_table::VarTable;
use crate::vector_clock::VectorClock;
use drift_config::{
    log_detector_debug, log_detector_info, log_detector_trace, log_detector_warn, log_sync_debug,
    log_sync_warn, Config, EvictionPolicy,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

pub const NAME: &str = "drift-fasttrack";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything guarded by the global lock.
#[derive(Default)]
struct Registry {
    threads: HashMap<ThreadId, ThreadHandle>,
    locks: HashMap<usize, VectorClock>,
    tokens: HashMap<usize, VectorClock>,
    allocations: HashMap<usize, usize>,
}

/// A conflict found under a shard lock, resolved once the lock is dropped.
struct PendingRace {
    conflict: Conflict,
    prior_tid: ThreadId,
}

#[derive(Clone, Copy)]
enum AccessKind {
    Read,
    Write,
}

/// FastTrack happens-before race detector.
///
/// Lock order is registry, then address shard, then thread clock, then stack
/// depot. The race callback runs with none of them held.
pub struct RaceDetector {
    registry: SpinLock<Registry>,
    table: VarTable,
    pool: ThreadNumberPool,
    evictor: Evictor,
    stats: DetectorStats,
    statistics: bool,
    max_stack_depth: usize,
    callback: RaceCallback,
}

impl RaceDetector {
    pub fn new<F>(config: &Config, callback: F) -> Self
    where
        F: Fn(&Race) + Send + Sync + 'static,
    {
        let detector = &config.detector;
        if config.eviction.policy.is_lossy() {
            log_detector_info!(
                "lossy eviction policy selected, some races may go unreported",
                policy = config.eviction.policy.as_str(),
            );
        }
        log_detector_debug!(
            "detector initialized",
            capacity = detector.capacity,
            shards = detector.lock_shards,
            statistics = detector.statistics,
        );

        Self {
            registry: SpinLock::new(Registry::default()),
            table: VarTable::new(detector.lock_shards),
            pool: ThreadNumberPool::new(),
            evictor: Evictor::new(&config.eviction, detector.capacity),
            stats: DetectorStats::default(),
            statistics: detector.statistics,
            max_stack_depth: detector.max_stack_depth.min(MAX_STACK_DEPTH),
            callback: Box::new(callback),
        }
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    // === Threads ===

    /// Register `child`, forked by `parent`. An unknown parent yields a thread
    /// with no inherited history.
    pub fn fork(&self, parent: ThreadId, child: ThreadId) -> Result<ThreadHandle> {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.threads.get(&child) {
            log_detector_warn!("fork of an already registered thread", child = child);
            return Ok(Arc::clone(existing));
        }

        let epoch = self.pool.allocate(child)?;
        let parent_state = registry.threads.get(&parent).cloned();
        if parent_state.is_none() {
            log_detector_debug!("fork without a known parent", parent = parent, child = child);
        }
        let state = match ThreadState::fork(child, epoch, parent_state.as_deref()) {
            Ok(state) => Arc::new(state),
            Err(e) => {
                self.pool.release(epoch);
                return Err(e);
            }
        };
        registry.threads.insert(child, Arc::clone(&state));
        log_detector_trace!(
            "thread forked",
            parent = parent,
            child = child,
            number = epoch.thread().get(),
        );
        Ok(state)
    }

    /// Merge `child`'s history into `parent` and tear `child` down.
    pub fn join(&self, parent: ThreadId, child: ThreadId) {
        let mut registry = self.registry.lock();
        let Some(child_state) = registry.threads.remove(&child) else {
            log_detector_warn!("join of an unknown thread", parent = parent, child = child);
            return;
        };
        match registry.threads.get(&parent) {
            Some(parent_state) => parent_state.merge(&child_state.vector_clock()),
            None => {
                log_detector_warn!("join into an unknown parent", parent = parent, child = child)
            }
        }
        self.teardown(&mut registry, &child_state);
    }

    /// Tear down a thread that completed without being joined.
    pub fn finish(&self, tid: ThreadId) {
        let mut registry = self.registry.lock();
        match registry.threads.remove(&tid) {
            Some(state) => self.teardown(&mut registry, &state),
            None => log_detector_warn!("finish of an unknown thread", tid = tid),
        }
    }

    /// Accepted for completeness; the thread is torn down by its `finish`.
    pub fn detach(&self, tid: ThreadId) {
        log_detector_debug!("thread detached", tid = tid);
    }

    /// Retire the thread's epochs, then purge its number everywhere.
    ///
    /// The number only becomes reusable through `fork`, which waits for the
    /// registry lock held here, so the purge finishes before any new owner
    /// appears.
    fn teardown(&self, registry: &mut Registry, thread: &ThreadState) {
        let number = thread.number();
        // Retired first: a clock that loses the entry must already treat
        // every epoch of this thread as observed.
        self.pool.release(thread.epoch());

        for vc in registry.locks.values_mut().chain(registry.tokens.values_mut()) {
            vc.purge(number);
        }
        for other in registry.threads.values() {
            other.purge(number);
        }

        if self.evictor.policy() == EvictionPolicy::ThreadPurge {
            let evicted = self.evictor.purge_thread(&self.table, number);
            self.stats.record_eviction(evicted);
        }
        log_detector_trace!("thread torn down", tid = thread.tid(), number = number.get());
    }

    pub fn live_threads(&self) -> usize {
        self.registry.lock().threads.len()
    }

    // === Synchronization ===

    /// Acquire `lock`. Only the outermost acquisition (`recursion <= 1`)
    /// synchronizes. Reader and writer acquisitions are treated alike.
    pub fn acquire(&self, thread: &ThreadState, lock: usize, recursion: u32, write: bool) {
        if recursion > 1 {
            return;
        }
        let mut registry = self.registry.lock();
        let published = registry.locks.entry(lock).or_default();
        thread.merge(published);
        log_sync_debug!("acquire", tid = thread.tid(), lock = lock, write = write);
    }

    /// Release `lock`, publishing everything the thread has observed.
    pub fn release(&self, thread: &ThreadState, lock: usize, write: bool) -> Result<()> {
        let mut registry = self.registry.lock();
        match registry.locks.entry(lock) {
            Entry::Vacant(slot) => {
                log_sync_warn!(
                    "release of a lock that was never acquired",
                    tid = thread.tid(),
                    lock = lock,
                );
                slot.insert(VectorClock::new());
            }
            Entry::Occupied(mut slot) => {
                let mut clock = thread.clock();
                clock.advance()?;
                slot.get_mut().join(clock.vector());
                log_sync_debug!("release", tid = thread.tid(), lock = lock, write = write);
            }
        }
        Ok(())
    }

    /// Source side of a one-shot ordering arc identified by `token`.
    pub fn happens_before(&self, thread: &ThreadState, token: usize) -> Result<()> {
        let mut registry = self.registry.lock();
        let published = registry.tokens.entry(token).or_default();
        let mut clock = thread.clock();
        clock.advance()?;
        published.join(clock.vector());
        Ok(())
    }

    /// Sink side of the arc identified by `token`.
    pub fn happens_after(&self, thread: &ThreadState, token: usize) {
        let mut registry = self.registry.lock();
        match registry.tokens.entry(token) {
            Entry::Occupied(published) => thread.merge(published.get()),
            Entry::Vacant(slot) => {
                log_sync_debug!("happens_after without a prior happens_before", token = token);
                slot.insert(VectorClock::new());
            }
        }
    }

    // === Memory ===

    pub fn read(&self, thread: &ThreadState, pc: usize, addr: usize, size: usize) {
        self.access(thread, pc, addr, size, AccessKind::Read);
    }

    pub fn write(&self, thread: &ThreadState, pc: usize, addr: usize, size: usize) {
        self.access(thread, pc, addr, size, AccessKind::Write);
    }

    fn access(&self, thread: &ThreadState, pc: usize, addr: usize, size: usize, kind: AccessKind) {
        thread.record_access(addr, pc);

        let (pending, created) = self.table.with_entry(addr, |var, created| {
            let clock = thread.clock();
            let ctx = AccessContext::new(&clock, &self.pool);
            let conflicts = match kind {
                AccessKind::Read => {
                    if created {
                        log_detector_trace!("read before any write", address = addr);
                    }
                    let outcome = var.read(&ctx);
                    if self.statistics {
                        self.stats.record_read(outcome.rule);
                    }
                    outcome.conflicts
                }
                AccessKind::Write => {
                    let outcome = var.write(&ctx);
                    if self.statistics {
                        self.stats.record_write(outcome.rule);
                    }
                    outcome.conflicts
                }
            };
            let pending: Vec<PendingRace> = conflicts
                .into_iter()
                .filter_map(|conflict| match self.pool.owner(conflict.prior.thread()) {
                    Some(prior_tid) => Some(PendingRace {
                        conflict,
                        prior_tid,
                    }),
                    // Owner left between the check and now; its epochs are retired.
                    None => {
                        log_detector_debug!(
                            "dropping race against a departed thread",
                            address = addr,
                            prior = conflict.prior.raw(),
                        );
                        None
                    }
                })
                .collect();
            (pending, created)
        });

        for race in pending {
            self.report(thread, race, addr, size);
        }

        if created && self.evictor.is_due(self.table.len()) {
            self.evictor.run(&self.table, &self.pool, &self.stats, || self.horizon());
        }
    }

    /// Per-thread-number minimum over every live thread's vector clock.
    fn horizon(&self) -> VectorClock {
        let registry = self.registry.lock();
        let mut threads = registry.threads.values();
        let Some(first) = threads.next() else {
            return VectorClock::new();
        };
        let mut horizon = first.vector_clock();
        for thread in threads {
            horizon.meet(thread.clock().vector());
        }
        horizon
    }

    fn report(&self, thread: &ThreadState, race: PendingRace, addr: usize, size: usize) {
        let kind = race.conflict.kind;
        self.stats.record_race(kind);

        let prior_state = self
            .registry
            .lock()
            .threads
            .get(&race.prior_tid)
            .filter(|state| state.number() == race.conflict.prior.thread())
            .cloned();
        let prior_stack = prior_state
            .as_ref()
            .map(|state| state.reconstruct_stack(addr, self.max_stack_depth))
            .unwrap_or_default();

        let report = Race {
            kind,
            prior: AccessEntry {
                thread_id: race.prior_tid,
                write: kind.prior_is_write(),
                address: addr,
                size,
                stack: prior_stack,
            },
            current: AccessEntry {
                thread_id: thread.tid(),
                write: kind.current_is_write(),
                address: addr,
                size,
                stack: thread.reconstruct_stack(addr, self.max_stack_depth),
            },
        };
        log_detector_debug!(
            "race detected",
            kind = kind.as_str(),
            address = addr,
            prior = report.prior.thread_id,
            current = report.current.thread_id,
        );
        (self.callback)(&report);
    }

    pub fn func_enter(&self, thread: &ThreadState, pc: usize) {
        thread.enter(pc);
    }

    pub fn func_exit(&self, thread: &ThreadState) {
        thread.exit();
    }

    /// Remember an allocation so its range can be forgotten on free.
    pub fn allocate(&self, thread: &ThreadState, pc: usize, addr: usize, size: usize) {
        let mut registry = self.registry.lock();
        if let Some(previous) = registry.allocations.insert(addr, size) {
            log_detector_debug!(
                "allocation replaces an unfreed one",
                address = addr,
                previous = previous,
            );
        }
        log_detector_trace!(
            "allocate",
            tid = thread.tid(),
            pc = pc,
            address = addr,
            size = size,
        );
    }

    /// Forget all location state inside the allocation starting at `addr`.
    pub fn deallocate(&self, thread: &ThreadState, addr: usize) {
        let mut registry = self.registry.lock();
        match registry.allocations.remove(&addr) {
            Some(size) => {
                let removed = self.table.remove_range(addr, size);
                log_detector_trace!(
                    "deallocate",
                    tid = thread.tid(),
                    address = addr,
                    removed = removed,
                );
            }
            None => log_detector_debug!("free of an unknown allocation", address = addr),
        }
    }

    // === Lifecycle and diagnostics ===

    /// Drop all state. Callers guarantee no other thread is issuing events.
    pub fn finalize(&self) {
        {
            let mut registry = self.registry.lock();
            *registry = Registry::default();
            self.table.clear();
            self.pool.reset();
        }
        self.evictor.reset();
        if self.statistics {
            self.stats.snapshot().log_summary();
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of locations with race state.
    pub fn tracked_locations(&self) -> usize {
        self.table.len()
    }

    /// Forget the race state of one location.
    pub fn clear_var_state(&self, addr: usize) -> bool {
        self.table.remove(addr)
    }

    /// Snapshot of the race state of one location.
    pub fn var_state(&self, addr: usize) -> Option<VarState> {
        self.table.get(addr)
    }
}
