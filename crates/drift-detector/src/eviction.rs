//! Bounded-memory eviction of location state.
//!
//! Eviction runs on whichever thread pushes the table past its capacity. Only
//! one thread evicts at a time; the others carry on without waiting.
//!
//! [`EvictionPolicy::SafeSweep`] and [`EvictionPolicy::ThreadPurge`] only drop
//! history no future access can race with. [`EvictionPolicy::RandomSample`]
//! and [`EvictionPolicy::LowestClock`] may drop history that would have
//! exposed a race; pick them only when memory matters more than recall.

use crate::epoch::{ThreadNumber, ThreadNumberPool};
use crate::stats::DetectorStats;
use crate::sync::SpinLock;
use crate::var_table::VarTable;
use crate::vector_clock::VectorClock;
use drift_config::{
    log_evict_debug, log_evict_info, log_evict_trace, EvictionConfig, EvictionPolicy,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct SweepState {
    last_horizon: Option<VectorClock>,
    backoff: u32,
    skip: u32,
}

impl SweepState {
    fn back_off(&mut self, max_backoff: u32) {
        self.backoff = self.backoff.saturating_mul(2).clamp(1, max_backoff.max(1));
        self.skip = self.backoff;
    }
}

pub(crate) struct Evictor {
    policy: EvictionPolicy,
    capacity: usize,
    sample_size: usize,
    batch_size: usize,
    max_backoff: u32,
    running: AtomicBool,
    sweep: SpinLock<SweepState>,
    rng: SpinLock<StdRng>,
}

/// Clears the running flag when the current eviction pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Evictor {
    pub(crate) fn new(config: &EvictionConfig, capacity: usize) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            policy: config.policy,
            capacity,
            sample_size: config.sample_size.max(1),
            batch_size: config.batch_size.max(1),
            max_backoff: config.max_backoff,
            running: AtomicBool::new(false),
            sweep: SpinLock::new(SweepState::default()),
            rng: SpinLock::new(rng),
        }
    }

    pub(crate) fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Whether a table of `len` entries is due for eviction.
    pub(crate) fn is_due(&self, len: usize) -> bool {
        self.capacity > 0 && len >= self.capacity && self.policy != EvictionPolicy::ThreadPurge
    }

    fn begin(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RunningGuard(&self.running))
    }

    /// Run one pass of the capacity-triggered policy. `horizon` is asked for
    /// the per-thread minimum of all live vector clocks only when needed.
    pub(crate) fn run(
        &self,
        table: &VarTable,
        pool: &ThreadNumberPool,
        stats: &DetectorStats,
        horizon: impl FnOnce() -> VectorClock,
    ) -> usize {
        let Some(_running) = self.begin() else {
            return 0;
        };

        let before = table.len();
        let evicted = match self.policy {
            EvictionPolicy::SafeSweep => match self.safe_sweep(table, pool, horizon) {
                Some(evicted) => evicted,
                None => {
                    stats.record_eviction_skip();
                    return 0;
                }
            },
            EvictionPolicy::RandomSample => self.random_sample(table),
            EvictionPolicy::LowestClock => self.lowest_clock(table),
            EvictionPolicy::ThreadPurge => return 0,
        };

        stats.record_eviction(evicted);
        log_evict_info!(
            "eviction pass finished",
            policy = self.policy.as_str(),
            before = before,
            evicted = evicted,
        );
        evicted
    }

    /// `None` when the pass was skipped by the back-off.
    fn safe_sweep(
        &self,
        table: &VarTable,
        pool: &ThreadNumberPool,
        horizon: impl FnOnce() -> VectorClock,
    ) -> Option<usize> {
        {
            let mut state = self.sweep.lock();
            if state.skip > 0 {
                state.skip -= 1;
                log_evict_trace!("sweep backing off", remaining = state.skip);
                return None;
            }
        }

        let horizon = horizon();

        let mut state = self.sweep.lock();
        if state.last_horizon.as_ref() == Some(&horizon) {
            state.back_off(self.max_backoff);
            log_evict_debug!("horizon has not advanced", backoff = state.backoff);
            return None;
        }
        drop(state);

        let evicted = table.retain(|_, var| !var.is_settled(&horizon, pool));

        let mut state = self.sweep.lock();
        state.last_horizon = Some(horizon);
        if evicted == 0 {
            state.back_off(self.max_backoff);
        } else {
            state.backoff = 0;
        }
        Some(evicted)
    }

    fn random_sample(&self, table: &VarTable) -> usize {
        let len = table.len();
        if len == 0 {
            return 0;
        }
        let target = self.sample_size.min(len);
        let p = target as f64 / len as f64;

        let mut rng = self.rng.lock();
        let first = rng.gen_range(0..table.shard_count());
        let mut removed = 0;
        table.retain_from(first, |_, _| {
            if removed < target && rng.gen_bool(p) {
                removed += 1;
                false
            } else {
                true
            }
        })
    }

    fn lowest_clock(&self, table: &VarTable) -> usize {
        let entries = table.scan(|addr, var| (var.write_clock(), addr));
        entries
            .chunks(self.batch_size)
            .filter_map(|batch| batch.iter().min().map(|(_, addr)| *addr))
            .filter(|addr| table.remove(*addr))
            .count()
    }

    /// Drop entries only `number` ever touched. Runs once the number has been
    /// released, when all of those epochs are retired.
    pub(crate) fn purge_thread(&self, table: &VarTable, number: ThreadNumber) -> usize {
        let evicted = table.retain(|_, var| !var.touched_only_by(number));
        if evicted > 0 {
            log_evict_debug!("purged thread entries", thread = number.get(), evicted = evicted);
        }
        evicted
    }

    pub(crate) fn reset(&self) {
        *self.sweep.lock() = SweepState::default();
    }
}
