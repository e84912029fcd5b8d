use crate::var_state::{RaceKind, ReadRule, WriteRule};
use drift_config::log_detector_info;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rule-hit, race and eviction counters.
#[derive(Debug, Default)]
pub struct DetectorStats {
    read_same_epoch: AtomicU64,
    read_shared_same_epoch: AtomicU64,
    read_exclusive: AtomicU64,
    read_share: AtomicU64,
    read_shared: AtomicU64,
    write_same_epoch: AtomicU64,
    write_exclusive: AtomicU64,
    write_shared: AtomicU64,
    race_wr: AtomicU64,
    race_ww: AtomicU64,
    race_rw_ex: AtomicU64,
    race_rw_sh: AtomicU64,
    eviction_runs: AtomicU64,
    eviction_skips: AtomicU64,
    evicted: AtomicU64,
}

impl DetectorStats {
    pub fn record_read(&self, rule: ReadRule) {
        let counter = match rule {
            ReadRule::SameEpoch => &self.read_same_epoch,
            ReadRule::SharedSameEpoch => &self.read_shared_same_epoch,
            ReadRule::Exclusive => &self.read_exclusive,
            ReadRule::Share => &self.read_share,
            ReadRule::Shared => &self.read_shared,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, rule: WriteRule) {
        let counter = match rule {
            WriteRule::SameEpoch => &self.write_same_epoch,
            WriteRule::Exclusive => &self.write_exclusive,
            WriteRule::Shared => &self.write_shared,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_race(&self, kind: RaceKind) {
        let counter = match kind {
            RaceKind::WriteRead => &self.race_wr,
            RaceKind::WriteWrite => &self.race_ww,
            RaceKind::ReadWriteExclusive => &self.race_rw_ex,
            RaceKind::ReadWriteShared => &self.race_rw_sh,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, evicted: usize) {
        self.eviction_runs.fetch_add(1, Ordering::Relaxed);
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    pub fn record_eviction_skip(&self) {
        self.eviction_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            read_same_epoch: load(&self.read_same_epoch),
            read_shared_same_epoch: load(&self.read_shared_same_epoch),
            read_exclusive: load(&self.read_exclusive),
            read_share: load(&self.read_share),
            read_shared: load(&self.read_shared),
            write_same_epoch: load(&self.write_same_epoch),
            write_exclusive: load(&self.write_exclusive),
            write_shared: load(&self.write_shared),
            race_wr: load(&self.race_wr),
            race_ww: load(&self.race_ww),
            race_rw_ex: load(&self.race_rw_ex),
            race_rw_sh: load(&self.race_rw_sh),
            eviction_runs: load(&self.eviction_runs),
            eviction_skips: load(&self.eviction_skips),
            evicted: load(&self.evicted),
        }
    }
}

/// Plain copy of [`DetectorStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub read_same_epoch: u64,
    pub read_shared_same_epoch: u64,
    pub read_exclusive: u64,
    pub read_share: u64,
    pub read_shared: u64,
    pub write_same_epoch: u64,
    pub write_exclusive: u64,
    pub write_shared: u64,
    pub race_wr: u64,
    pub race_ww: u64,
    pub race_rw_ex: u64,
    pub race_rw_sh: u64,
    pub eviction_runs: u64,
    pub eviction_skips: u64,
    pub evicted: u64,
}

impl StatsSnapshot {
    pub fn reads(&self) -> u64 {
        self.read_same_epoch
            + self.read_shared_same_epoch
            + self.read_exclusive
            + self.read_share
            + self.read_shared
    }

    pub fn writes(&self) -> u64 {
        self.write_same_epoch + self.write_exclusive + self.write_shared
    }

    pub fn races(&self) -> u64 {
        self.race_wr + self.race_ww + self.race_rw_ex + self.race_rw_sh
    }

    pub fn races_of(&self, kind: RaceKind) -> u64 {
        match kind {
            RaceKind::WriteRead => self.race_wr,
            RaceKind::WriteWrite => self.race_ww,
            RaceKind::ReadWriteExclusive => self.race_rw_ex,
            RaceKind::ReadWriteShared => self.race_rw_sh,
        }
    }

    /// Emit the rule-hit distribution as one structured log line per family.
    pub fn log_summary(&self) {
        let reads = self.reads();
        let writes = self.writes();
        log_detector_info!(
            "read rule hits",
            total = reads,
            same_epoch = percent(self.read_same_epoch, reads),
            shared_same_epoch = percent(self.read_shared_same_epoch, reads),
            exclusive = percent(self.read_exclusive, reads),
            share = percent(self.read_share, reads),
            shared = percent(self.read_shared, reads),
        );
        log_detector_info!(
            "write rule hits",
            total = writes,
            same_epoch = percent(self.write_same_epoch, writes),
            exclusive = percent(self.write_exclusive, writes),
            shared = percent(self.write_shared, writes),
        );
        log_detector_info!(
            "races",
            wr = self.race_wr,
            ww = self.race_ww,
            rw_ex = self.race_rw_ex,
            rw_sh = self.race_rw_sh,
        );
        log_detector_info!(
            "eviction",
            runs = self.eviction_runs,
            skipped = self.eviction_skips,
            evicted = self.evicted,
        );
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}
