use crate::sync::SpinLock;
use crate::var_state::VarState;
use crossbeam::utils::CachePadded;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

type Shard = CachePadded<SpinLock<HashMap<usize, VarState>>>;

/// Address-sharded table of per-location race state.
///
/// The shard lock serializes every access to the locations hashed into it.
/// State is only ever touched through a closure run under that lock, so no
/// reference into a shard can outlive its guard.
pub struct VarTable {
    shards: Box<[Shard]>,
    mask: usize,
    len: AtomicUsize,
}

impl VarTable {
    /// A table with `shards` locks, rounded up to a power of two.
    pub fn new(shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        Self {
            shards: (0..count)
                .map(|_| CachePadded::new(SpinLock::new(HashMap::new())))
                .collect(),
            mask: count - 1,
            len: AtomicUsize::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, addr: usize) -> usize {
        (addr >> 4) & self.mask
    }

    /// Run `f` on the state of `addr` under its shard lock, creating it first
    /// if needed. `f` learns whether the entry was just created.
    pub fn with_entry<R>(&self, addr: usize, f: impl FnOnce(&mut VarState, bool) -> R) -> R {
        let mut shard = self.shards[self.shard_index(addr)].lock();
        let mut created = false;
        let state = shard.entry(addr).or_insert_with(|| {
            created = true;
            VarState::new()
        });
        if created {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        f(state, created)
    }

    pub fn get(&self, addr: usize) -> Option<VarState> {
        self.shards[self.shard_index(addr)].lock().get(&addr).cloned()
    }

    pub fn remove(&self, addr: usize) -> bool {
        let removed = self.shards[self.shard_index(addr)].lock().remove(&addr).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry in `[start, start + size)`.
    pub fn remove_range(&self, start: usize, size: usize) -> usize {
        let end = start.saturating_add(size);
        if size <= self.len() {
            (start..end).filter(|addr| self.remove(*addr)).count()
        } else {
            self.retain(|addr, _| !(start..end).contains(&addr))
        }
    }

    /// Keep only the entries for which `keep` holds, one shard at a time.
    /// Returns the number of removed entries.
    pub fn retain(&self, mut keep: impl FnMut(usize, &VarState) -> bool) -> usize {
        self.shards
            .iter()
            .map(|shard| self.retain_shard(shard, &mut keep))
            .sum()
    }

    /// Like [`VarTable::retain`], visiting shards starting at `first`.
    pub fn retain_from(
        &self,
        first: usize,
        mut keep: impl FnMut(usize, &VarState) -> bool,
    ) -> usize {
        let count = self.shards.len();
        (0..count)
            .map(|i| self.retain_shard(&self.shards[(first + i) % count], &mut keep))
            .sum()
    }

    fn retain_shard(
        &self,
        shard: &Shard,
        keep: &mut impl FnMut(usize, &VarState) -> bool,
    ) -> usize {
        let mut map = shard.lock();
        let before = map.len();
        map.retain(|addr, state| keep(*addr, state));
        let removed = before - map.len();
        if removed > 0 {
            self.len.fetch_sub(removed, Ordering::Relaxed);
        }
        removed
    }

    /// Collect `f` of every entry, locking one shard at a time.
    pub fn scan<T>(&self, mut f: impl FnMut(usize, &VarState) -> T) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let map = shard.lock();
            out.extend(map.iter().map(|(addr, state)| f(*addr, state)));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let n = map.len();
            map.clear();
            self.len.fetch_sub(n, Ordering::Relaxed);
        }
    }
}
