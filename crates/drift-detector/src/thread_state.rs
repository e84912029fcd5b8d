use crate::epoch::{Epoch, ThreadId, ThreadNumber};
use crate::error::Result;
use crate::stack_depot::{NodeId, StackDepot};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::vector_clock::VectorClock;
use dashmap::DashMap;
use std::sync::Arc;

/// Shared handle to a live thread, passed back on every event of that thread.
pub type ThreadHandle = Arc<ThreadState>;

/// A thread's own epoch together with everything it has observed.
#[derive(Debug, Clone)]
pub struct ThreadClock {
    epoch: Epoch,
    vc: VectorClock,
}

impl ThreadClock {
    fn new(epoch: Epoch, inherited: VectorClock) -> Self {
        let mut vc = inherited;
        vc.assign(epoch);
        Self { epoch, vc }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn number(&self) -> ThreadNumber {
        self.epoch.thread()
    }

    pub fn vector(&self) -> &VectorClock {
        &self.vc
    }

    /// Tick the own clock and mirror it into the own vector slot.
    pub fn advance(&mut self) -> Result<Epoch> {
        self.epoch = self.epoch.advance()?;
        self.vc.assign(self.epoch);
        Ok(self.epoch)
    }

    pub fn merge(&mut self, other: &VectorClock) {
        self.vc.join(other);
        self.vc.assign(self.epoch);
    }
}

/// Where a thread last touched an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub pc: usize,
    pub node: NodeId,
}

/// One monitored thread.
#[derive(Debug)]
pub struct ThreadState {
    tid: ThreadId,
    number: ThreadNumber,
    clock: SpinLock<ThreadClock>,
    depot: SpinLock<StackDepot>,
    accesses: DashMap<usize, Provenance>,
}

impl ThreadState {
    /// Create the state for a thread starting at `epoch`.
    ///
    /// With a parent, the parent ticks first and the child inherits
    /// everything the parent has observed up to the fork.
    pub fn fork(tid: ThreadId, epoch: Epoch, parent: Option<&ThreadState>) -> Result<Self> {
        let inherited = match parent {
            Some(parent) => {
                let mut clock = parent.clock.lock();
                clock.advance()?;
                clock.vc.clone()
            }
            None => VectorClock::new(),
        };

        Ok(Self {
            tid,
            number: epoch.thread(),
            clock: SpinLock::new(ThreadClock::new(epoch, inherited)),
            depot: SpinLock::new(StackDepot::new()),
            accesses: DashMap::new(),
        })
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn number(&self) -> ThreadNumber {
        self.number
    }

    pub fn epoch(&self) -> Epoch {
        self.clock.lock().epoch
    }

    /// Lock the thread clock. Callers holding an address shard may take it.
    pub fn clock(&self) -> SpinLockGuard<'_, ThreadClock> {
        self.clock.lock()
    }

    /// Snapshot of the thread's vector clock.
    pub fn vector_clock(&self) -> VectorClock {
        self.clock.lock().vc.clone()
    }

    pub fn advance_own_clock(&self) -> Result<Epoch> {
        self.clock.lock().advance()
    }

    pub fn merge(&self, other: &VectorClock) {
        self.clock.lock().merge(other);
    }

    pub fn purge(&self, number: ThreadNumber) {
        if number != self.number {
            self.clock.lock().vc.purge(number);
        }
    }

    pub fn enter(&self, pc: usize) {
        self.depot.lock().enter(pc);
    }

    pub fn exit(&self) {
        self.depot.lock().exit();
    }

    pub fn stack_depth(&self) -> usize {
        self.depot.lock().depth()
    }

    /// Remember the call path of an access so a later report can show it.
    pub fn record_access(&self, addr: usize, pc: usize) {
        let node = self.depot.lock().current();
        self.accesses.insert(addr, Provenance { pc, node });
    }

    pub fn provenance(&self, addr: usize) -> Option<Provenance> {
        self.accesses.get(&addr).map(|entry| *entry)
    }

    /// Stack of the last access to `addr`, empty when none was recorded.
    pub fn reconstruct_stack(&self, addr: usize, max_depth: usize) -> Vec<usize> {
        match self.provenance(addr) {
            Some(p) => self.depot.lock().trace(p.node, p.pc, max_depth),
            None => Vec::new(),
        }
    }
}
