//! Hashed timer wheel
//!
//! Each carrier thread owns one wheel and advances it with the logical
//! clock at the top of every loop iteration. Expiring a timer never runs
//! actor code: the target only records the firing and wakes its task, so
//! user callbacks still run as ordinary jobs of the owning actor.

use crossbeam::queue::SegQueue;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

/// Identifier of a timer within one wheel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

/// Something that can be scheduled on a wheel
pub(crate) trait TimerTarget: Send + Sync {
    /// Called by the wheel owner once the deadline passed
    fn expire(&self, now: Duration);

    /// Cancelled targets are dropped without firing
    fn is_cancelled(&self) -> bool;
}

/// Cross-thread handle to request removal of a timer from its wheel
#[derive(Clone)]
pub(crate) struct TimerCanceller {
    pending: Arc<SegQueue<TimerId>>,
}

impl TimerCanceller {
    /// Queue a cancellation; applied by the owning thread on its next advance
    pub(crate) fn cancel(&self, id: TimerId) {
        self.pending.push(id);
    }

    /// Whether both handles address the same wheel
    pub(crate) fn same_wheel(&self, other: &TimerCanceller) -> bool {
        Arc::ptr_eq(&self.pending, &other.pending)
    }
}

struct TimerEntry {
    id: TimerId,
    deadline_nanos: u64,
    target: Arc<dyn TimerTarget>,
}

/// Deadline queue hashed by tick into a fixed ring of slots
pub(crate) struct TimerWheel {
    slots: Vec<Vec<TimerEntry>>,
    mask: u64,
    tick_nanos: u64,
    current_tick: u64,
    /// Timer id to slot index
    index: FxHashMap<TimerId, usize>,
    next_id: u64,
    remote_cancels: Arc<SegQueue<TimerId>>,
}

impl TimerWheel {
    /// Create a wheel with `slots` buckets (rounded up to a power of two)
    pub(crate) fn new(slots: usize, tick: Duration) -> Self {
        let slots = slots.max(1).next_power_of_two();
        Self {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            mask: (slots - 1) as u64,
            tick_nanos: (tick.as_nanos() as u64).max(1),
            current_tick: 0,
            index: FxHashMap::default(),
            next_id: 1,
            remote_cancels: Arc::new(SegQueue::new()),
        }
    }

    /// Handle other threads use to cancel timers on this wheel
    pub(crate) fn canceller(&self) -> TimerCanceller {
        TimerCanceller {
            pending: Arc::clone(&self.remote_cancels),
        }
    }

    /// Schedule `target` to expire `delay` after `now`
    #[cfg(test)]
    pub(crate) fn schedule(
        &mut self,
        target: Arc<dyn TimerTarget>,
        delay: Duration,
        now: Duration,
    ) -> TimerId {
        self.schedule_at(target, now + delay)
    }

    /// Schedule `target` to expire at an absolute deadline
    pub(crate) fn schedule_at(
        &mut self,
        target: Arc<dyn TimerTarget>,
        deadline: Duration,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let deadline_nanos = deadline.as_nanos() as u64;
        // Past deadlines land in the current slot and fire on the next advance
        let tick = (deadline_nanos / self.tick_nanos).max(self.current_tick);
        let slot = (tick & self.mask) as usize;

        self.slots[slot].push(TimerEntry {
            id,
            deadline_nanos,
            target,
        });
        self.index.insert(id, slot);
        id
    }

    /// Remove a pending timer. Returns false if it already fired or was removed.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        let entries = &mut self.slots[slot];
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            entries.swap_remove(pos);
        }
        true
    }

    /// Fire every timer whose deadline is at or before `now`
    ///
    /// Repeats until a pass finds nothing due, so bursts scheduled while
    /// expiring are handled in the same call. Returns the number fired.
    pub(crate) fn process_expired(&mut self, now: Duration) -> usize {
        while let Some(id) = self.remote_cancels.pop() {
            self.cancel(id);
        }

        let now_nanos = now.as_nanos() as u64;
        let now_tick = now_nanos / self.tick_nanos;
        let mut fired = 0;

        loop {
            let mut due = Vec::new();
            let span =
                (now_tick.saturating_sub(self.current_tick) + 1).min(self.slots.len() as u64);

            for offset in 0..span {
                let slot = ((self.current_tick + offset) & self.mask) as usize;
                let entries = &mut self.slots[slot];
                let mut i = 0;
                while i < entries.len() {
                    if entries[i].deadline_nanos <= now_nanos {
                        due.push(entries.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            // The slot of `now_tick` may still hold timers due later in the same tick
            self.current_tick = self.current_tick.max(now_tick);

            if due.is_empty() {
                break;
            }
            for entry in due {
                self.index.remove(&entry.id);
                if !entry.target.is_cancelled() {
                    entry.target.expire(now);
                    fired += 1;
                }
            }
        }
        fired
    }

    /// Number of pending timers
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
