//! Per-carrier work queues and the claim protocol
//!
//! A queue holds [`QueuedTask`] entries: a task reference tagged with the
//! task's epoch (`state_count`) at the time it was enqueued. Taking an
//! entry out of a queue does not grant the right to run the task; only a
//! successful compare-and-swap of the epoch does, and that produces a
//! [`ClaimedTask`]. Entries whose epoch moved on are stale and skipped.
//!
//! Each carrier owns a LIFO [`LocalQueue`] it pops from the back, while
//! thieves take from the front through the shared [`WorkQueue`]. Other
//! threads never push into the local deque directly; they go through the
//! carrier's injector inbox, which the owner drains in batches.

use crate::scheduler::carrier::CarrierContext;
use crate::scheduler::task::{ScheduledTask, TurnOutcome};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use std::sync::Arc;

/// Task reference tagged with the epoch it was enqueued at
pub(crate) struct QueuedTask {
    task: Arc<dyn ScheduledTask>,
    state_count: u64,
}

impl QueuedTask {
    pub(crate) fn new(task: Arc<dyn ScheduledTask>) -> Self {
        let state_count = task.core().state_count();
        Self { task, state_count }
    }

    /// Try to take exclusive ownership of the task for one turn
    pub(crate) fn claim(self) -> Option<ClaimedTask> {
        if self.task.core().try_claim(self.state_count) {
            Some(ClaimedTask { task: self.task })
        } else {
            tracing::trace!(
                actor_id = %self.task.core().id(),
                "skipping stale queue entry"
            );
            None
        }
    }
}

/// A task the current thread has exclusively claimed
///
/// Only [`QueuedTask::claim`] creates one; holding it is the permission to
/// touch the task's jobs.
pub(crate) struct ClaimedTask {
    task: Arc<dyn ScheduledTask>,
}

impl ClaimedTask {
    pub(crate) fn task(&self) -> &Arc<dyn ScheduledTask> {
        &self.task
    }

    /// Run one turn; the claim ends with the returned outcome
    pub(crate) fn run(self, carrier: &mut CarrierContext) -> (Arc<dyn ScheduledTask>, TurnOutcome) {
        let outcome = Arc::clone(&self.task).run_turn(carrier);
        (self.task, outcome)
    }
}

/// Owner-only end of a carrier queue
pub(crate) struct LocalQueue {
    worker: Worker<QueuedTask>,
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        Self {
            worker: Worker::new_lifo(),
        }
    }

    /// Shared end for the group
    pub(crate) fn stealer(&self) -> Stealer<QueuedTask> {
        self.worker.stealer()
    }

    /// Pop until a claim succeeds or the queue is empty
    pub(crate) fn pop(&self) -> Option<ClaimedTask> {
        while let Some(entry) = self.worker.pop() {
            if let Some(claimed) = entry.claim() {
                return Some(claimed);
            }
        }
        None
    }

    /// Move a batch from the inbox and claim one entry of it
    pub(crate) fn refill(&self, inbox: &Injector<QueuedTask>) -> Option<ClaimedTask> {
        loop {
            match inbox.steal_batch_and_pop(&self.worker) {
                Steal::Success(entry) => {
                    if let Some(claimed) = entry.claim() {
                        return Some(claimed);
                    }
                    if let Some(claimed) = self.pop() {
                        return Some(claimed);
                    }
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }
}

/// Shared end of a carrier queue: the inbox plus the stealer handle
pub(crate) struct WorkQueue {
    inbox: Injector<QueuedTask>,
    stealer: Stealer<QueuedTask>,
}

impl WorkQueue {
    pub(crate) fn new(local: &LocalQueue) -> Self {
        Self {
            inbox: Injector::new(),
            stealer: local.stealer(),
        }
    }

    /// Append a task; any thread may call this
    pub(crate) fn push(&self, entry: QueuedTask) {
        self.inbox.push(entry);
    }

    pub(crate) fn inbox(&self) -> &Injector<QueuedTask> {
        &self.inbox
    }

    /// Take a task from the opposite end of the owner's deque, then from
    /// its inbox, claiming candidates until one succeeds
    pub(crate) fn steal(&self) -> Option<ClaimedTask> {
        loop {
            match self.stealer.steal() {
                Steal::Success(entry) => {
                    if let Some(claimed) = entry.claim() {
                        return Some(claimed);
                    }
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        loop {
            match self.inbox.steal() {
                Steal::Success(entry) => {
                    if let Some(claimed) = entry.claim() {
                        return Some(claimed);
                    }
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Drop every queued entry
    pub(crate) fn clear(&self) {
        loop {
            match self.inbox.steal() {
                Steal::Success(_) | Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        loop {
            match self.stealer.steal() {
                Steal::Success(_) | Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }
}
