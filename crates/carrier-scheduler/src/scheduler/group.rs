//! Thread groups: carrier queues, task selection and stealing

use crate::actor::{ActorPriority, ThreadGroupKind};
use crate::config::PriorityQuotas;
use crate::scheduler::queue::{ClaimedTask, LocalQueue, QueuedTask, WorkQueue};
use crate::scheduler::task::ScheduledTask;
use once_cell::sync::OnceCell;
use rand::Rng;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Thread;

thread_local! {
    /// (group address, carrier index) of the carrier running on this thread
    static CURRENT_CARRIER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// How a group picks the next priority class
#[derive(Debug, Clone, Copy)]
pub(crate) enum SelectionPolicy {
    /// One class, FIFO per carrier
    Simple,
    /// Weighted selection between the three classes
    Quotas(PriorityQuotas),
}

/// Smooth weighted round-robin over the priority classes
///
/// Over any window of `total` picks each class is preferred exactly
/// `weight` times, interleaved rather than in bursts.
#[derive(Debug, Clone)]
pub(crate) struct PrioritySelector {
    weights: [i64; 3],
    current: [i64; 3],
    total: i64,
}

impl PrioritySelector {
    pub(crate) fn new(quotas: &PriorityQuotas) -> Self {
        let weights = ActorPriority::ALL.map(|p| i64::from(quotas.weight(p)));
        Self {
            weights,
            current: [0; 3],
            total: weights.iter().sum(),
        }
    }

    /// Class that should be served next
    pub(crate) fn next_class(&mut self) -> ActorPriority {
        let mut best = ActorPriority::Regular.index();
        let mut best_value = i64::MIN;
        for (i, weight) in self.weights.iter().enumerate() {
            if *weight == 0 {
                continue;
            }
            self.current[i] += weight;
            if self.current[i] > best_value {
                best_value = self.current[i];
                best = i;
            }
        }
        self.current[best] -= self.total;
        ActorPriority::ALL[best]
    }

    /// Preferred class first, the others as fallback in priority order
    pub(crate) fn order(&mut self) -> [ActorPriority; 3] {
        let preferred = self.next_class();
        let mut order = [preferred; 3];
        let mut next = 1;
        for class in ActorPriority::ALL {
            if class != preferred {
                order[next] = class;
                next += 1;
            }
        }
        order
    }
}

/// Owner ends of one carrier's queues, one per priority class
pub(crate) struct CarrierQueues {
    local: [LocalQueue; 3],
}

impl CarrierQueues {
    pub(crate) fn is_empty(&self) -> bool {
        self.local.iter().all(LocalQueue::is_empty)
    }
}

/// A set of carriers sharing work
pub(crate) struct ThreadGroup {
    name: String,
    kind: ThreadGroupKind,
    policy: SelectionPolicy,
    /// Shared queue ends, indexed by carrier then priority class
    queues: Vec<[WorkQueue; 3]>,
    next_carrier: AtomicUsize,
    threads: OnceCell<Vec<Thread>>,
    steals: AtomicU64,
}

impl ThreadGroup {
    /// Create a group of `carriers` queues; the owner halves are returned
    /// for the carriers to take
    pub(crate) fn new(
        name: impl Into<String>,
        kind: ThreadGroupKind,
        carriers: usize,
        policy: SelectionPolicy,
    ) -> (Arc<Self>, Vec<CarrierQueues>) {
        let mut owned = Vec::with_capacity(carriers);
        let mut queues = Vec::with_capacity(carriers);
        for _ in 0..carriers.max(1) {
            let local = [LocalQueue::new(), LocalQueue::new(), LocalQueue::new()];
            queues.push([
                WorkQueue::new(&local[0]),
                WorkQueue::new(&local[1]),
                WorkQueue::new(&local[2]),
            ]);
            owned.push(CarrierQueues { local });
        }

        let group = Arc::new(Self {
            name: name.into(),
            kind,
            policy,
            queues,
            next_carrier: AtomicUsize::new(0),
            threads: OnceCell::new(),
            steals: AtomicU64::new(0),
        });
        (group, owned)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn steals(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }

    /// Selector state for one carrier of this group
    pub(crate) fn selector(&self) -> PrioritySelector {
        match self.policy {
            SelectionPolicy::Quotas(quotas) => PrioritySelector::new(&quotas),
            SelectionPolicy::Simple => PrioritySelector::new(&PriorityQuotas::default()),
        }
    }

    fn slot(&self, priority: ActorPriority) -> usize {
        match self.policy {
            SelectionPolicy::Simple => ActorPriority::Regular.index(),
            SelectionPolicy::Quotas(_) => priority.index(),
        }
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Index of the carrier of this group running on the calling thread
    fn current_carrier(&self) -> Option<usize> {
        match CURRENT_CARRIER.with(Cell::get) {
            Some((group, index)) if group == self.address() => Some(index),
            _ => None,
        }
    }

    /// Mark the calling thread as carrier `index` of this group until the
    /// guard drops
    pub(crate) fn enter(&self, index: usize) -> CarrierGuard {
        let previous = CURRENT_CARRIER.with(|c| c.replace(Some((self.address(), index))));
        CarrierGuard { previous }
    }

    /// Queue a task, preferring the carrier of the calling thread
    pub(crate) fn submit(&self, task: Arc<dyn ScheduledTask>) {
        let target = self
            .current_carrier()
            .unwrap_or_else(|| {
                self.next_carrier.fetch_add(1, Ordering::Relaxed) % self.queues.len()
            });
        let slot = self.slot(task.core().priority());
        task.core().mark_queued();
        self.queues[target][slot].push(QueuedTask::new(task));
        self.unpark(target);
    }

    /// Find and claim the next task for carrier `index`
    pub(crate) fn next_task(
        &self,
        index: usize,
        local: &CarrierQueues,
        selector: &mut PrioritySelector,
    ) -> Option<ClaimedTask> {
        let order = match self.policy {
            SelectionPolicy::Quotas(_) => selector.order(),
            SelectionPolicy::Simple => [ActorPriority::Regular; 3],
        };
        let classes = match self.policy {
            SelectionPolicy::Quotas(_) => &order[..],
            SelectionPolicy::Simple => &order[..1],
        };

        for class in classes {
            let slot = class.index();
            if let Some(claimed) = local.local[slot].pop() {
                return Some(claimed);
            }
            if let Some(claimed) = local.local[slot].refill(self.queues[index][slot].inbox()) {
                return Some(claimed);
            }
        }
        for class in classes {
            if let Some(claimed) = self.steal(index, class.index()) {
                return Some(claimed);
            }
        }
        None
    }

    /// Steal from the other carriers, starting at a random victim
    fn steal(&self, thief: usize, slot: usize) -> Option<ClaimedTask> {
        let carriers = self.queues.len();
        if carriers < 2 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..carriers);
        for i in 0..carriers {
            let victim = (start + i) % carriers;
            if victim == thief {
                continue;
            }
            if let Some(claimed) = self.queues[victim][slot].steal() {
                self.steals.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    group = %self.name,
                    carrier = thief,
                    victim,
                    actor_id = %claimed.task().core().id(),
                    "stole task"
                );
                return Some(claimed);
            }
        }
        None
    }

    /// Publish carrier thread handles once they are spawned
    pub(crate) fn publish_threads(&self, threads: Vec<Thread>) {
        if self.threads.set(threads).is_err() {
            tracing::warn!(group = %self.name, "carrier threads already published");
        }
    }

    fn unpark(&self, index: usize) {
        if let Some(thread) = self.threads.get().and_then(|threads| threads.get(index)) {
            thread.unpark();
        }
    }

    pub(crate) fn unpark_all(&self) {
        if let Some(threads) = self.threads.get() {
            for thread in threads {
                thread.unpark();
            }
        }
    }

    /// Drop every queued entry
    pub(crate) fn clear(&self) {
        for classes in &self.queues {
            for queue in classes {
                queue.clear();
            }
        }
    }
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("carriers", &self.queues.len())
            .finish()
    }
}

/// Restores the previous carrier marker of the thread on drop
pub(crate) struct CarrierGuard {
    previous: Option<(usize, usize)>,
}

impl Drop for CarrierGuard {
    fn drop(&mut self) {
        CURRENT_CARRIER.with(|c| c.set(self.previous));
    }
}
