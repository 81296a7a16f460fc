//! Carrier threads
//!
//! [`Carrier::work_once`] is the single step both the OS thread loop and
//! the deterministic scheduler drive: advance the timer wheel to the
//! clock, then claim and run at most one task turn.

use crate::clock::ActorClock;
use crate::scheduler::group::{CarrierQueues, PrioritySelector, ThreadGroup};
use crate::scheduler::idle::IdleStrategy;
use crate::scheduler::queue::ClaimedTask;
use crate::scheduler::scheduler::SchedulerShared;
use crate::scheduler::subscription::TimerState;
use crate::scheduler::task::{finish_turn, TurnOutcome};
use crate::scheduler::timer::{TimerCanceller, TimerId, TimerWheel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-carrier state a running job can reach through its control handle
pub(crate) struct CarrierContext {
    index: usize,
    timers: TimerWheel,
    clock: Arc<dyn ActorClock>,
}

impl CarrierContext {
    pub(crate) fn new(index: usize, timers: TimerWheel, clock: Arc<dyn ActorClock>) -> Self {
        Self { index, timers, clock }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Put `timer` on this carrier's wheel
    pub(crate) fn arm_timer(&mut self, timer: &Arc<TimerState>, deadline: Duration) {
        let target: Arc<TimerState> = Arc::clone(timer);
        let id = self.timers.schedule_at(target, deadline);
        timer.register(id, self.timers.canceller());
    }

    pub(crate) fn timers_canceller(&self) -> TimerCanceller {
        self.timers.canceller()
    }

    pub(crate) fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    pub(crate) fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

/// One carrier of a thread group
pub(crate) struct Carrier {
    context: CarrierContext,
    group: Arc<ThreadGroup>,
    queues: CarrierQueues,
    selector: PrioritySelector,
    shared: Arc<SchedulerShared>,
}

impl Carrier {
    pub(crate) fn new(
        index: usize,
        group: Arc<ThreadGroup>,
        queues: CarrierQueues,
        timers: TimerWheel,
        clock: Arc<dyn ActorClock>,
        shared: Arc<SchedulerShared>,
    ) -> Self {
        let selector = group.selector();
        Self {
            context: CarrierContext::new(index, timers, clock),
            group,
            queues,
            selector,
            shared,
        }
    }

    pub(crate) fn context(&self) -> &CarrierContext {
        &self.context
    }

    /// Fire expired timers, then run at most one task turn
    ///
    /// Returns whether anything happened.
    pub(crate) fn work_once(&mut self) -> bool {
        let now = self.context.now();
        let fired = self.context.timers.process_expired(now);

        match self
            .group
            .next_task(self.context.index, &self.queues, &mut self.selector)
        {
            Some(claimed) => {
                self.run(claimed);
                true
            }
            None => fired > 0,
        }
    }

    fn run(&mut self, claimed: ClaimedTask) {
        let (task, outcome) = claimed.run(&mut self.context);
        self.shared.record_turn();
        if outcome == TurnOutcome::Terminated {
            self.shared.record_terminated(task.core().id());
        }
        finish_turn(task, outcome);
    }

    /// Loop until `shutdown` is raised and no work is left for this carrier
    pub(crate) fn run_loop(mut self, shutdown: Arc<AtomicBool>, mut idle: Box<dyn IdleStrategy>) {
        let _guard = self.group.enter(self.context.index);
        tracing::debug!(
            group = %self.group.name(),
            carrier = self.context.index,
            "carrier started"
        );

        loop {
            if self.work_once() {
                idle.on_task_executed();
                continue;
            }
            if shutdown.load(Ordering::Acquire) && self.queues.is_empty() {
                break;
            }
            idle.on_idle();
        }

        tracing::debug!(
            group = %self.group.name(),
            carrier = self.context.index,
            pending_timers = self.context.pending_timers(),
            "carrier stopped"
        );
    }
}
