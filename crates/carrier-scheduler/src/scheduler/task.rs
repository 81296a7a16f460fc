//! Per-actor scheduling record and the turn loop
//!
//! A task has two halves:
//!
//! - [`TaskCore`]: atomics any thread may touch. The scheduling state,
//!   the claim epoch (`state_count`), the wake flag, the close request and
//!   the sealed flag of the submitted queue.
//! - `TaskInner`: the actor value and everything only the claimant may
//!   touch (phase, current job, fast lane, subscriptions). It sits behind
//!   a mutex that is only ever `try_lock`ed by the thread holding the
//!   claim, so the lock is never contended.
//!
//! # Waiting without lost wakeups
//!
//! A turn that runs out of work returns [`TurnOutcome::Wait`]. The carrier
//! then stores `Waiting` and re-checks for work. A waker first raises
//! `wake_pending` and then tries `Waiting -> WakingUp`. Both sides use
//! sequentially consistent operations, so at least one of them observes
//! the other and exactly one CAS from `Waiting` wins the resubmission.

use crate::actor::{Actor, ActorId, ActorPhase, ActorPriority, SchedulingHints};
use crate::control::ActorControl;
use crate::error::ActorError;
use crate::future::ActorFuture;
use crate::scheduler::carrier::CarrierContext;
use crate::scheduler::group::ThreadGroup;
use crate::scheduler::job::{Job, LifecycleHook};
use crate::scheduler::subscription::{Subscription, SubscriptionId};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Presence of a task on the carrier queues
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SchedulingState {
    NotScheduled = 0,
    Active = 1,
    Queued = 2,
    Waiting = 3,
    WakingUp = 4,
    Terminated = 5,
}

impl SchedulingState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulingState::NotScheduled,
            1 => SchedulingState::Active,
            2 => SchedulingState::Queued,
            3 => SchedulingState::Waiting,
            4 => SchedulingState::WakingUp,
            _ => SchedulingState::Terminated,
        }
    }
}

/// How a turn ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    /// More work is ready; resubmit
    Yield,
    /// Nothing runnable; park until woken
    Wait,
    /// Closed or failed; never runs again
    Terminated,
}

/// Thread-safe half of a task
pub(crate) struct TaskCore {
    id: ActorId,
    name: String,
    hints: SchedulingHints,
    group: Arc<ThreadGroup>,
    state: AtomicU8,
    state_count: AtomicU64,
    /// Mirror of the owner's phase for outside observers
    phase: AtomicU8,
    wake_pending: AtomicBool,
    close_requested: AtomicBool,
    /// A blocking subscription keeps the task in `Started` despite a close
    close_held: AtomicBool,
    /// Cleared once the submitted queue is sealed
    accepting: AtomicBool,
    self_ref: Weak<dyn ScheduledTask>,
    started: ActorFuture<()>,
    closed: ActorFuture<()>,
}

impl TaskCore {
    pub(crate) fn id(&self) -> ActorId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn priority(&self) -> ActorPriority {
        self.hints.priority
    }

    pub(crate) fn phase(&self) -> ActorPhase {
        ActorPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn state(&self) -> SchedulingState {
        SchedulingState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SchedulingState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn state_count(&self) -> u64 {
        self.state_count.load(Ordering::SeqCst)
    }

    /// Take the task for one turn if nobody advanced the epoch since `epoch`
    pub(crate) fn try_claim(&self, epoch: u64) -> bool {
        if self.state() == SchedulingState::Terminated {
            return false;
        }
        if self
            .state_count
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.set_state(SchedulingState::Active);
        true
    }

    pub(crate) fn mark_queued(&self) {
        self.set_state(SchedulingState::Queued);
    }

    fn try_wake_up(&self) -> bool {
        self.state
            .compare_exchange(
                SchedulingState::Waiting as u8,
                SchedulingState::WakingUp as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn waker(&self) -> ActorWaker {
        ActorWaker {
            task: Some(self.self_ref.clone()),
        }
    }

    /// Wake the task after new work was made visible
    pub(crate) fn wake(&self) {
        if let Some(task) = self.self_ref.upgrade() {
            wake(&task);
        }
    }

    fn has_pending_close(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst) && !self.close_held.load(Ordering::SeqCst)
    }

    pub(crate) fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Ask the task to close once it reached `Started`
    pub(crate) fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        let _ = self.phase.compare_exchange(
            ActorPhase::Started as u8,
            ActorPhase::CloseRequested as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.wake();
    }

    pub(crate) fn started_future(&self) -> ActorFuture<()> {
        self.started.clone()
    }

    pub(crate) fn closed_future(&self) -> ActorFuture<()> {
        self.closed.clone()
    }
}

/// Type-erased task as seen by queues and carriers
pub(crate) trait ScheduledTask: Send + Sync {
    fn core(&self) -> &TaskCore;

    /// Run jobs until the task yields, waits or terminates
    ///
    /// Only called by the holder of a claim.
    fn run_turn(self: Arc<Self>, carrier: &mut CarrierContext) -> TurnOutcome;

    /// Whether the submitted queue is non-empty
    fn has_submissions(&self) -> bool;

    /// Tear the task down without running further hooks; used when the
    /// scheduler stops with the task still alive
    fn abort(&self);
}

/// Raise the wake flag and resubmit the task if it is parked
pub(crate) fn wake(task: &Arc<dyn ScheduledTask>) {
    let core = task.core();
    core.wake_pending.store(true, Ordering::SeqCst);
    if core.try_wake_up() {
        tracing::trace!(actor = %core.name, actor_id = %core.id, "waking task");
        core.group.submit(Arc::clone(task));
    }
}

/// Apply the outcome of a turn to the scheduling state
pub(crate) fn finish_turn(task: Arc<dyn ScheduledTask>, outcome: TurnOutcome) {
    let core = task.core();
    match outcome {
        TurnOutcome::Yield => {
            let group = Arc::clone(&core.group);
            group.submit(task);
        }
        TurnOutcome::Wait => {
            core.set_state(SchedulingState::Waiting);
            let pending = core.wake_pending.load(Ordering::SeqCst)
                || (core.phase() == ActorPhase::Started
                    && (task.has_submissions() || core.has_pending_close()));
            if pending && core.try_wake_up() {
                let group = Arc::clone(&core.group);
                group.submit(task);
            }
        }
        TurnOutcome::Terminated => core.set_state(SchedulingState::Terminated),
    }
}

/// Handle that wakes one task; cheap to clone and safe to keep after the
/// task terminated
#[derive(Clone)]
pub struct ActorWaker {
    task: Option<Weak<dyn ScheduledTask>>,
}

impl ActorWaker {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { task: None }
    }

    /// Schedule the task if it is waiting
    pub fn wake(&self) {
        if let Some(task) = self.task.as_ref().and_then(Weak::upgrade) {
            wake(&task);
        }
    }

    /// Whether both wakers address the same task
    pub fn will_wake(&self, other: &ActorWaker) -> bool {
        match (&self.task, &other.task) {
            (Some(a), Some(b)) => Weak::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for ActorWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self
            .task
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|task| task.core().id());
        f.debug_struct("ActorWaker").field("actor_id", &id).finish()
    }
}

/// Owner-only state, reachable through [`ActorControl`]
pub(crate) struct TaskLocal<A: Actor> {
    pub(crate) phase: ActorPhase,
    pub(crate) fast_lane: VecDeque<Job<A>>,
    pub(crate) subscriptions: Vec<Subscription<A>>,
    next_subscription: SubscriptionId,
    /// Set by `done()` inside an until-done job
    pub(crate) job_done: bool,
    pub(crate) yield_requested: bool,
    pub(crate) failure: Option<ActorError>,
}

impl<A: Actor> TaskLocal<A> {
    fn new() -> Self {
        Self {
            phase: ActorPhase::Starting,
            fast_lane: VecDeque::new(),
            subscriptions: Vec::new(),
            next_subscription: 1,
            job_done: false,
            yield_requested: false,
            failure: None,
        }
    }

    pub(crate) fn next_subscription_id(&mut self) -> SubscriptionId {
        let id = self.next_subscription;
        self.next_subscription += 1;
        id
    }

    /// Whether a subscription holds back the transition out of `phase`
    fn blocks(&self, phase: ActorPhase) -> bool {
        self.subscriptions.iter().any(|s| s.blocks(phase))
    }

    /// Put a discarded subscription job's callback back
    fn restore_subscription(&mut self, job: Job<A>) {
        if let Some((id, callback)) = job.into_subscription_callback() {
            if let Some(sub) = self.subscriptions.iter_mut().find(|s| s.id() == id) {
                sub.restore(callback);
            }
        }
    }
}

struct TaskInner<A: Actor> {
    actor: A,
    current: Option<Job<A>>,
    local: TaskLocal<A>,
}

enum PhaseStep {
    Advanced,
    Blocked,
    Finished,
}

/// Scheduling record of one actor
pub(crate) struct Task<A: Actor> {
    core: TaskCore,
    submitted: SegQueue<Job<A>>,
    inner: Mutex<TaskInner<A>>,
}

impl<A: Actor> Task<A> {
    /// Create the task with its starting hook queued; not yet scheduled
    pub(crate) fn new(
        actor: A,
        id: ActorId,
        hints: SchedulingHints,
        group: Arc<ThreadGroup>,
    ) -> Arc<Self> {
        let name = actor.name();
        let mut local = TaskLocal::new();
        local.fast_lane.push_back(Job::lifecycle(LifecycleHook::Starting));

        Arc::new_cyclic(|weak: &Weak<Task<A>>| {
            let self_ref: Weak<dyn ScheduledTask> = weak.clone();
            Task {
                core: TaskCore {
                    id,
                    name,
                    hints,
                    group,
                    state: AtomicU8::new(SchedulingState::NotScheduled as u8),
                    state_count: AtomicU64::new(0),
                    phase: AtomicU8::new(ActorPhase::Starting as u8),
                    wake_pending: AtomicBool::new(false),
                    close_requested: AtomicBool::new(false),
                    close_held: AtomicBool::new(false),
                    accepting: AtomicBool::new(true),
                    self_ref,
                    started: ActorFuture::new(),
                    closed: ActorFuture::new(),
                },
                submitted: SegQueue::new(),
                inner: Mutex::new(TaskInner {
                    actor,
                    current: None,
                    local,
                }),
            }
        })
    }

    pub(crate) fn core(&self) -> &TaskCore {
        &self.core
    }

    /// Offer an external job; fails it with `Closed` once the queue is sealed
    pub(crate) fn submit(&self, job: Job<A>) {
        if !self.core.is_accepting() {
            job.fail(&ActorError::Closed);
            return;
        }
        self.submitted.push(job);
        if !self.core.is_accepting() {
            // Raced with sealing; whoever pops first fails the job
            self.drain_submitted(&ActorError::Closed);
            return;
        }
        self.core.wake();
    }

    fn drain_submitted(&self, error: &ActorError) {
        while let Some(job) = self.submitted.pop() {
            job.fail(error);
        }
    }

    fn seal(&self, error: &ActorError) {
        self.core.accepting.store(false, Ordering::SeqCst);
        self.drain_submitted(error);
    }

    fn set_phase(&self, local: &mut TaskLocal<A>, phase: ActorPhase) {
        debug_assert!(
            phase > local.phase || phase == ActorPhase::Failed,
            "phase must move forward: {:?} -> {:?}",
            local.phase,
            phase
        );
        tracing::debug!(
            actor = %self.core.name,
            actor_id = %self.core.id,
            from = ?local.phase,
            to = ?phase,
            "phase transition"
        );
        local.phase = phase;
        self.core.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn drive(
        self: &Arc<Self>,
        inner: &mut TaskInner<A>,
        carrier: &mut CarrierContext,
    ) -> TurnOutcome {
        loop {
            if inner.local.phase == ActorPhase::Started
                && self.core.close_requested.load(Ordering::SeqCst)
            {
                let held = inner.local.blocks(ActorPhase::Started);
                self.core.close_held.store(held, Ordering::SeqCst);
                if !held {
                    self.set_phase(&mut inner.local, ActorPhase::CloseRequested);
                }
            }
            if inner.local.phase == ActorPhase::CloseRequested {
                self.begin_close(&mut inner.local);
            }

            if inner.current.is_none() {
                inner.current = self.next_job(&mut inner.local, carrier);
            }
            let Some(mut job) = inner.current.take() else {
                match self.advance_phase(inner, carrier) {
                    PhaseStep::Advanced => continue,
                    PhaseStep::Blocked => return TurnOutcome::Wait,
                    PhaseStep::Finished => return TurnOutcome::Terminated,
                }
            };

            match self.execute(&mut job, inner, carrier) {
                Ok(true) => self.complete_job(job, &mut inner.local, carrier),
                Ok(false) => inner.current = Some(job),
                Err(error) => {
                    if let Some(fatal) = self.job_failed(job, error, inner, carrier) {
                        return self.fail(inner, fatal, carrier);
                    }
                }
            }

            if let Some(error) = inner.local.failure.take() {
                return self.fail(inner, error, carrier);
            }
            // An until-done job that did not finish gives other tasks a turn
            if inner.current.is_some() || std::mem::take(&mut inner.local.yield_requested) {
                return TurnOutcome::Yield;
            }
        }
    }

    /// Fast lane first, then fired subscriptions, then submitted jobs
    fn next_job(&self, local: &mut TaskLocal<A>, carrier: &mut CarrierContext) -> Option<Job<A>> {
        if let Some(job) = self.pop_fast_lane(local, carrier) {
            return Some(job);
        }
        self.poll_subscriptions(local, carrier);
        if let Some(job) = self.pop_fast_lane(local, carrier) {
            return Some(job);
        }
        if local.phase == ActorPhase::Started {
            return self.submitted.pop();
        }
        None
    }

    /// Skips jobs of subscriptions cancelled after they fired
    fn pop_fast_lane(
        &self,
        local: &mut TaskLocal<A>,
        carrier: &mut CarrierContext,
    ) -> Option<Job<A>> {
        while let Some(job) = local.fast_lane.pop_front() {
            let cancelled = job.subscription_id().and_then(|id| {
                local
                    .subscriptions
                    .iter()
                    .position(|s| s.id() == id && s.is_cancelled())
            });
            match cancelled {
                Some(pos) => local.subscriptions.remove(pos).cancel(Some(&mut *carrier)),
                None => return Some(job),
            }
        }
        None
    }

    fn poll_subscriptions(&self, local: &mut TaskLocal<A>, carrier: &mut CarrierContext) {
        let phase = local.phase;
        let mut i = 0;
        while i < local.subscriptions.len() {
            let sub = &mut local.subscriptions[i];
            if sub.is_cancelled() {
                local.subscriptions.remove(i).cancel(Some(&mut *carrier));
                continue;
            }
            if !sub.is_job_pending() && sub.triggers_in_phase(phase) && sub.poll() {
                if let Some(job) = sub.take_job() {
                    local.fast_lane.push_back(job);
                }
            }
            i += 1;
        }
    }

    fn execute(
        self: &Arc<Self>,
        job: &mut Job<A>,
        inner: &mut TaskInner<A>,
        carrier: &mut CarrierContext,
    ) -> Result<bool, ActorError> {
        let TaskInner { actor, local, .. } = inner;
        local.job_done = false;

        let mut ctl = ActorControl::new(self, local, carrier);
        let outcome = catch_unwind(AssertUnwindSafe(|| job.run(actor, &mut ctl)));
        drop(ctl);

        match outcome {
            Ok(()) => Ok(job.is_auto_completing() || local.job_done),
            Err(payload) => Err(ActorError::from_panic(payload)),
        }
    }

    /// Remove a one-shot subscription, re-arm a recurring one
    fn complete_job(&self, job: Job<A>, local: &mut TaskLocal<A>, carrier: &mut CarrierContext) {
        let Some((id, callback)) = job.into_subscription_callback() else {
            return;
        };
        let Some(pos) = local.subscriptions.iter().position(|s| s.id() == id) else {
            return;
        };
        let sub = &mut local.subscriptions[pos];
        if sub.is_recurring() && !sub.is_cancelled() {
            sub.on_job_completed(callback, carrier);
        } else {
            local.subscriptions.remove(pos).cancel(Some(carrier));
        }
    }

    /// Returns the error to fail the task with, if the failure is fatal
    fn job_failed(
        &self,
        job: Job<A>,
        error: ActorError,
        inner: &mut TaskInner<A>,
        carrier: &mut CarrierContext,
    ) -> Option<ActorError> {
        job.fail(&error);
        self.complete_job(job, &mut inner.local, carrier);

        if inner.local.phase != ActorPhase::Started {
            return Some(error);
        }
        tracing::warn!(
            actor = %self.core.name,
            actor_id = %self.core.id,
            %error,
            "job failed"
        );
        let actor = &mut inner.actor;
        match catch_unwind(AssertUnwindSafe(|| actor.handle_failure(&error))) {
            Ok(()) => None,
            Err(payload) => Some(ActorError::from_panic(payload)),
        }
    }

    fn begin_close(&self, local: &mut TaskLocal<A>) {
        let discarded: Vec<_> = local.fast_lane.drain(..).collect();
        for job in discarded {
            job.fail(&ActorError::Closed);
            local.restore_subscription(job);
        }
        self.set_phase(local, ActorPhase::Closing);
        local
            .fast_lane
            .push_back(Job::lifecycle(LifecycleHook::CloseRequested));
        local.fast_lane.push_back(Job::lifecycle(LifecycleHook::Closing));
    }

    fn advance_phase(&self, inner: &mut TaskInner<A>, carrier: &mut CarrierContext) -> PhaseStep {
        let phase = inner.local.phase;
        if inner.local.blocks(phase) {
            return PhaseStep::Blocked;
        }
        match phase {
            ActorPhase::Starting => {
                self.set_phase(&mut inner.local, ActorPhase::Started);
                self.core.started.complete(());
                inner
                    .local
                    .fast_lane
                    .push_back(Job::lifecycle(LifecycleHook::Started));
                PhaseStep::Advanced
            }
            ActorPhase::Started => PhaseStep::Blocked,
            ActorPhase::CloseRequested => {
                self.begin_close(&mut inner.local);
                PhaseStep::Advanced
            }
            ActorPhase::Closing => {
                self.set_phase(&mut inner.local, ActorPhase::Closed);
                inner
                    .local
                    .fast_lane
                    .push_back(Job::lifecycle(LifecycleHook::Closed));
                PhaseStep::Advanced
            }
            ActorPhase::Closed => {
                self.teardown(inner, &ActorError::Closed, Some(carrier));
                self.core.closed.complete(());
                PhaseStep::Finished
            }
            ActorPhase::Failed => PhaseStep::Finished,
        }
    }

    /// Cancel subscriptions, fail every queued job and seal the queue
    fn teardown(
        &self,
        inner: &mut TaskInner<A>,
        error: &ActorError,
        mut carrier: Option<&mut CarrierContext>,
    ) {
        for sub in inner.local.subscriptions.drain(..) {
            sub.cancel(carrier.as_deref_mut());
        }
        if let Some(job) = inner.current.take() {
            job.fail(error);
        }
        for job in inner.local.fast_lane.drain(..) {
            job.fail(error);
        }
        self.seal(error);
    }

    fn fail(
        &self,
        inner: &mut TaskInner<A>,
        error: ActorError,
        carrier: &mut CarrierContext,
    ) -> TurnOutcome {
        tracing::error!(
            actor = %self.core.name,
            actor_id = %self.core.id,
            phase = ?inner.local.phase,
            %error,
            "actor failed"
        );
        self.set_phase(&mut inner.local, ActorPhase::Failed);
        let discard = ActorError::failed_by(&error);
        self.teardown(inner, &discard, Some(carrier));

        let actor = &mut inner.actor;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| actor.on_actor_failed(&error))) {
            tracing::warn!(
                actor = %self.core.name,
                error = %ActorError::from_panic(payload),
                "failure hook panicked"
            );
        }
        self.core.started.fail(discard.clone());
        self.core.closed.fail(discard);
        TurnOutcome::Terminated
    }
}

impl<A: Actor> ScheduledTask for Task<A> {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn run_turn(self: Arc<Self>, carrier: &mut CarrierContext) -> TurnOutcome {
        let Some(mut inner) = self.inner.try_lock() else {
            // Unreachable while claims are exclusive; retry instead of blocking
            tracing::warn!(actor_id = %self.core.id, "task state locked by another thread");
            return TurnOutcome::Yield;
        };
        self.core.wake_pending.store(false, Ordering::SeqCst);
        self.drive(&mut inner, carrier)
    }

    fn has_submissions(&self) -> bool {
        !self.submitted.is_empty()
    }

    fn abort(&self) {
        let Some(mut inner) = self.inner.try_lock() else {
            return;
        };
        if inner.local.phase.is_terminal() {
            return;
        }
        tracing::debug!(actor = %self.core.name, actor_id = %self.core.id, "aborting task");
        self.set_phase(&mut inner.local, ActorPhase::Closed);
        self.teardown(&mut inner, &ActorError::Closed, None);
        self.core.started.fail(ActorError::Closed);
        self.core.closed.fail(ActorError::Closed);
        self.core.set_state(SchedulingState::Terminated);
    }
}
