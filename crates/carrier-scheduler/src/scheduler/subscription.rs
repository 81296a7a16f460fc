//! Wake sources that turn external events into jobs
//!
//! A subscription belongs to one task and is only touched by the carrier
//! that currently holds the task's claim. The shared halves
//! (`ConditionState`, `TimerState`, ...) are what other threads see: they
//! flip an atomic and wake the task, and the owner polls on its next turn.

use crate::actor::{Actor, ActorPhase, PhaseMask};
use crate::channel::ConsumableChannel;
use crate::future::CompletionSlot;
use crate::scheduler::carrier::CarrierContext;
use crate::scheduler::job::{Job, RepeatFn};
use crate::scheduler::task::ActorWaker;
use crate::scheduler::timer::{TimerCanceller, TimerId, TimerTarget};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) type SubscriptionId = u64;

pub(crate) struct ConditionState {
    name: String,
    triggers: AtomicU64,
    cancelled: AtomicBool,
    waker: ActorWaker,
}

/// Handle to a condition registered with `ActorControl::on_condition`
///
/// Every `signal` results in exactly one run of the callback, also when
/// several signals arrive before the actor gets scheduled.
#[derive(Clone)]
pub struct ActorCondition {
    state: Arc<ConditionState>,
}

impl ActorCondition {
    pub(crate) fn new(name: String, waker: ActorWaker) -> Self {
        Self {
            state: Arc::new(ConditionState {
                name,
                triggers: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                waker,
            }),
        }
    }

    /// Request one run of the callback; callable from any thread
    pub fn signal(&self) {
        if self.state.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.state.triggers.fetch_add(1, Ordering::SeqCst);
        self.state.waker.wake();
    }

    /// Stop reacting to signals
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.waker.wake();
    }

    /// Name given at registration
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub(crate) fn state(&self) -> Arc<ConditionState> {
        Arc::clone(&self.state)
    }
}

impl std::fmt::Debug for ActorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorCondition")
            .field("name", &self.state.name)
            .field("triggers", &self.state.triggers.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct ChannelState {
    channel: Arc<dyn ConsumableChannel>,
    cancelled: AtomicBool,
    waker: ActorWaker,
}

/// Handle to a channel consumer registered with `ActorControl::consume`
#[derive(Clone)]
pub struct ChannelSubscription {
    state: Arc<ChannelState>,
}

impl ChannelSubscription {
    pub(crate) fn new(channel: Arc<dyn ConsumableChannel>, waker: ActorWaker) -> Self {
        channel.register_consumer(waker.clone());
        Self {
            state: Arc::new(ChannelState {
                channel,
                cancelled: AtomicBool::new(false),
                waker,
            }),
        }
    }

    /// Stop consuming; the actor is no longer woken by the channel
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.waker.wake();
    }

    pub(crate) fn state(&self) -> Arc<ChannelState> {
        Arc::clone(&self.state)
    }
}

pub(crate) struct TimerState {
    delay: Duration,
    recurring: bool,
    triggered: AtomicBool,
    cancelled: AtomicBool,
    fired_at_nanos: AtomicU64,
    waker: ActorWaker,
    registration: Mutex<Option<(TimerId, TimerCanceller)>>,
}

impl TimerState {
    /// Record the wheel entry currently backing this timer
    pub(crate) fn register(&self, id: TimerId, canceller: TimerCanceller) {
        *self.registration.lock() = Some((id, canceller));
    }

    /// Cancel and remove the wheel entry, synchronously when `local` owns it
    pub(crate) fn cancel(&self, local: Option<&mut CarrierContext>) {
        self.cancelled.store(true, Ordering::SeqCst);
        let Some((id, canceller)) = self.registration.lock().take() else {
            return;
        };
        match local {
            Some(carrier) if carrier.timers_canceller().same_wheel(&canceller) => {
                carrier.cancel_timer(id);
            }
            _ => canceller.cancel(id),
        }
    }
}

impl TimerTarget for TimerState {
    fn expire(&self, now: Duration) {
        self.registration.lock().take();
        self.fired_at_nanos
            .store(now.as_nanos() as u64, Ordering::SeqCst);
        self.triggered.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to a delayed or recurring timer
#[derive(Clone)]
pub struct ScheduledTimer {
    state: Arc<TimerState>,
}

impl ScheduledTimer {
    pub(crate) fn new(delay: Duration, recurring: bool, waker: ActorWaker) -> Self {
        Self {
            state: Arc::new(TimerState {
                delay,
                recurring,
                triggered: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                fired_at_nanos: AtomicU64::new(0),
                waker,
                registration: Mutex::new(None),
            }),
        }
    }

    /// Cancel from any thread; a firing that already happened but whose
    /// callback has not run yet is dropped
    pub fn cancel(&self) {
        self.state.cancel(None);
        self.state.waker.wake();
    }

    /// Whether the timer was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Configured delay (and period, for recurring timers)
    pub fn delay(&self) -> Duration {
        self.state.delay
    }

    /// Whether the timer re-arms after each firing
    pub fn is_recurring(&self) -> bool {
        self.state.recurring
    }

    pub(crate) fn state(&self) -> Arc<TimerState> {
        Arc::clone(&self.state)
    }
}

impl std::fmt::Debug for ScheduledTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTimer")
            .field("delay", &self.state.delay)
            .field("recurring", &self.state.recurring)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// What a subscription waits on
pub(crate) enum SubscriptionSource {
    Condition(Arc<ConditionState>),
    Channel(Arc<ChannelState>),
    Future(Box<dyn CompletionSlot>),
    Timer(Arc<TimerState>),
}

pub(crate) struct Subscription<A: Actor> {
    id: SubscriptionId,
    source: SubscriptionSource,
    /// Taken while the produced job is queued or running
    callback: Option<RepeatFn<A>>,
    phases: PhaseMask,
    blocking: Option<ActorPhase>,
    runs: u64,
}

impl<A: Actor> Subscription<A> {
    pub(crate) fn new(
        id: SubscriptionId,
        source: SubscriptionSource,
        callback: RepeatFn<A>,
        phases: PhaseMask,
    ) -> Self {
        Self {
            id,
            source,
            callback: Some(callback),
            phases,
            blocking: None,
            runs: 0,
        }
    }

    /// Hold back the transition out of `phase` until this subscription ran
    pub(crate) fn blocking(mut self, phase: ActorPhase) -> Self {
        self.blocking = Some(phase);
        self
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn is_recurring(&self) -> bool {
        match &self.source {
            SubscriptionSource::Condition(_) | SubscriptionSource::Channel(_) => true,
            SubscriptionSource::Future(_) => false,
            SubscriptionSource::Timer(timer) => timer.recurring,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        match &self.source {
            SubscriptionSource::Condition(c) => c.cancelled.load(Ordering::SeqCst),
            SubscriptionSource::Channel(c) => c.cancelled.load(Ordering::SeqCst),
            SubscriptionSource::Future(_) => false,
            SubscriptionSource::Timer(t) => t.is_cancelled(),
        }
    }

    /// Whether the produced job is still queued or running
    pub(crate) fn is_job_pending(&self) -> bool {
        self.callback.is_none()
    }

    pub(crate) fn triggers_in_phase(&self, phase: ActorPhase) -> bool {
        self.phases.contains(phase)
    }

    pub(crate) fn blocks(&self, phase: ActorPhase) -> bool {
        self.blocking == Some(phase)
    }

    /// Whether there is work for the subscription right now
    pub(crate) fn poll(&self) -> bool {
        match &self.source {
            SubscriptionSource::Condition(c) => c.triggers.load(Ordering::SeqCst) > self.runs,
            SubscriptionSource::Channel(c) => c.channel.has_available(),
            SubscriptionSource::Future(slot) => slot.is_done(),
            SubscriptionSource::Timer(t) => t.triggered.load(Ordering::SeqCst),
        }
    }

    /// Produce the job to run; `None` while a previous job is outstanding
    pub(crate) fn take_job(&mut self) -> Option<Job<A>> {
        self.callback
            .take()
            .map(|callback| Job::subscription(self.id, callback))
    }

    /// Hand the callback back without counting a run
    pub(crate) fn restore(&mut self, callback: RepeatFn<A>) {
        self.callback = Some(callback);
    }

    /// Re-arm after the job terminated
    pub(crate) fn on_job_completed(&mut self, callback: RepeatFn<A>, carrier: &mut CarrierContext) {
        self.callback = Some(callback);
        self.runs += 1;
        if let SubscriptionSource::Timer(timer) = &self.source {
            timer.triggered.store(false, Ordering::SeqCst);
            if timer.recurring && !timer.is_cancelled() {
                let fired_at = Duration::from_nanos(timer.fired_at_nanos.load(Ordering::SeqCst));
                carrier.arm_timer(timer, fired_at + timer.delay);
            }
        }
    }

    /// Release everything the subscription holds outside the task
    pub(crate) fn cancel(self, carrier: Option<&mut CarrierContext>) {
        match self.source {
            SubscriptionSource::Condition(c) => c.cancelled.store(true, Ordering::SeqCst),
            SubscriptionSource::Channel(c) => {
                c.cancelled.store(true, Ordering::SeqCst);
                c.channel.remove_consumer(&c.waker);
            }
            SubscriptionSource::Future(_) => {}
            SubscriptionSource::Timer(t) => t.cancel(carrier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::repeat_fn;

    struct Nop;
    impl Actor for Nop {}

    fn subscription(source: SubscriptionSource) -> Subscription<Nop> {
        Subscription::new(1, source, repeat_fn(|_, _| {}), PhaseMask::STARTED)
    }

    #[test]
    fn test_condition_counts_signals() {
        let condition = ActorCondition::new("cond".into(), ActorWaker::detached());
        let mut sub = subscription(SubscriptionSource::Condition(condition.state()));
        assert!(sub.is_recurring());
        assert!(!sub.poll());

        condition.signal();
        condition.signal();
        assert!(sub.poll());

        let job = sub.take_job().unwrap();
        assert!(sub.is_job_pending());
        assert!(sub.take_job().is_none());

        // Simulate one completed run without a carrier
        let (_, callback) = job.into_subscription_callback().unwrap();
        sub.restore(callback);
        sub.runs += 1;
        assert!(sub.poll());
        sub.runs += 1;
        assert!(!sub.poll());
    }

    #[test]
    fn test_cancelled_condition_ignores_signals() {
        let condition = ActorCondition::new("cond".into(), ActorWaker::detached());
        let sub = subscription(SubscriptionSource::Condition(condition.state()));
        condition.cancel();
        condition.signal();
        assert!(sub.is_cancelled());
        assert!(!sub.poll());
    }

    #[test]
    fn test_future_subscription_is_one_shot() {
        let future = crate::future::ActorFuture::<u8>::new();
        let sub = Subscription::<Nop>::new(
            2,
            SubscriptionSource::Future(Box::new(future.clone())),
            repeat_fn(|_, _| {}),
            PhaseMask::UNTIL_CLOSED,
        )
        .blocking(ActorPhase::Closing);

        assert!(!sub.is_recurring());
        assert!(!sub.poll());
        future.complete(1);
        assert!(sub.poll());

        assert!(sub.triggers_in_phase(ActorPhase::Closing));
        assert!(!sub.triggers_in_phase(ActorPhase::Closed));
        assert!(sub.blocks(ActorPhase::Closing));
        assert!(!sub.blocks(ActorPhase::Started));
    }

    #[test]
    fn test_timer_expiry_marks_triggered() {
        let timer = ScheduledTimer::new(Duration::from_millis(5), false, ActorWaker::detached());
        let sub = subscription(SubscriptionSource::Timer(timer.state()));
        assert!(!sub.poll());

        timer.state().expire(Duration::from_millis(5));
        assert!(sub.poll());

        timer.cancel();
        assert!(sub.is_cancelled());
    }
}
