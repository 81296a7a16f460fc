//! Handles for driving actors
//!
//! [`ActorControl`] is only available while one of the actor's own jobs
//! runs; it schedules further work for that actor without locking, since
//! the carrier running the job holds the task's claim. [`ActorRef`] is the
//! cloneable handle everything else uses: other actors, other threads and
//! tests.

use crate::actor::{Actor, ActorId, ActorPhase, PhaseMask};
use crate::channel::ConsumableChannel;
use crate::error::{ActorError, ActorResult};
use crate::future::{ActorFuture, CompletionSlot};
use crate::scheduler::carrier::CarrierContext;
use crate::scheduler::job::{repeat_fn, Job};
use crate::scheduler::subscription::{
    ActorCondition, ChannelSubscription, ScheduledTimer, Subscription, SubscriptionSource,
};
use crate::scheduler::task::{Task, TaskLocal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Control handle passed to every job of an actor
pub struct ActorControl<'a, A: Actor> {
    task: &'a Arc<Task<A>>,
    local: &'a mut TaskLocal<A>,
    carrier: &'a mut CarrierContext,
}

impl<'a, A: Actor> ActorControl<'a, A> {
    pub(crate) fn new(
        task: &'a Arc<Task<A>>,
        local: &'a mut TaskLocal<A>,
        carrier: &'a mut CarrierContext,
    ) -> Self {
        Self {
            task,
            local,
            carrier,
        }
    }

    /// Id of the running actor
    pub fn id(&self) -> ActorId {
        self.task.core().id()
    }

    /// Name of the running actor
    pub fn name(&self) -> &str {
        self.task.core().name()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ActorPhase {
        self.local.phase
    }

    /// Whether a close was requested or is in progress
    pub fn is_closing(&self) -> bool {
        matches!(
            self.local.phase,
            ActorPhase::CloseRequested | ActorPhase::Closing
        ) || (self.local.phase == ActorPhase::Started && self.task.core().is_close_requested())
    }

    /// Time of the scheduler clock
    pub fn now(&self) -> Duration {
        self.carrier.now()
    }

    /// External handle to this actor
    pub fn actor_ref(&self) -> ActorRef<A> {
        ActorRef {
            task: Arc::clone(self.task),
        }
    }

    /// Run `f` next, before any externally submitted job
    pub fn run<F>(&mut self, f: F)
    where
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        self.local.fast_lane.push_back(Job::once(f));
    }

    /// Append `f` to the actor's submitted queue, behind other external jobs
    pub fn submit<F>(&mut self, f: F)
    where
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        self.task.submit(Job::once(f));
    }

    /// Run `f` next and expose its result as a future
    pub fn call<T, F>(&mut self, f: F) -> ActorFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) -> T + Send + 'static,
    {
        let future = ActorFuture::new();
        let target = future.clone();
        self.local.fast_lane.push_back(Job::call(
            move |actor, ctl| {
                target.complete(f(actor, ctl));
            },
            Box::new(future.clone()),
        ));
        future
    }

    /// Run `f` repeatedly, giving other actors a turn in between, until it
    /// calls [`ActorControl::done`]
    pub fn run_until_done<F>(&mut self, f: F)
    where
        F: FnMut(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        self.local.fast_lane.push_back(Job::until_done(f));
    }

    /// Mark the running until-done job as finished
    pub fn done(&mut self) {
        self.local.job_done = true;
    }

    /// End the turn after the current job and requeue the actor
    pub fn yield_thread(&mut self) {
        self.local.yield_requested = true;
    }

    /// Run `f` once after `delay`
    pub fn run_delayed<F>(&mut self, delay: Duration, f: F) -> ScheduledTimer
    where
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        let mut f = Some(f);
        self.schedule_timer(delay, false, move |actor, ctl| {
            if let Some(f) = f.take() {
                f(actor, ctl);
            }
        })
    }

    /// Run `f` every `period`, measured from each firing, until cancelled
    pub fn run_at_fixed_rate<F>(&mut self, period: Duration, f: F) -> ScheduledTimer
    where
        F: FnMut(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        self.schedule_timer(period, true, f)
    }

    fn schedule_timer<F>(&mut self, delay: Duration, recurring: bool, f: F) -> ScheduledTimer
    where
        F: FnMut(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        let timer = ScheduledTimer::new(delay, recurring, self.task.core().waker());
        let state = timer.state();
        let deadline = self.carrier.now() + delay;
        self.carrier.arm_timer(&state, deadline);

        let id = self.local.next_subscription_id();
        self.local.subscriptions.push(Subscription::new(
            id,
            SubscriptionSource::Timer(state),
            repeat_fn(f),
            PhaseMask::STARTED,
        ));
        timer
    }

    /// Cancel a timer; removes it from the wheel right away when it lives
    /// on this carrier
    pub fn cancel_timer(&mut self, timer: &ScheduledTimer) {
        timer.state().cancel(Some(&mut *self.carrier));
    }

    /// Run `f` once per [`ActorCondition::signal`]
    pub fn on_condition<F>(&mut self, name: impl Into<String>, f: F) -> ActorCondition
    where
        F: FnMut(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        let condition = ActorCondition::new(name.into(), self.task.core().waker());
        let id = self.local.next_subscription_id();
        self.local.subscriptions.push(Subscription::new(
            id,
            SubscriptionSource::Condition(condition.state()),
            repeat_fn(f),
            PhaseMask::STARTED,
        ));
        condition
    }

    /// Run `f` whenever `channel` has data available
    ///
    /// The callback should consume from the channel; it is invoked again
    /// as long as data remains.
    pub fn consume<C, F>(&mut self, channel: Arc<C>, f: F) -> ChannelSubscription
    where
        C: ConsumableChannel,
        F: FnMut(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        let channel: Arc<dyn ConsumableChannel> = channel;
        let subscription = ChannelSubscription::new(channel, self.task.core().waker());
        let id = self.local.next_subscription_id();
        self.local.subscriptions.push(Subscription::new(
            id,
            SubscriptionSource::Channel(subscription.state()),
            repeat_fn(f),
            PhaseMask::STARTED,
        ));
        subscription
    }

    /// Run `f` with the outcome of `future` once it is done
    ///
    /// Fires while the actor is started or closing; the close sequence does
    /// not wait for it.
    pub fn run_on_completion<T, F>(&mut self, future: &ActorFuture<T>, f: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut A, &mut ActorControl<'_, A>, ActorResult<T>) + Send + 'static,
    {
        self.subscribe_future(future, PhaseMask::UNTIL_CLOSED, None, f);
    }

    /// Like [`ActorControl::run_on_completion`], but the current phase
    /// cannot end before `f` ran
    ///
    /// Registered while started, it holds back a requested close.
    pub fn run_on_completion_blocking_current_phase<T, F>(
        &mut self,
        future: &ActorFuture<T>,
        f: F,
    ) where
        T: Clone + Send + 'static,
        F: FnOnce(&mut A, &mut ActorControl<'_, A>, ActorResult<T>) + Send + 'static,
    {
        let phase = self.local.phase;
        let mask = match phase {
            ActorPhase::Started => PhaseMask::UNTIL_CLOSED,
            _ => PhaseMask::of(phase).with(ActorPhase::Started),
        };
        self.subscribe_future(future, mask, Some(phase), f);
    }

    /// Run `f` once every future in `futures` is done
    ///
    /// `f` receives the last error observed, or `None` if all succeeded.
    pub fn run_on_completion_all<T, F>(&mut self, futures: &[ActorFuture<T>], f: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut A, &mut ActorControl<'_, A>, Option<ActorError>) + Send + 'static,
    {
        let all: ActorFuture<Option<ActorError>> = ActorFuture::new();
        if futures.is_empty() {
            all.complete(None);
        } else {
            let remaining = Arc::new(AtomicUsize::new(futures.len()));
            let last_error = Arc::new(Mutex::new(None));
            for future in futures {
                let all = all.clone();
                let remaining = Arc::clone(&remaining);
                let last_error = Arc::clone(&last_error);
                future.on_complete(move |result| {
                    if let Err(error) = result {
                        *last_error.lock() = Some(error.clone());
                    }
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        all.complete(last_error.lock().take());
                    }
                });
            }
        }
        self.run_on_completion(&all, move |actor, ctl, result| {
            f(actor, ctl, result.unwrap_or_else(Some));
        });
    }

    fn subscribe_future<T, F>(
        &mut self,
        future: &ActorFuture<T>,
        phases: PhaseMask,
        blocking: Option<ActorPhase>,
        f: F,
    ) where
        T: Clone + Send + 'static,
        F: FnOnce(&mut A, &mut ActorControl<'_, A>, ActorResult<T>) + Send + 'static,
    {
        let slot: Box<dyn CompletionSlot> = Box::new(future.clone());
        let waker = self.task.core().waker();
        slot.when_done(Box::new(move || waker.wake()));

        let observed = future.clone();
        let mut f = Some(f);
        let callback = repeat_fn(move |actor, ctl| {
            if let (Some(f), Some(result)) = (f.take(), observed.try_result()) {
                f(actor, ctl, result);
            }
        });

        let id = self.local.next_subscription_id();
        let mut subscription = Subscription::new(
            id,
            SubscriptionSource::Future(slot),
            callback,
            phases,
        );
        if let Some(phase) = blocking {
            subscription = subscription.blocking(phase);
        }
        self.local.subscriptions.push(subscription);
    }

    /// Request a graceful close once the current job finished
    ///
    /// Returns the future completed when the actor reached `Closed`.
    pub fn close(&mut self) -> ActorFuture<()> {
        self.task.core().request_close();
        self.task.core().closed_future()
    }

    /// Fail the actor after the current job
    pub fn fail(&mut self, error: ActorError) {
        self.local.failure = Some(error);
    }
}

impl<A: Actor> std::fmt::Debug for ActorControl<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorControl")
            .field("actor", &self.task.core().name())
            .field("actor_id", &self.task.core().id())
            .field("phase", &self.local.phase)
            .field("carrier", &self.carrier.index())
            .finish()
    }
}

/// Cloneable handle to a submitted actor
pub struct ActorRef<A: Actor> {
    task: Arc<Task<A>>,
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
        }
    }
}

impl<A: Actor> ActorRef<A> {
    pub(crate) fn new(task: Arc<Task<A>>) -> Self {
        Self { task }
    }

    /// Actor id
    pub fn id(&self) -> ActorId {
        self.task.core().id()
    }

    /// Actor name
    pub fn name(&self) -> &str {
        self.task.core().name()
    }

    /// Last phase published by the actor
    pub fn phase(&self) -> ActorPhase {
        self.task.core().phase()
    }

    /// Submit a job; it runs once the actor is started, in submission order
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        self.task.submit(Job::once(f));
    }

    /// Submit a job and expose its result as a future
    ///
    /// The future fails with [`ActorError::Closed`] if the actor no longer
    /// accepts work, or once it closes before running the job.
    pub fn call<T, F>(&self, f: F) -> ActorFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) -> T + Send + 'static,
    {
        let future = ActorFuture::new();
        let target = future.clone();
        self.task.submit(Job::call(
            move |actor, ctl| {
                target.complete(f(actor, ctl));
            },
            Box::new(future.clone()),
        ));
        future
    }

    /// Request a graceful close
    pub fn close(&self) -> ActorFuture<()> {
        self.task.core().request_close();
        self.task.core().closed_future()
    }

    /// Completed once the starting hook finished
    pub fn on_started(&self) -> ActorFuture<()> {
        self.task.core().started_future()
    }

    /// Completed once the actor reached `Closed`; failed if it failed
    pub fn on_closed(&self) -> ActorFuture<()> {
        self.task.core().closed_future()
    }
}

impl<A: Actor> std::fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}
