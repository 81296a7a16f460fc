//! Schedulable execution units of a task

use crate::actor::Actor;
use crate::control::ActorControl;
use crate::error::ActorError;
use crate::future::CompletionSlot;
use crate::scheduler::subscription::SubscriptionId;

/// One-shot job body
type OnceFn<A> = Box<dyn FnOnce(&mut A, &mut ActorControl<'_, A>) + Send>;

/// Body that may run many times (until-done jobs and subscription callbacks)
pub(crate) type RepeatFn<A> = Box<dyn FnMut(&mut A, &mut ActorControl<'_, A>) + Send>;

/// Actor hook a synthetic lifecycle job invokes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LifecycleHook {
    Starting,
    Started,
    CloseRequested,
    Closing,
    Closed,
}

enum JobBody<A: Actor> {
    Once(Option<OnceFn<A>>),
    UntilDone(RepeatFn<A>),
    Subscription {
        id: SubscriptionId,
        callback: RepeatFn<A>,
    },
    Lifecycle(LifecycleHook),
}

/// A job owned by exactly one task at a time
///
/// Jobs move between the submitted queue, the fast lane and the running
/// slot; a terminated job is dropped, never reused.
pub(crate) struct Job<A: Actor> {
    body: JobBody<A>,
    result: Option<Box<dyn CompletionSlot>>,
}

/// Box a repeatable body, fixing its signature for the control handle
pub(crate) fn repeat_fn<A, F>(f: F) -> RepeatFn<A>
where
    A: Actor,
    F: FnMut(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
{
    Box::new(f)
}

impl<A: Actor> Job<A> {
    pub(crate) fn once<F>(f: F) -> Self
    where
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        Self {
            body: JobBody::Once(Some(Box::new(f))),
            result: None,
        }
    }

    /// One-shot job whose future is failed if the job never completes it
    pub(crate) fn call<F>(f: F, result: Box<dyn CompletionSlot>) -> Self
    where
        F: FnOnce(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        Self {
            body: JobBody::Once(Some(Box::new(f))),
            result: Some(result),
        }
    }

    pub(crate) fn until_done<F>(f: F) -> Self
    where
        F: FnMut(&mut A, &mut ActorControl<'_, A>) + Send + 'static,
    {
        Self {
            body: JobBody::UntilDone(Box::new(f)),
            result: None,
        }
    }

    pub(crate) fn subscription(id: SubscriptionId, callback: RepeatFn<A>) -> Self {
        Self {
            body: JobBody::Subscription { id, callback },
            result: None,
        }
    }

    pub(crate) fn lifecycle(hook: LifecycleHook) -> Self {
        Self {
            body: JobBody::Lifecycle(hook),
            result: None,
        }
    }

    /// Whether a single run terminates the job
    pub(crate) fn is_auto_completing(&self) -> bool {
        !matches!(self.body, JobBody::UntilDone(_))
    }

    pub(crate) fn subscription_id(&self) -> Option<SubscriptionId> {
        match &self.body {
            JobBody::Subscription { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Execute the body once
    pub(crate) fn run(&mut self, actor: &mut A, ctl: &mut ActorControl<'_, A>) {
        match &mut self.body {
            JobBody::Once(f) => {
                if let Some(f) = f.take() {
                    f(actor, ctl);
                }
            }
            JobBody::UntilDone(f) => f(actor, ctl),
            JobBody::Subscription { callback, .. } => callback(actor, ctl),
            JobBody::Lifecycle(hook) => match hook {
                LifecycleHook::Starting => actor.on_actor_starting(ctl),
                LifecycleHook::Started => actor.on_actor_started(ctl),
                LifecycleHook::CloseRequested => actor.on_actor_close_requested(ctl),
                LifecycleHook::Closing => actor.on_actor_closing(ctl),
                LifecycleHook::Closed => actor.on_actor_closed(ctl),
            },
        }
    }

    /// Split a subscription job back into its callback
    pub(crate) fn into_subscription_callback(self) -> Option<(SubscriptionId, RepeatFn<A>)> {
        match self.body {
            JobBody::Subscription { id, callback } => Some((id, callback)),
            _ => None,
        }
    }

    /// Fail the job's future, if it has one and it is still pending
    pub(crate) fn fail(&self, error: &ActorError) {
        if let Some(result) = &self.result {
            result.fail_with(error.clone());
        }
    }
}
