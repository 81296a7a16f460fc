//! Completion slots shared between actors and outside threads
//!
//! An [`ActorFuture`] is completed or failed exactly once. Any number of
//! clones may observe it: blocking through [`ActorFuture::join`], through
//! callbacks registered with [`ActorFuture::on_complete`], or from inside
//! an actor via `ActorControl::run_on_completion`, which never blocks the
//! carrier thread.

use crate::error::{ActorError, ActorResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(&ActorResult<T>) + Send>;

enum Slot<T> {
    Pending(Vec<Callback<T>>),
    Done(ActorResult<T>),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    done: AtomicBool,
    completed: Condvar,
}

/// Single-assignment result slot
pub struct ActorFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ActorFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> ActorFuture<T> {
    /// Create a pending future
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending(Vec::new())),
                done: AtomicBool::new(false),
                completed: Condvar::new(),
            }),
        }
    }

    /// Create an already completed future
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    /// Create an already failed future
    pub fn failed(error: ActorError) -> Self {
        let future = Self::new();
        future.fail(error);
        future
    }

    /// Complete with a value. Returns false if the future was already done.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Fail with an error. Returns false if the future was already done.
    pub fn fail(&self, error: ActorError) -> bool {
        self.settle(Err(error))
    }

    /// Complete or fail depending on `result`
    pub fn settle(&self, result: ActorResult<T>) -> bool {
        let callbacks = {
            let mut slot = self.shared.slot.lock();
            let callbacks = match &mut *slot {
                Slot::Done(_) => return false,
                Slot::Pending(callbacks) => std::mem::take(callbacks),
            };
            *slot = Slot::Done(result.clone());
            self.shared.done.store(true, Ordering::SeqCst);
            callbacks
        };
        self.shared.completed.notify_all();

        for callback in callbacks {
            callback(&result);
        }
        true
    }

    /// Whether a value or error has been set
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// Whether the future is done with an error
    pub fn is_failed(&self) -> bool {
        matches!(self.try_result(), Some(Err(_)))
    }

    /// The outcome, if already set
    pub fn try_result(&self) -> Option<ActorResult<T>> {
        match &*self.shared.slot.lock() {
            Slot::Done(result) => Some(result.clone()),
            Slot::Pending(_) => None,
        }
    }

    /// Block until the future is done
    ///
    /// Must not be called from inside an actor job: the carrier thread
    /// would stall every other actor queued on it.
    pub fn join(&self) -> ActorResult<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Slot::Done(result) = &*slot {
                return result.clone();
            }
            self.shared.completed.wait(&mut slot);
        }
    }

    /// Block until the future is done or `timeout` elapses
    pub fn join_timeout(&self, timeout: Duration) -> ActorResult<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Slot::Done(result) = &*slot {
                return result.clone();
            }
            if self
                .shared
                .completed
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return match &*slot {
                    Slot::Done(result) => result.clone(),
                    Slot::Pending(_) => Err(ActorError::Timeout(timeout)),
                };
            }
        }
    }

    /// Run `callback` once the future is done
    ///
    /// The callback runs on the completing thread, or immediately on the
    /// calling thread if the future is already done.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&ActorResult<T>) + Send + 'static,
    {
        let result = {
            let mut slot = self.shared.slot.lock();
            match &mut *slot {
                Slot::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                Slot::Done(result) => result.clone(),
            }
        };
        callback(&result);
    }

    /// Map a successful value; failures pass through without calling `f`
    pub fn then_apply<U, F>(&self, f: F) -> ActorFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let next = ActorFuture::new();
        let target = next.clone();
        self.on_complete(move |result| match result {
            Ok(value) => {
                let value = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(value))) {
                    Ok(mapped) => target.complete(mapped),
                    Err(payload) => target.fail(ActorError::from_panic(payload)),
                };
            }
            Err(error) => {
                target.fail(error.clone());
            }
        });
        next
    }

    /// Chain a future-producing step; failures pass through without calling `f`
    pub fn and_then<U, F>(&self, f: F) -> ActorFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ActorFuture<U> + Send + 'static,
    {
        let next = ActorFuture::new();
        let target = next.clone();
        self.on_complete(move |result| match result {
            Ok(value) => {
                let value = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(value))) {
                    Ok(inner) => {
                        inner.on_complete(move |inner_result| {
                            target.settle(inner_result.clone());
                        });
                    }
                    Err(payload) => {
                        target.fail(ActorError::from_panic(payload));
                    }
                }
            }
            Err(error) => {
                target.fail(error.clone());
            }
        });
        next
    }
}

impl<T: Clone + Send + 'static> Default for ActorFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ActorFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorFuture")
            .field("done", &self.shared.done.load(Ordering::Relaxed))
            .finish()
    }
}

/// Type-erased view of a future, used by jobs and future subscriptions
pub(crate) trait CompletionSlot: Send + Sync {
    /// Fail the slot if it is still pending
    fn fail_with(&self, error: ActorError);

    /// Whether the slot is done
    fn is_done(&self) -> bool;

    /// Run `notify` once the slot is done
    fn when_done(&self, notify: Box<dyn FnOnce() + Send>);
}

impl<T: Clone + Send + 'static> CompletionSlot for ActorFuture<T> {
    fn fail_with(&self, error: ActorError) {
        self.fail(error);
    }

    fn is_done(&self) -> bool {
        ActorFuture::is_done(self)
    }

    fn when_done(&self, notify: Box<dyn FnOnce() + Send>) {
        self.on_complete(move |_| notify());
    }
}
