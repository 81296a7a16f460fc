//! Deterministic single-threaded scheduler for tests
//!
//! Runs the same carrier step as the threaded scheduler, but only when the
//! caller asks for it and only on the calling thread. Time moves when the
//! test advances the [`ControlledClock`].

use crate::actor::{Actor, SchedulingHints, ThreadGroupKind};
use crate::clock::{ActorClock, ControlledClock};
use crate::config::SchedulerConfig;
use crate::control::ActorRef;
use crate::error::SchedulerResult;
use crate::scheduler::carrier::Carrier;
use crate::scheduler::group::{SelectionPolicy, ThreadGroup};
use crate::scheduler::scheduler::{build_group, SchedulerShared, SchedulerStats};
use parking_lot::Mutex;
use std::sync::Arc;

/// Scheduler whose single carrier is driven by [`ControlledActorScheduler::work_until_done`]
///
/// Both thread group kinds map to the one carrier, which applies the
/// configured priority quotas.
pub struct ControlledActorScheduler {
    clock: Arc<ControlledClock>,
    shared: Arc<SchedulerShared>,
    group: Arc<ThreadGroup>,
    carrier: Mutex<Carrier>,
}

impl ControlledActorScheduler {
    /// Create a scheduler with the default configuration
    pub fn new(clock: Arc<ControlledClock>) -> Self {
        let config = SchedulerConfig::default();
        let shared = Arc::new(SchedulerShared::new());
        let erased: Arc<dyn ActorClock> = clock.clone();
        let (group, mut carriers) = build_group(
            "controlled",
            ThreadGroupKind::CpuBound,
            1,
            SelectionPolicy::Quotas(config.priority_quotas),
            &config,
            &erased,
            &shared,
        );
        // build_group always creates at least one carrier
        let carrier = carriers.swap_remove(0);
        Self {
            clock,
            shared,
            group,
            carrier: Mutex::new(carrier),
        }
    }

    /// Create a scheduler using the quotas and timer settings of `config`
    pub fn with_config(
        config: &SchedulerConfig,
        clock: Arc<ControlledClock>,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let shared = Arc::new(SchedulerShared::new());
        let erased: Arc<dyn ActorClock> = clock.clone();
        let (group, mut carriers) = build_group(
            "controlled",
            ThreadGroupKind::CpuBound,
            1,
            SelectionPolicy::Quotas(config.priority_quotas),
            config,
            &erased,
            &shared,
        );
        let carrier = carriers.swap_remove(0);
        Ok(Self {
            clock,
            shared,
            group,
            carrier: Mutex::new(carrier),
        })
    }

    /// Submit an actor at regular priority
    pub fn submit_actor<A: Actor>(&self, actor: A) -> SchedulerResult<ActorRef<A>> {
        self.submit_actor_with_hints(actor, SchedulingHints::default())
    }

    /// Submit an actor; the group kind is ignored, the priority is honoured
    pub fn submit_actor_with_hints<A: Actor>(
        &self,
        actor: A,
        hints: SchedulingHints,
    ) -> SchedulerResult<ActorRef<A>> {
        self.shared.spawn(actor, hints, &self.group)
    }

    /// Run ready tasks and expired timers until nothing is runnable
    ///
    /// Returns the number of carrier steps that did work.
    pub fn work_until_done(&self) -> usize {
        let mut carrier = self.carrier.lock();
        let _guard = self.group.enter(carrier.context().index());
        let mut steps = 0;
        while carrier.work_once() {
            steps += 1;
        }
        steps
    }

    /// Clock driving the timers
    pub fn clock(&self) -> &Arc<ControlledClock> {
        &self.clock
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats(self.group.steals())
    }
}

impl std::fmt::Debug for ControlledActorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlledActorScheduler")
            .field("now", &self.clock.now())
            .field("active_actors", &self.stats().active_actors)
            .finish()
    }
}

impl Drop for ControlledActorScheduler {
    fn drop(&mut self) {
        self.shared.close_submissions();
        let aborted = self.shared.abort_all();
        self.group.clear();
        if aborted > 0 {
            tracing::debug!(aborted, "controlled scheduler dropped with live actors");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ActorControl;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    impl Actor for Counter {
        fn on_actor_started(&mut self, ctl: &mut ActorControl<'_, Self>) {
            ctl.run_delayed(Duration::from_millis(10), |actor, _| actor.hits += 1);
        }
    }

    #[test]
    fn test_nothing_happens_until_driven() {
        let scheduler = ControlledActorScheduler::new(Arc::new(ControlledClock::new()));
        let actor = scheduler.submit_actor(Counter::default()).unwrap();
        assert!(!actor.on_started().is_done());

        assert!(scheduler.work_until_done() > 0);
        assert!(actor.on_started().is_done());
        assert_eq!(scheduler.work_until_done(), 0);
    }

    #[test]
    fn test_timer_fires_after_clock_advance() {
        let clock = Arc::new(ControlledClock::new());
        let scheduler = ControlledActorScheduler::new(Arc::clone(&clock));
        let actor = scheduler.submit_actor(Counter::default()).unwrap();
        scheduler.work_until_done();

        clock.advance(Duration::from_millis(9));
        scheduler.work_until_done();
        assert_eq!(actor.call(|a, _| a.hits).try_result(), None);
        scheduler.work_until_done();
        assert_eq!(actor.call(|a, _| a.hits).join(), Ok(0));

        clock.advance(Duration::from_millis(1));
        scheduler.work_until_done();
        let hits = actor.call(|a, _| a.hits);
        scheduler.work_until_done();
        assert_eq!(hits.join(), Ok(1));
    }

    #[test]
    fn test_drop_fails_pending_futures() {
        let scheduler = ControlledActorScheduler::new(Arc::new(ControlledClock::new()));
        let actor = scheduler.submit_actor(Counter::default()).unwrap();
        let closed = actor.on_closed();
        drop(scheduler);
        assert_eq!(closed.join(), Err(crate::error::ActorError::Closed));
    }
}
