//! Scheduler facade coordinating the thread groups

use crate::actor::{Actor, ActorId, SchedulingHints, ThreadGroupKind};
use crate::clock::{ActorClock, SystemClock};
use crate::config::SchedulerConfig;
use crate::control::ActorRef;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::carrier::Carrier;
use crate::scheduler::group::{SelectionPolicy, ThreadGroup};
use crate::scheduler::idle::{self, IdleStrategy};
use crate::scheduler::task::{ScheduledTask, Task};
use crate::scheduler::timer::TimerWheel;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total actors submitted
    pub actors_submitted: u64,

    /// Actors that reached `Closed` or `Failed`
    pub actors_terminated: u64,

    /// Actors currently registered
    pub active_actors: usize,

    /// Task turns run by all carriers
    pub turns_executed: u64,

    /// Tasks taken from another carrier's queue
    pub tasks_stolen: u64,
}

/// Builds the idle strategy of one carrier thread
type IdleFactory = Box<dyn Fn() -> Box<dyn IdleStrategy> + Send + Sync>;

/// Registry and counters shared by the facade and every carrier
pub(crate) struct SchedulerShared {
    actors: DashMap<ActorId, Arc<dyn ScheduledTask>>,
    next_actor_id: AtomicU64,
    actors_submitted: AtomicU64,
    actors_terminated: AtomicU64,
    turns_executed: AtomicU64,
    accepting: AtomicBool,
}

impl SchedulerShared {
    pub(crate) fn new() -> Self {
        Self {
            actors: DashMap::new(),
            next_actor_id: AtomicU64::new(1),
            actors_submitted: AtomicU64::new(0),
            actors_terminated: AtomicU64::new(0),
            turns_executed: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    /// Register the actor and queue its first turn on `group`
    pub(crate) fn spawn<A: Actor>(
        &self,
        actor: A,
        hints: SchedulingHints,
        group: &Arc<ThreadGroup>,
    ) -> SchedulerResult<ActorRef<A>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }

        let id = ActorId::from_u64(self.next_actor_id.fetch_add(1, Ordering::Relaxed));
        let task = Task::new(actor, id, hints, Arc::clone(group));
        let erased: Arc<dyn ScheduledTask> = task.clone();

        // Registered before the first turn so termination always finds it
        self.actors.insert(id, Arc::clone(&erased));
        self.actors_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            actor = %task.core().name(),
            actor_id = %id,
            group = %group.name(),
            priority = ?hints.priority,
            "actor submitted"
        );

        group.submit(erased);
        Ok(ActorRef::new(task))
    }

    pub(crate) fn record_turn(&self) {
        self.turns_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_terminated(&self, id: ActorId) {
        if self.actors.remove(&id).is_some() {
            self.actors_terminated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn close_submissions(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Tear down every actor still registered
    pub(crate) fn abort_all(&self) -> usize {
        let ids: Vec<ActorId> = self.actors.iter().map(|entry| *entry.key()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, task)) = self.actors.remove(&id) {
                task.abort();
                self.actors_terminated.fetch_add(1, Ordering::Relaxed);
                aborted += 1;
            }
        }
        aborted
    }

    pub(crate) fn stats(&self, tasks_stolen: u64) -> SchedulerStats {
        SchedulerStats {
            actors_submitted: self.actors_submitted.load(Ordering::Relaxed),
            actors_terminated: self.actors_terminated.load(Ordering::Relaxed),
            active_actors: self.actors.len(),
            turns_executed: self.turns_executed.load(Ordering::Relaxed),
            tasks_stolen,
        }
    }
}

/// Carriers of one group waiting for `start`
struct PendingGroup {
    group: Arc<ThreadGroup>,
    carriers: Vec<Carrier>,
}

/// Build a group and one carrier per queue set
pub(crate) fn build_group(
    name: &str,
    kind: ThreadGroupKind,
    threads: usize,
    policy: SelectionPolicy,
    config: &SchedulerConfig,
    clock: &Arc<dyn ActorClock>,
    shared: &Arc<SchedulerShared>,
) -> (Arc<ThreadGroup>, Vec<Carrier>) {
    let (group, queues) = ThreadGroup::new(name, kind, threads, policy);
    let carriers = queues
        .into_iter()
        .enumerate()
        .map(|(index, queues)| {
            Carrier::new(
                index,
                Arc::clone(&group),
                queues,
                TimerWheel::new(config.timer_wheel_slots, config.timer_tick()),
                Arc::clone(clock),
                Arc::clone(shared),
            )
        })
        .collect();
    (group, carriers)
}

/// Process-wide actor scheduler
///
/// Owns a CPU-bound group (priority quotas) and an I/O-bound group (plain
/// FIFO per carrier). Actors submitted before [`ActorScheduler::start`]
/// are queued and picked up once the carriers run.
pub struct ActorScheduler {
    config: SchedulerConfig,
    shared: Arc<SchedulerShared>,
    cpu: Arc<ThreadGroup>,
    io: Arc<ThreadGroup>,
    pending: Mutex<Vec<PendingGroup>>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    idle: IdleFactory,
    shutdown: Arc<AtomicBool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ActorScheduler {
    /// Create a scheduler on the system clock
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a scheduler whose timers follow `clock`
    pub fn with_clock(
        config: SchedulerConfig,
        clock: Arc<dyn ActorClock>,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let shared = Arc::new(SchedulerShared::new());

        let (cpu, cpu_carriers) = build_group(
            "cpu",
            ThreadGroupKind::CpuBound,
            config.cpu_threads,
            SelectionPolicy::Quotas(config.priority_quotas),
            &config,
            &clock,
            &shared,
        );
        let (io, io_carriers) = build_group(
            "io",
            ThreadGroupKind::IoBound,
            config.io_threads,
            SelectionPolicy::Simple,
            &config,
            &clock,
            &shared,
        );

        let pending = vec![
            PendingGroup {
                group: Arc::clone(&cpu),
                carriers: cpu_carriers,
            },
            PendingGroup {
                group: Arc::clone(&io),
                carriers: io_carriers,
            },
        ];

        let idle_config = config.idle.clone();
        Ok(Self {
            config,
            shared,
            cpu,
            io,
            pending: Mutex::new(pending),
            handles: Mutex::new(Vec::new()),
            idle: Box::new(move || idle::from_config(&idle_config)),
            shutdown: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Replace the configured idle strategy; `factory` runs once per
    /// carrier thread in [`ActorScheduler::start`]
    pub fn with_idle_strategy<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn IdleStrategy> + Send + Sync + 'static,
    {
        self.idle = Box::new(factory);
        self
    }

    /// Spawn the carrier threads of both groups
    pub fn start(&self) -> SchedulerResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let pending = std::mem::take(&mut *self.pending.lock());
        for PendingGroup { group, carriers } in pending {
            let mut threads = Vec::with_capacity(carriers.len());
            for carrier in carriers {
                let name = format!(
                    "{}-{}-{}",
                    self.config.thread_name_prefix,
                    group.name(),
                    carrier.context().index()
                );
                let shutdown = Arc::clone(&self.shutdown);
                let idle = (self.idle)();
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || carrier.run_loop(shutdown, idle))
                    .map_err(|source| SchedulerError::ThreadSpawn {
                        name: name.clone(),
                        source,
                    })?;
                threads.push(handle.thread().clone());
                self.handles.lock().push((group.name().to_string(), handle));
            }
            tracing::debug!(
                group = %group.name(),
                carriers = threads.len(),
                "thread group started"
            );
            group.publish_threads(threads);
        }
        Ok(())
    }

    /// Submit an actor to the CPU-bound group at regular priority
    pub fn submit_actor<A: Actor>(&self, actor: A) -> SchedulerResult<ActorRef<A>> {
        self.submit_actor_with_hints(actor, SchedulingHints::default())
    }

    /// Submit an actor to the group and priority class named by `hints`
    pub fn submit_actor_with_hints<A: Actor>(
        &self,
        actor: A,
        hints: SchedulingHints,
    ) -> SchedulerResult<ActorRef<A>> {
        let group = match hints.group {
            ThreadGroupKind::CpuBound => &self.cpu,
            ThreadGroupKind::IoBound => &self.io,
        };
        self.shared.spawn(actor, hints, group)
    }

    /// Stop accepting actors, let the carriers drain and join them
    ///
    /// Actors still alive once every carrier exited are torn down and
    /// their pending futures fail with `ActorError::Closed`. Fails with
    /// [`SchedulerError::ShutdownTimeout`] if a group does not finish
    /// within the configured timeout; its threads are detached.
    pub fn stop(&self) -> SchedulerResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.close_submissions();
        self.shutdown.store(true, Ordering::Release);
        self.cpu.unpark_all();
        self.io.unpark_all();

        let timeout = self.config.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut unfinished = None;
        for (group, handle) in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if !handle.is_finished() {
                unfinished.get_or_insert(group);
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(group = %group, "carrier thread panicked");
            }
        }

        if let Some(group) = unfinished {
            tracing::warn!(group = %group, ?timeout, "carrier threads did not stop in time");
            return Err(SchedulerError::ShutdownTimeout { group, timeout });
        }

        let aborted = self.shared.abort_all();
        self.cpu.clear();
        self.io.clear();
        tracing::debug!(aborted, "scheduler stopped");
        Ok(())
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats(self.cpu.steals() + self.io.steals())
    }

    /// Whether `start` was called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Configuration the scheduler was built with
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl std::fmt::Debug for ActorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorScheduler")
            .field("cpu", &self.cpu)
            .field("io", &self.io)
            .field("started", &self.is_started())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            tracing::warn!(%error, "scheduler did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorPriority;

    struct Idle;
    impl Actor for Idle {}

    fn small_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_cpu_threads(2)
            .with_io_threads(1)
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    /// Counts its callbacks and parks briefly when idle
    struct CountingIdle {
        idle: Arc<AtomicU64>,
        executed: Arc<AtomicU64>,
    }

    impl IdleStrategy for CountingIdle {
        fn on_idle(&mut self) {
            self.idle.fetch_add(1, Ordering::SeqCst);
            thread::park_timeout(Duration::from_millis(1));
        }

        fn on_task_executed(&mut self) {
            self.executed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_custom_idle_strategy_drives_carriers() {
        let built = Arc::new(AtomicU64::new(0));
        let idle = Arc::new(AtomicU64::new(0));
        let executed = Arc::new(AtomicU64::new(0));

        let (b, i, e) = (built.clone(), idle.clone(), executed.clone());
        let scheduler = ActorScheduler::new(small_config())
            .unwrap()
            .with_idle_strategy(move || {
                b.fetch_add(1, Ordering::SeqCst);
                Box::new(CountingIdle {
                    idle: i.clone(),
                    executed: e.clone(),
                })
            });
        scheduler.start().unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 3);

        let actor = scheduler.submit_actor(Idle).unwrap();
        actor.call(|_, _| ()).join().unwrap();
        actor.close().join().unwrap();
        scheduler.stop().unwrap();

        assert!(executed.load(Ordering::SeqCst) > 0);
        assert!(idle.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ActorScheduler::new(SchedulerConfig::default().with_io_threads(0));
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn test_start_twice_fails() {
        let scheduler = ActorScheduler::new(small_config()).unwrap();
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStarted)));
        scheduler.stop().unwrap();
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let scheduler = ActorScheduler::new(small_config()).unwrap();
        scheduler.start().unwrap();
        scheduler.stop().unwrap();
        assert!(matches!(scheduler.submit_actor(Idle), Err(SchedulerError::Stopped)));
        assert!(matches!(scheduler.start(), Err(SchedulerError::Stopped)));
    }

    #[test]
    fn test_stop_aborts_live_actors() {
        let scheduler = ActorScheduler::new(small_config()).unwrap();
        scheduler.start().unwrap();
        let actor = scheduler
            .submit_actor_with_hints(Idle, SchedulingHints::cpu_bound(ActorPriority::Low))
            .unwrap();
        actor.on_started().join().unwrap();

        scheduler.stop().unwrap();
        assert_eq!(actor.on_closed().join(), Err(crate::error::ActorError::Closed));

        let stats = scheduler.stats();
        assert_eq!(stats.actors_submitted, 1);
        assert_eq!(stats.actors_terminated, 1);
        assert_eq!(stats.active_actors, 0);
    }

    #[test]
    fn test_registry_counts() {
        let shared = SchedulerShared::new();
        let (group, _queues) =
            ThreadGroup::new("test", ThreadGroupKind::CpuBound, 1, SelectionPolicy::Simple);
        let a = shared.spawn(Idle, SchedulingHints::default(), &group).unwrap();
        let b = shared.spawn(Idle, SchedulingHints::default(), &group).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(shared.stats(0).active_actors, 2);

        shared.record_terminated(a.id());
        shared.record_terminated(a.id());
        let stats = shared.stats(0);
        assert_eq!(stats.actors_terminated, 1);
        assert_eq!(stats.active_actors, 1);

        shared.close_submissions();
        assert!(shared.spawn(Idle, SchedulingHints::default(), &group).is_err());
        assert_eq!(shared.abort_all(), 1);
    }
}
