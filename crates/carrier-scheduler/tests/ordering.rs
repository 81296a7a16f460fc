//! Job ordering and exclusivity on real carrier threads

use carrier_scheduler::{
    Actor, ActorPriority, ActorScheduler, ControlledActorScheduler, ControlledClock,
    SchedulerConfig, SchedulingHints,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn threaded(cpu: usize, io: usize) -> ActorScheduler {
    let config = SchedulerConfig::default()
        .with_cpu_threads(cpu)
        .with_io_threads(io)
        .with_shutdown_timeout(Duration::from_secs(10));
    let scheduler = ActorScheduler::new(config).unwrap();
    scheduler.start().unwrap();
    scheduler
}

#[derive(Default)]
struct Log {
    entries: Vec<u32>,
}

impl Actor for Log {}

#[test]
fn test_external_jobs_run_in_submission_order() {
    let scheduler = threaded(4, 1);
    let actor = scheduler.submit_actor(Log::default()).unwrap();

    for i in 0..1_000 {
        actor.run(move |log, _| log.entries.push(i));
    }
    let entries = actor.call(|log, _| log.entries.clone()).join().unwrap();
    assert_eq!(entries, (0..1_000).collect::<Vec<_>>());

    actor.close().join().unwrap();
    scheduler.stop().unwrap();
}

#[test]
fn test_fast_lane_runs_before_external_jobs() {
    let scheduler = ControlledActorScheduler::new(Arc::new(ControlledClock::new()));
    let actor = scheduler.submit_actor(Log::default()).unwrap();

    actor.run(|log, ctl| {
        log.entries.push(1);
        ctl.submit(|log, _| log.entries.push(5));
        ctl.run(|log, ctl| {
            log.entries.push(2);
            ctl.run(|log, _| log.entries.push(3));
        });
    });
    actor.run(|log, _| log.entries.push(4));
    let entries = actor.call(|log, _| log.entries.clone());
    scheduler.work_until_done();

    // The job submitted from inside lands behind the call already queued
    assert_eq!(entries.join(), Ok(vec![1, 2, 3, 4]));
    let entries = actor.call(|log, _| log.entries.clone());
    scheduler.work_until_done();
    assert_eq!(entries.join(), Ok(vec![1, 2, 3, 4, 5]));
}

/// Counts how many of its jobs are executing at once
struct Exclusive {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    runs: u64,
}

impl Exclusive {
    fn enter(&mut self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::yield_now();
        self.runs += 1;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Actor for Exclusive {}

#[test]
fn test_one_job_at_a_time_per_actor() {
    let scheduler = threaded(4, 2);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let actor = scheduler
        .submit_actor(Exclusive {
            in_flight: Arc::clone(&in_flight),
            max_in_flight: Arc::clone(&max_in_flight),
            runs: 0,
        })
        .unwrap();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let actor = actor.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    actor.run(|a, _| a.enter());
                    if i % 50 == 0 {
                        actor.run(|_, ctl| ctl.yield_thread());
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let runs = actor.call(|a, _| a.runs).join().unwrap();
    assert_eq!(runs, 2_000);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);

    actor.close().join().unwrap();
    scheduler.stop().unwrap();
}

/// Actor bouncing work to itself so turns keep moving between carriers
#[derive(Default)]
struct Worker {
    done: u64,
}

impl Actor for Worker {}

#[test]
fn test_many_actors_across_carriers_lose_no_jobs() {
    let scheduler = threaded(4, 2);
    let mut actors = Vec::new();
    for i in 0..32 {
        let hints = match i % 4 {
            0 => SchedulingHints::cpu_bound(ActorPriority::High),
            1 => SchedulingHints::cpu_bound(ActorPriority::Regular),
            2 => SchedulingHints::cpu_bound(ActorPriority::Low),
            _ => SchedulingHints::io_bound(),
        };
        actors.push(scheduler.submit_actor_with_hints(Worker::default(), hints).unwrap());
    }

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let actors = actors.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    for actor in &actors {
                        actor.run(|w, ctl| {
                            w.done += 1;
                            if w.done % 16 == 0 {
                                ctl.yield_thread();
                            }
                        });
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    for actor in &actors {
        assert_eq!(actor.call(|w, _| w.done).join(), Ok(1_000));
    }
    let closed: Vec<_> = actors.iter().map(|a| a.close()).collect();
    for future in closed {
        future.join().unwrap();
    }

    // Counters are final once every carrier joined
    scheduler.stop().unwrap();
    let stats = scheduler.stats();
    assert_eq!(stats.actors_submitted, 32);
    assert_eq!(stats.actors_terminated, 32);
    assert_eq!(stats.active_actors, 0);
    assert!(stats.turns_executed >= 32);
}

#[test]
fn test_turns_interleave_between_actors() {
    let scheduler = ControlledActorScheduler::new(Arc::new(ControlledClock::new()));
    let trace = Arc::new(Mutex::new(Vec::new()));

    #[derive(Default)]
    struct Looper {
        remaining: u32,
    }
    impl Actor for Looper {}

    let mut actors = Vec::new();
    for id in 0..2u32 {
        let actor = scheduler.submit_actor(Looper { remaining: 3 }).unwrap();
        let trace = Arc::clone(&trace);
        actor.run(move |_, ctl| {
            ctl.run_until_done(move |looper, ctl| {
                trace.lock().push(id);
                looper.remaining -= 1;
                if looper.remaining == 0 {
                    ctl.done();
                }
            });
        });
        actors.push(actor);
    }
    scheduler.work_until_done();

    // Each until-done run ends the turn, so the two actors alternate
    let trace = trace.lock().clone();
    assert_eq!(trace.len(), 6);
    for pair in trace.windows(2) {
        assert_ne!(pair[0], pair[1], "trace {:?}", trace);
    }
}
