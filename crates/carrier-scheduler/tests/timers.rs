//! Timer behaviour under a controlled clock

use carrier_scheduler::{
    Actor, ActorControl, ActorPhase, ActorScheduler, ControlledActorScheduler, ControlledClock,
    SchedulerConfig, ScheduledTimer,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Schedules one delayed job per configured delay and records when each ran
struct Delays {
    delays: Vec<u64>,
    fired: Vec<(u64, Duration)>,
}

impl Actor for Delays {
    fn on_actor_started(&mut self, ctl: &mut ActorControl<'_, Self>) {
        for delay in self.delays.clone() {
            ctl.run_delayed(ms(delay), move |actor, ctl| {
                actor.fired.push((delay, ctl.now()));
            });
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_delayed_jobs_fire_at_their_deadline(delays in prop::collection::vec(1u64..600, 1..24)) {
        let clock = Arc::new(ControlledClock::new());
        let scheduler = ControlledActorScheduler::new(Arc::clone(&clock));
        let actor = scheduler
            .submit_actor(Delays { delays: delays.clone(), fired: Vec::new() })
            .unwrap();
        scheduler.work_until_done();

        let horizon = *delays.iter().max().unwrap();
        for _ in 0..horizon {
            clock.advance(ms(1));
            scheduler.work_until_done();
        }

        let fired = actor.call(|a, _| a.fired.clone());
        scheduler.work_until_done();
        let fired = fired.join().unwrap();

        prop_assert_eq!(fired.len(), delays.len());
        for (delay, at) in &fired {
            // Never early, and with 1ms steps never late either
            prop_assert_eq!(*at, ms(*delay));
        }
        let order: Vec<u64> = fired.iter().map(|(d, _)| *d).collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        prop_assert_eq!(&order, &sorted);
    }

    #[test]
    fn prop_large_clock_jump_fires_everything_once(
        delays in prop::collection::vec(1u64..5_000, 1..16),
        jump in 5_000u64..20_000,
    ) {
        let clock = Arc::new(ControlledClock::new());
        let scheduler = ControlledActorScheduler::new(Arc::clone(&clock));
        let actor = scheduler
            .submit_actor(Delays { delays: delays.clone(), fired: Vec::new() })
            .unwrap();
        scheduler.work_until_done();

        clock.advance(ms(jump));
        scheduler.work_until_done();
        clock.advance(ms(jump));
        scheduler.work_until_done();

        let fired = actor.call(|a, _| a.fired.clone());
        scheduler.work_until_done();
        let fired = fired.join().unwrap();
        prop_assert_eq!(fired.len(), delays.len());
        for (_, at) in &fired {
            prop_assert_eq!(*at, ms(jump));
        }
    }
}

/// Recurring timer that stops itself after five firings
#[derive(Default)]
struct Ticker {
    timer: Option<ScheduledTimer>,
    fired_at: Arc<Mutex<Vec<Duration>>>,
}

impl Actor for Ticker {
    fn on_actor_started(&mut self, ctl: &mut ActorControl<'_, Self>) {
        let timer = ctl.run_at_fixed_rate(ms(10), |ticker, ctl| {
            let fired = {
                let mut fired_at = ticker.fired_at.lock();
                fired_at.push(ctl.now());
                fired_at.len()
            };
            if fired == 5 {
                if let Some(timer) = ticker.timer.take() {
                    ctl.cancel_timer(&timer);
                }
                ctl.close();
            }
        });
        self.timer = Some(timer);
    }
}

#[test]
fn test_recurring_timer_cancelled_from_its_callback() {
    let clock = Arc::new(ControlledClock::new());
    let scheduler = ControlledActorScheduler::new(Arc::clone(&clock));
    let fired_at = Arc::new(Mutex::new(Vec::new()));
    let actor = scheduler
        .submit_actor(Ticker {
            timer: None,
            fired_at: Arc::clone(&fired_at),
        })
        .unwrap();
    scheduler.work_until_done();

    for _ in 0..10 {
        clock.advance(ms(10));
        scheduler.work_until_done();
    }

    assert_eq!(actor.phase(), ActorPhase::Closed);
    assert_eq!(actor.on_closed().join(), Ok(()));
    assert_eq!(*fired_at.lock(), vec![ms(10), ms(20), ms(30), ms(40), ms(50)]);
}

#[test]
fn test_recurring_timer_rearms_from_firing_time() {
    let clock = Arc::new(ControlledClock::new());
    let scheduler = ControlledActorScheduler::new(Arc::clone(&clock));
    let fired_at = Arc::new(Mutex::new(Vec::new()));
    let actor = scheduler
        .submit_actor(Ticker {
            timer: None,
            fired_at: Arc::clone(&fired_at),
        })
        .unwrap();
    scheduler.work_until_done();

    // A late carrier records the late firing; the next one is a period after it
    clock.advance(ms(15));
    scheduler.work_until_done();
    clock.advance(ms(9));
    scheduler.work_until_done();
    assert_eq!(*fired_at.lock(), vec![ms(15)]);
    clock.advance(ms(1));
    scheduler.work_until_done();
    assert_eq!(*fired_at.lock(), vec![ms(15), ms(25)]);

    actor.close();
    scheduler.work_until_done();
    assert_eq!(actor.phase(), ActorPhase::Closed);
}

/// Delayed job plus a handle the test cancels from outside
#[derive(Default)]
struct Cancellable {
    timer: Option<ScheduledTimer>,
    ran: bool,
}

impl Actor for Cancellable {
    fn on_actor_started(&mut self, ctl: &mut ActorControl<'_, Self>) {
        self.timer = Some(ctl.run_delayed(ms(50), |actor, _| actor.ran = true));
    }
}

#[test]
fn test_timer_cancelled_from_outside_never_fires() {
    let clock = Arc::new(ControlledClock::new());
    let scheduler = ControlledActorScheduler::new(Arc::clone(&clock));
    let actor = scheduler.submit_actor(Cancellable::default()).unwrap();
    scheduler.work_until_done();

    let timer = actor.call(|a, _| a.timer.clone());
    scheduler.work_until_done();
    let timer = timer.join().unwrap().unwrap();
    assert!(!timer.is_recurring());
    assert_eq!(timer.delay(), ms(50));

    timer.cancel();
    assert!(timer.is_cancelled());
    clock.advance(ms(100));
    scheduler.work_until_done();

    let ran = actor.call(|a, _| a.ran);
    scheduler.work_until_done();
    assert_eq!(ran.join(), Ok(false));
}

#[test]
fn test_timer_fires_on_threaded_scheduler() {
    let clock = Arc::new(ControlledClock::new());
    let config = SchedulerConfig::default().with_cpu_threads(2).with_io_threads(1);
    let scheduler = ActorScheduler::with_clock(config, clock.clone()).unwrap();
    scheduler.start().unwrap();

    let actor = scheduler.submit_actor(Cancellable::default()).unwrap();
    actor.on_started().join().unwrap();
    // The timer is armed by the started hook, before anything else runs
    actor.call(|_, _| ()).join().unwrap();

    clock.advance(ms(50));
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if actor.call(|a, _| a.ran).join() == Ok(true) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "timer never fired");
        std::thread::sleep(ms(1));
    }

    actor.close().join().unwrap();
    scheduler.stop().unwrap();
}

/// Two timers sharing a deadline; the first cancels the second
#[derive(Default)]
struct Racing {
    second: Option<ScheduledTimer>,
    log: Vec<u32>,
}

impl Actor for Racing {
    fn on_actor_started(&mut self, ctl: &mut ActorControl<'_, Self>) {
        ctl.run_delayed(ms(10), |racing, ctl| {
            racing.log.push(1);
            if let Some(second) = racing.second.take() {
                ctl.cancel_timer(&second);
            }
        });
        self.second = Some(ctl.run_delayed(ms(10), |racing, _| racing.log.push(2)));
    }
}

#[test]
fn test_timer_cancelled_after_firing_skips_its_callback() {
    let clock = Arc::new(ControlledClock::new());
    let scheduler = ControlledActorScheduler::new(Arc::clone(&clock));
    let actor = scheduler.submit_actor(Racing::default()).unwrap();
    scheduler.work_until_done();

    clock.advance(ms(10));
    scheduler.work_until_done();
    clock.advance(ms(10));
    scheduler.work_until_done();

    let log = actor.call(|racing, _| racing.log.clone());
    scheduler.work_until_done();
    assert_eq!(log.join(), Ok(vec![1]));
}
