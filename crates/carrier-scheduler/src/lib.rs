//! Carrier Actor Scheduler
//!
//! Cooperative scheduling of many lightweight actors onto a small, fixed
//! set of OS threads:
//! - Actors run as sequences of short jobs; at most one job of an actor
//!   executes at a time, without locks in actor code
//! - Carrier threads grouped by workload (CPU-bound with priority quotas,
//!   I/O-bound) steal work from each other when idle
//! - Per-carrier timer wheels, conditions, channels and futures wake
//!   waiting actors without blocking a thread
//! - A deterministic single-threaded scheduler with a controllable clock
//!   for tests
//!
//! ```ignore
//! let scheduler = ActorScheduler::new(SchedulerConfig::default())?;
//! scheduler.start()?;
//! let counter = scheduler.submit_actor(Counter::default())?;
//! let value = counter.call(|c, _| { c.value += 1; c.value }).join()?;
//! counter.close().join()?;
//! scheduler.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod actor;
pub mod channel;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod future;
pub mod scheduler;

pub use actor::{
    Actor, ActorId, ActorPhase, ActorPriority, PhaseMask, SchedulingHints, ThreadGroupKind,
};
pub use channel::{ConsumableChannel, MessageChannel};
pub use clock::{ActorClock, ControlledClock, SystemClock};
pub use config::{IdleConfig, IdleStrategyKind, PriorityQuotas, SchedulerConfig};
pub use control::{ActorControl, ActorRef};
pub use error::{ActorError, ActorResult, SchedulerError, SchedulerResult};
pub use future::ActorFuture;
pub use scheduler::{
    ActorCondition, ActorScheduler, ActorWaker, BackoffIdleStrategy, BusySpinIdleStrategy,
    ChannelSubscription, ControlledActorScheduler, IdleStrategy, ScheduledTimer, SchedulerStats,
};
