//! Actor scheduler: carrier threads, thread groups and the task lifecycle
//!
//! Two thread groups (CPU-bound with priority quotas, I/O-bound plain) each
//! run a fixed set of carrier threads. Every carrier owns a work queue per
//! priority class and a timer wheel, and steals from its siblings when it
//! runs dry.

pub(crate) mod carrier;
pub(crate) mod controlled;
pub(crate) mod group;
pub(crate) mod idle;
pub(crate) mod job;
pub(crate) mod queue;
#[allow(clippy::module_inception)]
pub(crate) mod scheduler;
pub(crate) mod subscription;
pub(crate) mod task;
pub(crate) mod timer;

pub use controlled::ControlledActorScheduler;
pub use idle::{BackoffIdleStrategy, BusySpinIdleStrategy, IdleStrategy};
pub use scheduler::{ActorScheduler, SchedulerStats};
pub use subscription::{ActorCondition, ChannelSubscription, ScheduledTimer};
pub use task::ActorWaker;
