//! The actor contract and its scheduling vocabulary

use crate::control::ActorControl;
use crate::error::ActorError;

/// Unique identifier of a submitted actor
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    /// Create an ActorId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        ActorId(id)
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle phase of an actor
///
/// Phases only move forward, in declaration order, except that `Failed`
/// can be entered from any phase and is absorbing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ActorPhase {
    /// Running the starting hook
    Starting = 0,
    /// Steady state, serving submitted jobs and subscriptions
    Started = 1,
    /// Close was requested, not yet observed by the task
    CloseRequested = 2,
    /// Running the closing hook
    Closing = 3,
    /// Closed hook ran, task is torn down
    Closed = 4,
    /// Aborted by an error
    Failed = 5,
}

impl ActorPhase {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ActorPhase::Starting,
            1 => ActorPhase::Started,
            2 => ActorPhase::CloseRequested,
            3 => ActorPhase::Closing,
            4 => ActorPhase::Closed,
            _ => ActorPhase::Failed,
        }
    }

    /// Whether the phase is absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, ActorPhase::Closed | ActorPhase::Failed)
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of phases in which a subscription may fire
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhaseMask(u8);

impl PhaseMask {
    /// Only the steady state
    pub const STARTED: PhaseMask = PhaseMask(1 << ActorPhase::Started as u8);

    /// Steady state and the whole close sequence before `Closed`
    pub const UNTIL_CLOSED: PhaseMask = PhaseMask(
        (1 << ActorPhase::Started as u8)
            | (1 << ActorPhase::CloseRequested as u8)
            | (1 << ActorPhase::Closing as u8),
    );

    /// Mask containing a single phase
    pub fn of(phase: ActorPhase) -> Self {
        PhaseMask(phase.bit())
    }

    /// Union of two masks
    pub fn with(self, phase: ActorPhase) -> Self {
        PhaseMask(self.0 | phase.bit())
    }

    /// Whether `phase` is in the mask
    pub fn contains(self, phase: ActorPhase) -> bool {
        self.0 & phase.bit() != 0
    }
}

/// Scheduling class inside the CPU-bound thread group
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ActorPriority {
    /// Latency-sensitive actors
    High,
    /// Default class
    #[default]
    Regular,
    /// Background actors
    Low,
}

impl ActorPriority {
    /// All classes, highest first
    pub const ALL: [ActorPriority; 3] = [
        ActorPriority::High,
        ActorPriority::Regular,
        ActorPriority::Low,
    ];

    /// Position in [`ActorPriority::ALL`]
    pub fn index(self) -> usize {
        match self {
            ActorPriority::High => 0,
            ActorPriority::Regular => 1,
            ActorPriority::Low => 2,
        }
    }
}

/// Which thread group runs an actor
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ThreadGroupKind {
    /// Computation heavy actors, scheduled with priority quotas
    #[default]
    CpuBound,
    /// Actors that mostly wait on blocking I/O
    IoBound,
}

/// Placement hints given when submitting an actor
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SchedulingHints {
    /// Thread group
    pub group: ThreadGroupKind,
    /// Priority class (ignored by the I/O-bound group)
    pub priority: ActorPriority,
}

impl SchedulingHints {
    /// CPU-bound with the given priority
    pub fn cpu_bound(priority: ActorPriority) -> Self {
        Self {
            group: ThreadGroupKind::CpuBound,
            priority,
        }
    }

    /// I/O-bound
    pub fn io_bound() -> Self {
        Self {
            group: ThreadGroupKind::IoBound,
            priority: ActorPriority::Regular,
        }
    }
}

/// A unit of sequential logic driven by the scheduler
///
/// Every hook runs as a job on a carrier thread; at most one job of an
/// actor executes at any instant. The control handle passed to each hook
/// schedules further work for the same actor.
pub trait Actor: Send + Sized + 'static {
    /// Name used in logs
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// First job of the actor
    fn on_actor_starting(&mut self, _ctl: &mut ActorControl<'_, Self>) {}

    /// Runs once the starting phase drained
    fn on_actor_started(&mut self, _ctl: &mut ActorControl<'_, Self>) {}

    /// Runs when a close request is observed
    fn on_actor_close_requested(&mut self, _ctl: &mut ActorControl<'_, Self>) {}

    /// Runs after the close-requested phase drained
    fn on_actor_closing(&mut self, _ctl: &mut ActorControl<'_, Self>) {}

    /// Last job of the actor
    fn on_actor_closed(&mut self, _ctl: &mut ActorControl<'_, Self>) {}

    /// Cleanup after the actor entered `Failed`
    fn on_actor_failed(&mut self, _error: &ActorError) {}

    /// A job failed in `Started`; the actor keeps running
    fn handle_failure(&mut self, error: &ActorError) {
        tracing::warn!(actor = %self.name(), %error, "uncaught failure in actor job");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert!(ActorPhase::Starting < ActorPhase::Started);
        assert!(ActorPhase::Started < ActorPhase::CloseRequested);
        assert!(ActorPhase::CloseRequested < ActorPhase::Closing);
        assert!(ActorPhase::Closing < ActorPhase::Closed);
        for phase in [
            ActorPhase::Starting,
            ActorPhase::Started,
            ActorPhase::CloseRequested,
            ActorPhase::Closing,
            ActorPhase::Closed,
            ActorPhase::Failed,
        ] {
            assert_eq!(ActorPhase::from_u8(phase as u8), phase);
        }
    }

    #[test]
    fn test_phase_masks() {
        assert!(PhaseMask::STARTED.contains(ActorPhase::Started));
        assert!(!PhaseMask::STARTED.contains(ActorPhase::Closing));

        assert!(PhaseMask::UNTIL_CLOSED.contains(ActorPhase::Closing));
        assert!(!PhaseMask::UNTIL_CLOSED.contains(ActorPhase::Closed));

        let mask = PhaseMask::of(ActorPhase::Starting).with(ActorPhase::Started);
        assert!(mask.contains(ActorPhase::Starting));
        assert!(mask.contains(ActorPhase::Started));
        assert!(!mask.contains(ActorPhase::Failed));
    }

    #[test]
    fn test_default_name_strips_path() {
        struct Counter;
        impl Actor for Counter {}
        assert_eq!(Counter.name(), "Counter");
    }

    #[test]
    fn test_priority_index() {
        for (i, p) in ActorPriority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
        assert_eq!(SchedulingHints::default().priority, ActorPriority::Regular);
        assert_eq!(SchedulingHints::io_bound().group, ThreadGroupKind::IoBound);
    }
}
