//! Error types for the actor scheduler

use std::time::Duration;

/// Failure observed by whoever waits on an actor job or future.
///
/// Cloneable so that every waiter of one [`ActorFuture`](crate::ActorFuture)
/// can observe the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    /// The actor no longer accepts work
    #[error("actor is closed")]
    Closed,

    /// The actor failed; carries the triggering error message
    #[error("actor failed: {0}")]
    Failed(String),

    /// A job panicked while executing
    #[error("job panicked: {0}")]
    Panicked(String),

    /// A blocking wait did not complete in time
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Failure raised by user code
    #[error("{0}")]
    Other(String),
}

impl ActorError {
    /// Create a user-level failure from anything printable
    pub fn msg(message: impl std::fmt::Display) -> Self {
        ActorError::Other(message.to_string())
    }

    /// Build the error that teardown propagates to discarded jobs
    pub(crate) fn failed_by(cause: &ActorError) -> Self {
        match cause {
            ActorError::Failed(_) | ActorError::Closed => cause.clone(),
            other => ActorError::Failed(other.to_string()),
        }
    }

    /// Convert a panic payload into an error
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        ActorError::Panicked(message)
    }
}

/// Errors raised by the scheduler itself
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// `start` was called twice
    #[error("scheduler is already started")]
    AlreadyStarted,

    /// The scheduler has been stopped and accepts no more actors
    #[error("scheduler is stopped")]
    Stopped,

    /// A carrier thread could not be spawned
    #[error("failed to spawn carrier thread {name}: {source}")]
    ThreadSpawn {
        /// Name of the thread that failed to start
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A thread group did not terminate within the shutdown timeout
    #[error("thread group '{group}' did not terminate within {timeout:?}")]
    ShutdownTimeout {
        /// Group that is still running
        group: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Configuration failed validation
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("failed to parse scheduler configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result of a job or actor interaction
pub type ActorResult<T> = Result<T, ActorError>;

/// Result of a scheduler operation
pub type SchedulerResult<T> = Result<T, SchedulerError>;
