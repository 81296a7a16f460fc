//! Scheduler configuration
//!
//! A [`SchedulerConfig`] is built once at startup and handed to the
//! scheduler constructor. It can be assembled in code with the `with_*`
//! methods or loaded from TOML:
//!
//! ```toml
//! cpu_threads = 4
//! io_threads = 2
//! shutdown_timeout_ms = 5000
//!
//! [priority_quotas]
//! high = 60
//! regular = 30
//! low = 10
//!
//! [idle]
//! strategy = "backoff"
//! max_park_us = 500
//! ```

use crate::actor::ActorPriority;
use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Share of CPU-group scheduling turns targeted at each priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityQuotas {
    /// Weight of [`ActorPriority::High`]
    pub high: u32,
    /// Weight of [`ActorPriority::Regular`]
    pub regular: u32,
    /// Weight of [`ActorPriority::Low`]
    pub low: u32,
}

impl PriorityQuotas {
    /// Weight configured for a priority class
    pub fn weight(&self, priority: ActorPriority) -> u32 {
        match priority {
            ActorPriority::High => self.high,
            ActorPriority::Regular => self.regular,
            ActorPriority::Low => self.low,
        }
    }

    /// Sum of all weights
    pub fn total(&self) -> u32 {
        self.high + self.regular + self.low
    }
}

impl Default for PriorityQuotas {
    fn default() -> Self {
        Self {
            high: 60,
            regular: 30,
            low: 10,
        }
    }
}

/// Which idle strategy carrier threads use when they find no work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleStrategyKind {
    /// Spin, then yield, then park with growing timeouts
    Backoff,
    /// Spin forever (lowest latency, burns a core)
    BusySpin,
}

/// Idle strategy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Strategy to instantiate per carrier thread
    pub strategy: IdleStrategyKind,
    /// Spin iterations before yielding
    pub max_spins: u32,
    /// Yields before parking
    pub max_yields: u32,
    /// First park timeout in microseconds
    pub min_park_us: u64,
    /// Upper bound of the park timeout in microseconds
    pub max_park_us: u64,
}

impl IdleConfig {
    /// First park timeout
    pub fn min_park(&self) -> Duration {
        Duration::from_micros(self.min_park_us)
    }

    /// Longest park timeout
    pub fn max_park(&self) -> Duration {
        Duration::from_micros(self.max_park_us)
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            strategy: IdleStrategyKind::Backoff,
            max_spins: 100,
            max_yields: 10,
            min_park_us: 1,
            max_park_us: 1_000,
        }
    }
}

/// Process-wide scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Carrier threads in the CPU-bound group
    pub cpu_threads: usize,
    /// Carrier threads in the I/O-bound group
    pub io_threads: usize,
    /// Turn quotas per priority class in the CPU-bound group
    pub priority_quotas: PriorityQuotas,
    /// Idle strategy settings
    pub idle: IdleConfig,
    /// Bounded wait for carrier threads to terminate on stop
    pub shutdown_timeout_ms: u64,
    /// Slots per timer wheel (power of two)
    pub timer_wheel_slots: usize,
    /// Timer wheel resolution in milliseconds
    pub timer_tick_ms: u64,
    /// Prefix of carrier thread names
    pub thread_name_prefix: String,
}

impl SchedulerConfig {
    /// Parse a configuration from TOML, then validate it
    pub fn from_toml_str(source: &str) -> SchedulerResult<Self> {
        let config: SchedulerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the scheduler cannot run with
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.cpu_threads == 0 {
            return Err(SchedulerError::InvalidConfig(
                "cpu_threads must be greater than zero".into(),
            ));
        }
        if self.io_threads == 0 {
            return Err(SchedulerError::InvalidConfig(
                "io_threads must be greater than zero".into(),
            ));
        }
        if self.priority_quotas.total() == 0 {
            return Err(SchedulerError::InvalidConfig(
                "priority quotas must not all be zero".into(),
            ));
        }
        if !self.timer_wheel_slots.is_power_of_two() {
            return Err(SchedulerError::InvalidConfig(format!(
                "timer_wheel_slots must be a power of two, got {}",
                self.timer_wheel_slots
            )));
        }
        if self.timer_tick_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "timer_tick_ms must be greater than zero".into(),
            ));
        }
        if self.idle.min_park_us > self.idle.max_park_us {
            return Err(SchedulerError::InvalidConfig(
                "idle.min_park_us must not exceed idle.max_park_us".into(),
            ));
        }
        Ok(())
    }

    /// Shutdown timeout as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Timer wheel resolution as a duration
    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }

    /// Set the CPU-bound group size
    pub fn with_cpu_threads(mut self, threads: usize) -> Self {
        self.cpu_threads = threads;
        self
    }

    /// Set the I/O-bound group size
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set the priority quotas
    pub fn with_priority_quotas(mut self, quotas: PriorityQuotas) -> Self {
        self.priority_quotas = quotas;
        self
    }

    /// Set the idle strategy settings
    pub fn with_idle(mut self, idle: IdleConfig) -> Self {
        self.idle = idle;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_threads: num_cpus::get().max(1),
            io_threads: 2,
            priority_quotas: PriorityQuotas::default(),
            idle: IdleConfig::default(),
            shutdown_timeout_ms: 10_000,
            timer_wheel_slots: 512,
            timer_tick_ms: 1,
            thread_name_prefix: "carrier".to_string(),
        }
    }
}
