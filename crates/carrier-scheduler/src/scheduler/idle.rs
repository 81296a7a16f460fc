//! What a carrier does when it finds no work

use crate::config::{IdleConfig, IdleStrategyKind};
use std::thread;
use std::time::Duration;

/// Swappable idle policy of a carrier thread
///
/// Parking must use `std::thread::park_timeout` (or return quickly):
/// submissions unpark the target carrier.
pub trait IdleStrategy: Send {
    /// Called after a loop iteration that found nothing to run
    fn on_idle(&mut self);

    /// Called after a loop iteration that ran a task
    fn on_task_executed(&mut self);
}

/// Spin, then yield, then park with exponentially growing timeouts
#[derive(Debug, Clone)]
pub struct BackoffIdleStrategy {
    max_spins: u32,
    max_yields: u32,
    min_park: Duration,
    max_park: Duration,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl BackoffIdleStrategy {
    /// Create a strategy from explicit bounds
    pub fn new(max_spins: u32, max_yields: u32, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }

    /// Timeout the next park would use
    pub fn next_park(&self) -> Duration {
        self.park
    }
}

impl Default for BackoffIdleStrategy {
    fn default() -> Self {
        let config = IdleConfig::default();
        Self::new(config.max_spins, config.max_yields, config.min_park(), config.max_park())
    }
}

impl IdleStrategy for BackoffIdleStrategy {
    fn on_idle(&mut self) {
        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < self.max_yields {
            self.yields += 1;
            thread::yield_now();
        } else {
            thread::park_timeout(self.park);
            self.park = (self.park * 2).min(self.max_park);
        }
    }

    fn on_task_executed(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}

/// Never gives up the core
#[derive(Debug, Clone, Copy, Default)]
pub struct BusySpinIdleStrategy;

impl IdleStrategy for BusySpinIdleStrategy {
    fn on_idle(&mut self) {
        std::hint::spin_loop();
    }

    fn on_task_executed(&mut self) {}
}

/// Build the configured strategy for one carrier
pub(crate) fn from_config(config: &IdleConfig) -> Box<dyn IdleStrategy> {
    match config.strategy {
        IdleStrategyKind::Backoff => Box::new(BackoffIdleStrategy::new(
            config.max_spins,
            config.max_yields,
            config.min_park(),
            config.max_park(),
        )),
        IdleStrategyKind::BusySpin => Box::new(BusySpinIdleStrategy),
    }
}
