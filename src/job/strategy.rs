//! Acquisition pacing between executor cycles.

use rand::Rng;
use std::time::Duration;

/// What the next acquisition cycle should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfiguration {
    /// Idle time before the next cycle.
    pub wait_time: Duration,
    /// How many jobs the next cycle should try to acquire.
    pub num_jobs_to_acquire: usize,
}

/// Outcome of one acquisition cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquisitionReport {
    pub requested: usize,
    pub acquired: usize,
    pub failed_to_lock: usize,
}

/// Decides idle time and batch size from the history of acquisition
/// outcomes.
pub trait AcquisitionStrategy: Send {
    fn initial_configuration(&self) -> AcquisitionConfiguration;

    fn reconfigure(
        &mut self,
        report: &AcquisitionReport,
        current: &AcquisitionConfiguration,
    ) -> AcquisitionConfiguration;
}

/// Level-indexed exponential backoff.
///
/// The level rises by one whenever a cycle saw lock contention or came up
/// empty, and falls by one after `decrease_delay` consecutive fully
/// successful cycles. The wait for level `n > 0` is
/// `base_wait * factor^(n-1)` plus jitter; level 0 does not wait at all.
/// Batch size grows with contention so that competing workers spread over
/// more jobs.
pub struct BackoffStrategy {
    base_wait: Duration,
    factor: f64,
    max_level: u32,
    max_jitter: Duration,
    initial_batch: usize,
    max_batch: usize,
    decrease_delay: u32,
    level: u32,
    consecutive_successes: u32,
}

impl BackoffStrategy {
    pub fn new() -> Self {
        Self {
            base_wait: Duration::from_millis(50),
            factor: 2.0,
            max_level: 10,
            max_jitter: Duration::from_millis(25),
            initial_batch: 3,
            max_batch: 30,
            decrease_delay: 5,
            level: 0,
            consecutive_successes: 0,
        }
    }

    fn wait_time(&self) -> Duration {
        if self.level == 0 {
            return Duration::ZERO;
        }
        let scaled = self.base_wait.as_millis() as f64 * self.factor.powi(self.level as i32 - 1);
        let jitter = if self.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..self.max_jitter.as_millis() as u64)
        };
        Duration::from_millis(scaled as u64 + jitter)
    }

    fn batch_size(&self) -> usize {
        // one extra job per backoff level, so contended workers fan out
        (self.initial_batch + self.level as usize).min(self.max_batch)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionStrategy for BackoffStrategy {
    fn initial_configuration(&self) -> AcquisitionConfiguration {
        AcquisitionConfiguration {
            wait_time: Duration::ZERO,
            num_jobs_to_acquire: self.initial_batch,
        }
    }

    fn reconfigure(
        &mut self,
        report: &AcquisitionReport,
        _current: &AcquisitionConfiguration,
    ) -> AcquisitionConfiguration {
        if report.failed_to_lock > 0 || report.acquired == 0 {
            self.level = (self.level + 1).min(self.max_level);
            self.consecutive_successes = 0;
        } else if report.acquired >= report.requested {
            self.consecutive_successes += 1;
            if self.consecutive_successes >= self.decrease_delay {
                self.level = self.level.saturating_sub(1);
                self.consecutive_successes = 0;
            }
        } else {
            // partial batch without contention holds the level steady
            self.consecutive_successes = 0;
        }
        AcquisitionConfiguration {
            wait_time: self.wait_time(),
            num_jobs_to_acquire: self.batch_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffStrategy {
        let mut strategy = BackoffStrategy::new();
        strategy.max_jitter = Duration::ZERO;
        strategy
    }

    fn report(requested: usize, acquired: usize, failed_to_lock: usize) -> AcquisitionReport {
        AcquisitionReport {
            requested,
            acquired,
            failed_to_lock,
        }
    }

    #[test]
    fn test_empty_cycles_escalate_wait_exponentially() {
        let mut strategy = no_jitter();
        let mut config = strategy.initial_configuration();
        assert_eq!(config.wait_time, Duration::ZERO);

        let mut last = Duration::ZERO;
        for _ in 0..4 {
            config = strategy.reconfigure(&report(3, 0, 0), &config);
            assert!(config.wait_time > last);
            last = config.wait_time;
        }
        assert_eq!(last, Duration::from_millis(400));
    }

    #[test]
    fn test_contention_grows_batch_and_wait() {
        let mut strategy = no_jitter();
        let mut config = strategy.initial_configuration();
        config = strategy.reconfigure(&report(3, 2, 1), &config);
        assert_eq!(config.num_jobs_to_acquire, 4);
        assert_eq!(config.wait_time, Duration::from_millis(50));
    }

    #[test]
    fn test_sustained_success_recovers_to_no_wait() {
        let mut strategy = no_jitter();
        let mut config = strategy.initial_configuration();
        config = strategy.reconfigure(&report(3, 0, 0), &config);
        assert!(config.wait_time > Duration::ZERO);

        for _ in 0..5 {
            config = strategy.reconfigure(&report(4, 4, 0), &config);
        }
        assert_eq!(config.wait_time, Duration::ZERO);
        assert_eq!(config.num_jobs_to_acquire, 3);
    }

    #[test]
    fn test_level_is_capped() {
        let mut strategy = no_jitter();
        let mut config = strategy.initial_configuration();
        for _ in 0..50 {
            config = strategy.reconfigure(&report(3, 0, 0), &config);
        }
        assert_eq!(strategy.level, 10);
        assert_eq!(config.wait_time, Duration::from_millis(50 * 512));
        assert_eq!(config.num_jobs_to_acquire, 13);
    }
}
