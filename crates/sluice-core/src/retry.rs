//! Retry policies for stage uploads and commit polling.
//!
//! Delays are measured with the tokio clock so paused-time tests can step
//! through them.

use crate::config::{CommitConfig, UploadConfig};
use std::time::Duration;
use tokio::time::Instant;

/// A bounded number of attempts separated by a constant delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedDelay {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.retry_delay_ms))
    }

    /// Delay before attempt `attempt` (1-based), or `None` once the attempts
    /// are used up.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        match attempt {
            0 | 1 => Some(Duration::ZERO),
            n if n <= self.max_attempts => Some(self.delay),
            _ => None,
        }
    }
}

/// Capped exponential backoff with a total time budget. No jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl ExponentialBackoff {
    pub fn from_config(config: &CommitConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            multiplier: if config.multiplier.is_finite() {
                config.multiplier.max(1.0)
            } else {
                1.0
            },
            max_interval: Duration::from_millis(config.max_interval_ms),
            max_elapsed: Duration::from_secs(config.max_elapsed_seconds),
        }
    }

    /// Start a new schedule; the budget is counted from now.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: self.initial_interval.min(self.max_interval),
            started: Instant::now(),
        }
    }
}

/// A running backoff schedule.
#[derive(Debug)]
pub struct Backoff {
    policy: ExponentialBackoff,
    next: Duration,
    started: Instant,
}

impl Backoff {
    /// The next delay, or `None` when waiting it would overrun the budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.next;
        if self.started.elapsed() + delay > self.policy.max_elapsed {
            return None;
        }
        let max = self.policy.max_interval;
        self.next = Duration::try_from_secs_f64(delay.as_secs_f64() * self.policy.multiplier)
            .map_or(max, |next| next.min(max));
        Some(delay)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_schedule() {
        let policy = FixedDelay::from_config(&UploadConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_before(1), Some(Duration::ZERO));
        assert_eq!(policy.delay_before(2), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_before(3), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_before(4), None);
    }

    #[test]
    fn test_fixed_delay_at_least_one_attempt() {
        let policy = FixedDelay::new(0, Duration::from_millis(5));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_before(2), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_schedule_is_capped() {
        let mut backoff = ExponentialBackoff::from_config(&CommitConfig::default()).start();
        let delays: Vec<_> = (0..6).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(10),
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_budget_exhausts() {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(400),
            max_elapsed: Duration::from_secs(1),
        };
        let mut backoff = policy.start();
        let mut waited = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            tokio::time::sleep(delay).await;
            waited += delay;
        }
        // 100 + 200 + 400 = 700; another 400 would overrun the budget
        assert_eq!(waited, Duration::from_millis(700));
        assert!(backoff.elapsed() <= Duration::from_secs(1));
    }

    #[test]
    fn test_non_finite_multiplier_is_clamped() {
        for multiplier in [f64::INFINITY, f64::NAN, f64::NEG_INFINITY] {
            let config = CommitConfig {
                multiplier,
                ..CommitConfig::default()
            };
            assert_eq!(ExponentialBackoff::from_config(&config).multiplier, 1.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_multiplier_caps_at_max_interval() {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(1),
            multiplier: f64::INFINITY,
            max_interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(600),
        };
        let mut backoff = policy.start();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));

        let mut backoff = ExponentialBackoff {
            multiplier: 1e300,
            ..policy
        }
        .start();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
