//! Reconnection Policy
//!
//! Exponential backoff for the upstream socket with a windowed cooldown.
//!
//! Every connection failure increments the retry counter and yields
//! `min(base · 2^retries, max_delay)`. When more than `max_retries` failures
//! fall inside the trailing `retry_window`, the policy yields the longer
//! `cooldown` instead and forgets the window, so the exponential schedule
//! resumes afterwards. A successful connect resets the retry counter but not
//! the failure window: a connection that flaps still trips the cooldown.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay unit; retry `r` waits `base_delay · 2^r`.
    pub base_delay: Duration,
    /// Upper bound of the exponential delay.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay (0.0 disables it).
    pub jitter_factor: f64,
    /// Failures tolerated inside `retry_window` before cooling down.
    pub max_retries: u32,
    /// Trailing window failures are counted in.
    pub retry_window: Duration,
    /// Fixed wait once the window overflows.
    pub cooldown: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            max_retries: 5,
            retry_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(120),
        }
    }
}

/// Next wait chosen by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Regular exponential step.
    Exponential {
        /// Retry number this delay belongs to (1-based).
        retry: u32,
        /// Wait before reconnecting.
        delay: Duration,
    },
    /// Too many failures in the window.
    Cooldown {
        /// Failures counted in the window.
        failures: usize,
        /// Wait before reconnecting.
        delay: Duration,
    },
}

impl Backoff {
    /// Wait before the next connection attempt.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        match self {
            Self::Exponential { delay, .. } | Self::Cooldown { delay, .. } => *delay,
        }
    }
}

/// Reconnection policy state.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    retries: u32,
    failures: VecDeque<Instant>,
}

impl ReconnectPolicy {
    /// Create a policy with no recorded failures.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            retries: 0,
            failures: VecDeque::new(),
        }
    }

    /// Record a connection failure and return the wait before reconnecting.
    pub fn next_delay(&mut self) -> Backoff {
        self.next_delay_at(Instant::now())
    }

    fn next_delay_at(&mut self, now: Instant) -> Backoff {
        self.retries = self.retries.saturating_add(1);

        self.failures.push_back(now);
        while self
            .failures
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.retry_window)
        {
            self.failures.pop_front();
        }

        let window_limit = usize::try_from(self.config.max_retries).unwrap_or(usize::MAX);
        if self.failures.len() > window_limit {
            let failures = self.failures.len();
            self.failures.clear();
            self.retries = 0;
            return Backoff::Cooldown {
                failures,
                delay: self.config.cooldown,
            };
        }

        Backoff::Exponential {
            retry: self.retries,
            delay: self.apply_jitter(self.delay_for_retry(self.retries)),
        }
    }

    /// Un-jittered delay for retry `retry`: `min(base · 2^retry, max_delay)`.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    /// Reset the retry counter after a successful connection.
    pub const fn reset(&mut self) {
        self.retries = 0;
    }

    /// Retries since the last successful connection.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }
        let spread = duration.as_secs_f64() * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig::default())
    }

    #[test_case(1, 2 ; "first retry")]
    #[test_case(3, 8 ; "third retry")]
    #[test_case(5, 32 ; "last uncapped")]
    #[test_case(6, 60 ; "capped")]
    #[test_case(10, 60 ; "stays capped")]
    #[test_case(64, 60 ; "no overflow")]
    fn delay_is_capped_power_of_two(retry: u32, secs: u64) {
        assert_eq!(policy().delay_for_retry(retry), Duration::from_secs(secs));
    }

    #[test]
    fn consecutive_failures_back_off_exponentially() {
        let mut policy = policy();
        let start = Instant::now();
        let delays: Vec<_> = (0..5u32)
            .map(|i| {
                policy
                    .next_delay_at(start + Duration::from_secs(u64::from(i) * 100))
                    .delay()
            })
            .collect();
        assert_eq!(
            delays,
            [2, 4, 8, 16, 32].map(Duration::from_secs).to_vec()
        );
        assert_eq!(policy.retries(), 5);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut policy = policy();
        let start = Instant::now();
        let _ = policy.next_delay_at(start);
        let _ = policy.next_delay_at(start + Duration::from_secs(90));
        policy.reset();
        assert_eq!(policy.retries(), 0);
        assert_eq!(
            policy.next_delay_at(start + Duration::from_secs(200)),
            Backoff::Exponential {
                retry: 1,
                delay: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn failures_in_window_trigger_cooldown() {
        let mut policy = policy();
        let start = Instant::now();
        for i in 0..5u64 {
            let backoff = policy.next_delay_at(start + Duration::from_secs(i));
            assert!(matches!(backoff, Backoff::Exponential { .. }));
            // A flapping connection resets retries but keeps window history.
            policy.reset();
        }

        let backoff = policy.next_delay_at(start + Duration::from_secs(5));
        assert_eq!(
            backoff,
            Backoff::Cooldown {
                failures: 6,
                delay: Duration::from_secs(120)
            }
        );

        // Schedule resumes after the cooldown.
        assert_eq!(
            policy.next_delay_at(start + Duration::from_secs(130)).delay(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn old_failures_leave_the_window() {
        let mut policy = policy();
        let start = Instant::now();
        for i in 0..10u64 {
            let backoff = policy.next_delay_at(start + Duration::from_secs(i * 61));
            assert!(matches!(backoff, Backoff::Exponential { .. }), "failure {i}");
        }
    }

    #[test]
    fn jitter_stays_within_spread() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            jitter_factor: 0.1,
            ..ReconnectConfig::default()
        });
        let delay = policy.next_delay().delay();
        assert!(delay >= Duration::from_secs_f64(1.8));
        assert!(delay <= Duration::from_secs_f64(2.2));
    }
}
