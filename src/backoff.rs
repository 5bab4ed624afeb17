// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Delays
//!
//! [`Backoff`] spaces out redeliveries of a failing message; [`ReconnectPolicy`]
//! spaces out reconnection attempts after the broker connection drops.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for handler failures.
///
/// `delay(a) = base * 2^(a-1)`, plus a random jitter below half of that,
/// capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(600),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff { base, max }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the next delivery of a message that has been attempted
    /// `attempts` times.
    pub fn delay(&self, attempts: i32) -> Duration {
        let exponential = self.exponential(attempts);
        if exponential >= self.max {
            return self.max;
        }

        let half = u64::try_from((exponential / 2).as_nanos()).unwrap_or(u64::MAX);
        let jitter = if half == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::rng().random_range(0..half))
        };

        (exponential + jitter).min(self.max)
    }

    /// `base * 2^(attempts-1)` without jitter. Attempts below 1 count as 1.
    pub(crate) fn exponential(&self, attempts: i32) -> Duration {
        let shift = (attempts.max(1) - 1).min(31) as u32;
        self.base.saturating_mul(1u32 << shift)
    }
}

/// Doubling delay between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ReconnectPolicy { initial, max }
    }

    pub fn initial(&self) -> Duration {
        self.initial.min(self.max)
    }

    /// The delay to wait after `current` failed.
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base(), Duration::from_secs(1));
        assert_eq!(backoff.max(), Duration::from_secs(600));

        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial(), Duration::from_secs(1));
    }

    #[test]
    fn delay_stays_within_jitter_window() {
        let backoff = Backoff::default();
        for attempts in 1..=9 {
            let low = Duration::from_secs(1 << (attempts - 1));
            let high = low + low / 2;
            for _ in 0..20 {
                let delay = backoff.delay(attempts);
                assert!(delay >= low, "attempt {attempts}: {delay:?} < {low:?}");
                assert!(delay <= high, "attempt {attempts}: {delay:?} > {high:?}");
            }
        }
    }

    #[test]
    fn delay_is_non_decreasing_and_saturates() {
        let backoff = Backoff::default();
        let mut previous = Duration::ZERO;
        for attempts in 1..=40 {
            let delay = backoff.delay(attempts);
            assert!(delay >= previous);
            assert!(delay <= backoff.max());
            previous = delay;
        }
        assert_eq!(backoff.delay(11), Duration::from_secs(600));
        assert_eq!(backoff.delay(i32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn non_positive_attempts_count_as_first() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(backoff.exponential(0), Duration::from_millis(10));
        assert_eq!(backoff.exponential(-3), Duration::from_millis(10));
    }

    #[test]
    fn zero_base_never_waits() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::ZERO);
    }

    #[test]
    fn reconnect_delay_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let mut delay = policy.initial();
        let mut seen = vec![];
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = policy.next(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
