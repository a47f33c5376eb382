//! Reconnect scheduling.
//!
//! The default policy waits a fixed delay between attempts and never gives
//! up. Setting a multiplier above `1.0` turns it into capped exponential
//! backoff; `jitter` spreads attempts of co-deployed services apart.

use std::time::Duration;

/// How the connection manager schedules connect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Grace period before the very first attempt, giving a co-deployed
    /// broker time to come up.
    pub initial_delay: Duration,

    /// Delay after the first failed attempt.
    pub retry_delay: Duration,

    /// Growth factor applied after every failure (1.0 keeps the delay fixed).
    pub multiplier: f64,

    /// Upper bound for the grown delay.
    pub max_delay: Duration,

    /// Fraction of randomisation applied to each delay, e.g. 0.15 for ±15%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed-delay policy: `initial_delay` once, then `retry_delay` forever.
    pub fn fixed(initial_delay: Duration, retry_delay: Duration) -> Self {
        Self {
            initial_delay,
            retry_delay,
            max_delay: retry_delay,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.multiplier = multiplier.max(1.0);
        self.max_delay = max_delay.max(self.retry_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.5);
        self
    }
}

/// Retry State owned by the connection manager.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    current_delay: Duration,
    attempts: u64,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current_delay: policy.retry_delay,
            attempts: 0,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay that the next failure will wait.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Records a failed attempt and returns how long to wait before the next one.
    pub fn record_failure(&mut self) -> Duration {
        self.attempts += 1;

        let delay = self.current_delay;
        let grown = scale(delay, self.policy.multiplier);
        self.current_delay = grown.min(self.policy.max_delay).max(self.policy.retry_delay);

        apply_jitter(delay, self.policy.jitter)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.policy.retry_delay;
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * jitter;
    scale(delay, factor)
}

/// `delay * factor`, saturating at `Duration::MAX` instead of panicking.
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_grows() {
        let mut state = RetryState::new(RetryPolicy::default());

        for _ in 0..10 {
            assert_eq!(state.record_failure(), Duration::from_secs(5));
        }
        assert_eq!(state.attempts(), 10);
        assert_eq!(state.current_delay(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1), Duration::from_secs(1))
            .with_backoff(2.0, Duration::from_secs(5));
        let mut state = RetryState::new(policy);

        let delays: Vec<u64> = (0..5).map(|_| state.record_failure().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn reset_restores_initial_retry_delay() {
        let policy = RetryPolicy::default().with_backoff(3.0, Duration::from_secs(120));
        let mut state = RetryState::new(policy);

        state.record_failure();
        state.record_failure();
        assert_eq!(state.current_delay(), Duration::from_secs(45));

        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.current_delay(), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default().with_jitter(0.2);
        let mut state = RetryState::new(policy);

        for _ in 0..100 {
            let delay = state.record_failure();
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn huge_multiplier_saturates_at_cap() {
        let policy = RetryPolicy::default().with_backoff(1e30, Duration::from_secs(60));
        let mut state = RetryState::new(policy);

        assert_eq!(state.record_failure(), Duration::from_secs(5));
        assert_eq!(state.record_failure(), Duration::from_secs(60));
        assert_eq!(state.record_failure(), Duration::from_secs(60));

        let policy = RetryPolicy::fixed(Duration::ZERO, Duration::MAX).with_jitter(0.5);
        let mut state = RetryState::new(policy);
        assert!(state.record_failure() > Duration::from_secs(u64::MAX / 4));
    }

    #[test]
    fn multiplier_below_one_is_clamped() {
        let policy = RetryPolicy::default().with_backoff(0.5, Duration::from_secs(1));

        assert_eq!(policy.multiplier, 1.0);
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }
}
