use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter, as a fraction of the delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

/// Bounded exponential backoff for a single request.
///
/// Call [`Backoff::next`] after each failed attempt: it yields the delay to
/// wait before the next attempt, or `None` once the retry budget is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            attempt: 1,
            next_delay: policy.base_delay.min(policy.max_delay),
        }
    }

    pub fn next(&mut self) -> Option<Duration> {
        if self.attempt > self.policy.max_retries {
            return None;
        }

        let delay = self.next_delay;
        self.attempt += 1;
        self.next_delay = self
            .next_delay
            .saturating_mul(2)
            .min(self.policy.max_delay);

        Some(delay + self.jitter(delay))
    }

    /// Attempts made so far, counting the one in flight.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Cap an externally requested delay (e.g. `Retry-After`) to the policy maximum.
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.policy.max_delay)
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.policy.jitter_ratio <= 0.0 {
            return Duration::ZERO;
        }
        delay.mul_f64(self.policy.jitter_ratio * fastrand::f64())
    }
}
