//! Reconnect backoff for console sessions.

use std::time::Duration;

/// Exponential backoff parameters. Delays double from `base` up to `cap`;
/// after `max_attempts` scheduled retries the session is abandoned.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(125),
            cap: Duration::from_millis(2000),
            max_attempts: 10,
        }
    }
}

/// Mutable counter over a [`RetryPolicy`]. One instance lives for the whole
/// session; a successful connection resets it.
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self
            .policy
            .base
            .saturating_mul(1u32 << self.attempts.min(30))
            .min(self.policy.cap);
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let mut state = RetryState::new(RetryPolicy::default());
        let delays: Vec<u64> = std::iter::from_fn(|| state.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![125, 250, 500, 1000, 2000, 2000, 2000, 2000, 2000, 2000]
        );
        assert_eq!(state.next_delay(), None);
    }

    #[test]
    fn reset_restores_the_budget() {
        let mut state = RetryState::new(RetryPolicy::default());
        for _ in 0..10 {
            state.next_delay();
        }
        assert_eq!(state.next_delay(), None);
        state.reset();
        assert_eq!(state.next_delay(), Some(Duration::from_millis(125)));
    }

    #[test]
    fn custom_policy_is_honored() {
        let mut state = RetryState::new(RetryPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(15),
            max_attempts: 2,
        });
        assert_eq!(state.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(15)));
        assert_eq!(state.next_delay(), None);
    }
}
