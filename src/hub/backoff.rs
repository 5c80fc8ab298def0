//! Reconnection schedule socket clients are expected to follow.
//!
//! The server never depends on it: any client may register again at any
//! time. It is exported so Rust clients (and the integration tests) share
//! one definition of the contract.

use std::time::Duration;

/// Exponential backoff: 1s, 2s, 4s, ... capped at 30s, abandoned after 10 attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based), or `None` once
    /// the client should give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    /// Tracker for one client's run of consecutive failures.
    pub fn tracker(&self) -> ReconnectState {
        ReconnectState {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Consecutive-failure counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectState {
    /// Delay before the next attempt; `None` means give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt)?;
        self.attempt += 1;
        Some(delay)
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..10)
            .map(|n| policy.delay_for(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(9).is_some());
        assert_eq!(policy.delay_for(10), None);
        assert_eq!(policy.delay_for(u32::MAX), None);
    }

    #[test]
    fn test_large_attempt_numbers_do_not_overflow() {
        let policy = ReconnectPolicy {
            max_attempts: u32::MAX,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(40), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_tracker_counts_and_resets() {
        let mut state = ReconnectPolicy::default().tracker();
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(state.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(state.attempts(), 2);

        state.reset();
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));

        let mut exhausted = ReconnectPolicy::default().tracker();
        let total = std::iter::from_fn(|| exhausted.next_delay()).count();
        assert_eq!(total, 10);
        assert_eq!(exhausted.next_delay(), None);
    }
}
