//! Attempt budget for registration polling.

use std::time::Duration;

use crate::lifecycle::{REGISTERING_PROGRESS, REGISTERING_PROGRESS_CEILING};
use crate::{DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL};

/// Progress gained per registration attempt.
const PROGRESS_PER_ATTEMPT: f64 = 2.5;

/// Bounded attempt counter for one confirmation poller.
///
/// Not persisted; it lives exactly as long as the poller that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollBudget {
    attempt_count: u32,
    max_attempts: u32,
    interval: Duration,
}

impl PollBudget {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Record a tick. Returns the new attempt count.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempt_count += 1;
        self.attempt_count
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True once the attempt count has reached the maximum.
    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Registering progress for the current attempt count, capped below 100.
    pub fn registering_progress(&self) -> f64 {
        (REGISTERING_PROGRESS + f64::from(self.attempt_count) * PROGRESS_PER_ATTEMPT)
            .min(REGISTERING_PROGRESS_CEILING)
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget() {
        let budget = PollBudget::default();
        assert_eq!(budget.max_attempts(), 15);
        assert_eq!(budget.interval(), Duration::from_millis(1000));
        assert_eq!(budget.attempt_count(), 0);
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let mut budget = PollBudget::new(3, Duration::from_millis(10));
        assert_eq!(budget.record_attempt(), 1);
        assert_eq!(budget.record_attempt(), 2);
        assert!(!budget.is_exhausted());
        assert_eq!(budget.record_attempt(), 3);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_registering_progress() {
        let mut budget = PollBudget::new(30, Duration::from_millis(10));
        assert_eq!(budget.registering_progress(), 60.0);

        budget.record_attempt();
        assert_eq!(budget.registering_progress(), 62.5);

        budget.record_attempt();
        assert_eq!(budget.registering_progress(), 65.0);

        for _ in 0..20 {
            budget.record_attempt();
        }
        assert_eq!(budget.registering_progress(), 99.0);
    }

    #[test]
    fn test_zero_max_attempts_is_clamped() {
        let mut budget = PollBudget::new(0, Duration::from_millis(10));
        assert_eq!(budget.max_attempts(), 1);
        budget.record_attempt();
        assert!(budget.is_exhausted());
    }
}
