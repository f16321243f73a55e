//! Retry and suspension policy
//!
//! Two independent mechanisms: a bounded, growing delay for "not ready yet"
//! responses (the try count travels in the task, not the store) and a
//! consecutive-error threshold past which periodic resyncs stop.

use std::time::Duration;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub cap_minutes: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_tries: config.not_ready_max_tries,
            cap_minutes: config.not_ready_cap_minutes,
        }
    }

    /// Delay before redelivering a task that has already seen `tries`
    /// not-ready responses, or `None` once the budget is spent.
    ///
    /// The n-th retry waits `min(n, cap)` minutes.
    pub fn delay_for(&self, tries: u32) -> Option<Duration> {
        if tries >= self.max_tries {
            return None;
        }
        let minutes = tries.saturating_add(1).min(self.cap_minutes);
        Some(Duration::from_secs(u64::from(minutes) * 60))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub suspend_after: i32,
}

impl ErrorPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            suspend_after: config.error_suspend_threshold,
        }
    }

    /// Periodic resyncs skip a connection once its count exceeds the threshold.
    pub fn is_suspended(&self, error_count: i32) -> bool {
        error_count > self.suspend_after
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_a_minute_up_to_the_cap() {
        let policy = RetryPolicy {
            max_tries: 10,
            cap_minutes: 3,
        };
        let minutes: Vec<u64> = (0..5)
            .map(|tries| policy.delay_for(tries).unwrap().as_secs() / 60)
            .collect();
        assert_eq!(minutes, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn retries_stop_at_max_tries() {
        let policy = RetryPolicy {
            max_tries: 3,
            cap_minutes: 10,
        };
        assert!(policy.delay_for(2).is_some());
        assert_eq!(policy.delay_for(3), None);
        assert_eq!(policy.delay_for(u32::MAX), None);
    }

    #[test]
    fn suspension_starts_above_threshold() {
        let policy = ErrorPolicy { suspend_after: 5 };
        assert!(!policy.is_suspended(0));
        assert!(!policy.is_suspended(5));
        assert!(policy.is_suspended(6));
    }
}
