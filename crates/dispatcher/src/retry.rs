//! Retry policy for failed tasks: exponential backoff with jitter and
//! a hard attempt cap.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

use pipeline_domain::entities::TaskSchedulingInfo;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first try included.
    pub max_attempts: i64,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
    /// Fractional jitter applied to the computed delay, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 30.0,
            max_delay_seconds: 1800.0,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Schedule now.
    Ready,
    /// Back off until the given instant.
    Wait(DateTime<Utc>),
    /// Attempt cap exhausted; the task is blocked for good.
    Blocked,
}

impl RetryPolicy {
    pub fn decide(&self, info: &TaskSchedulingInfo, now: DateTime<Utc>) -> RetryDecision {
        if info.attempt_count == 0 {
            return RetryDecision::Ready;
        }
        if info.attempt_count >= self.max_attempts {
            return RetryDecision::Blocked;
        }

        let last_failure = match info.last_failure_at {
            Some(t) => t,
            // Attempts exist but none failed; the unscheduled query
            // only surfaces such a task when its attempts all failed,
            // so treat a missing timestamp as ready.
            None => return RetryDecision::Ready,
        };

        let exponent = (info.attempt_count - 1).min(16) as u32;
        let mut delay = self.base_delay_seconds * f64::from(2u32.saturating_pow(exponent));
        delay = delay.min(self.max_delay_seconds);
        if self.jitter > 0.0 {
            let factor: f64 = rand::rng().random_range(-self.jitter..=self.jitter);
            delay *= 1.0 + factor;
        }

        let eligible_at = last_failure + ChronoDuration::milliseconds((delay * 1000.0) as i64);
        if now >= eligible_at {
            RetryDecision::Ready
        } else {
            RetryDecision::Wait(eligible_at)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_domain::entities::Task;

    fn info(attempt_count: i64, seconds_since_failure: i64) -> TaskSchedulingInfo {
        TaskSchedulingInfo {
            task: Task {
                id: 1,
                parent_id: None,
                task_type: "transit_search".to_string(),
                name: None,
                job_name: None,
                working_directory: ".".to_string(),
                created_at: Utc::now(),
            },
            attempt_count,
            last_failure_at: Some(Utc::now() - ChronoDuration::seconds(seconds_since_failure)),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_seconds: 10.0,
            max_delay_seconds: 100.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn fresh_task_is_ready() {
        let mut i = info(0, 0);
        i.last_failure_at = None;
        assert_eq!(policy().decide(&i, Utc::now()), RetryDecision::Ready);
    }

    #[test]
    fn recent_failure_backs_off() {
        let decision = policy().decide(&info(1, 1), Utc::now());
        assert!(matches!(decision, RetryDecision::Wait(_)));
    }

    #[test]
    fn old_failure_is_ready_again() {
        assert_eq!(
            policy().decide(&info(1, 60), Utc::now()),
            RetryDecision::Ready
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        // Second failure: 20s delay. 15s elapsed is not enough.
        let decision = policy().decide(&info(2, 15), Utc::now());
        assert!(matches!(decision, RetryDecision::Wait(_)));
        assert_eq!(
            policy().decide(&info(2, 25), Utc::now()),
            RetryDecision::Ready
        );
    }

    #[test]
    fn cap_blocks_for_good() {
        assert_eq!(
            policy().decide(&info(3, 10_000), Utc::now()),
            RetryDecision::Blocked
        );
    }
}
