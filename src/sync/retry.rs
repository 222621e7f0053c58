// ABOUTME: Retry policy for job invocations that fail on transient store errors
// ABOUTME: Fixed delay between attempts with a bounded retry budget

use std::time::Duration;

use crate::error::SyncError;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// What the orchestrator should do after a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-invoke the job from the beginning after `delay`. `retry` is
    /// 1-based and never exceeds the policy's maximum.
    Retry { retry: u32, delay: Duration },
    /// The error is not retryable.
    Fail,
    /// The retry budget is spent.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    /// Decide after an invocation failed with `err`, given how many retries
    /// the job has already used.
    pub fn decide(&self, err: &SyncError, retries_used: u32) -> RetryDecision {
        if !err.is_retryable() {
            RetryDecision::Fail
        } else if retries_used >= self.max_retries {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                retry: retries_used + 1,
                delay: self.delay,
            }
        }
    }
}
