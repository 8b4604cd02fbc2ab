//! Uniform polling: interval, optional overall bound, and a cancellation
//! check every iteration, replacing ad hoc sleep loops.

use std::time::Duration;

use tokio::time::{sleep, Instant};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` means unbounded; the outer race abandoning is the only limit.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn bounded(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline: Some(deadline),
        }
    }

    pub fn start(&self) -> RetryRun {
        RetryRun {
            policy: *self,
            started: Instant::now(),
            attempts: 0,
        }
    }
}

pub struct RetryRun {
    policy: RetryPolicy,
    started: Instant,
    attempts: u64,
}

impl RetryRun {
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn expired(&self) -> bool {
        match self.policy.deadline {
            Some(deadline) => self.started.elapsed() >= deadline,
            None => false,
        }
    }

    /// One cooperative pause between attempts.
    pub async fn pause(&mut self) {
        self.attempts += 1;
        sleep(self.policy.interval).await;
    }
}
