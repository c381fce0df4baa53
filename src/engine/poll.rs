//! Bounded polling
//!
//! Every wait in the engine is a fixed-interval poll against the control
//! plane. A [`PollPolicy`] fixes the interval and the budget; a run ends in
//! one of three ways: the check produced a value, the budget ran out, or the
//! check returned a hard error.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Budget for a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollLimit {
    /// Give up after this many checks
    Attempts(u32),
    /// Give up once this much wall-clock time has passed
    Deadline(Duration),
    /// Poll until the check succeeds or errors
    Unbounded,
}

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub limit: PollLimit,
}

/// Terminal outcome of a poll that did not hit a hard error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut { waited: Duration },
}

impl<T> PollOutcome<T> {
    /// Turn a timeout into [`Error::Timeout`] naming what was awaited
    pub fn or_timeout(self, operation: impl Into<String>) -> Result<T> {
        match self {
            PollOutcome::Ready(value) => Ok(value),
            PollOutcome::TimedOut { waited } => Err(Error::timeout(operation, waited)),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

impl PollPolicy {
    pub fn attempts(interval: Duration, attempts: u32) -> Self {
        Self {
            interval,
            limit: PollLimit::Attempts(attempts),
        }
    }

    pub fn deadline(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            limit: PollLimit::Deadline(deadline),
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            limit: PollLimit::Unbounded,
        }
    }

    /// Run `check` until it yields `Some`, errors, or the budget is spent.
    ///
    /// The check runs immediately, then once per interval. It must re-read
    /// cluster state on every call.
    pub async fn run<T, F, Fut>(&self, mut check: F) -> Result<PollOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if let Some(value) = check().await? {
                return Ok(PollOutcome::Ready(value));
            }

            let exhausted = match self.limit {
                PollLimit::Attempts(max) => attempt >= max,
                PollLimit::Deadline(deadline) => started.elapsed() >= deadline,
                PollLimit::Unbounded => false,
            };
            if exhausted {
                return Ok(PollOutcome::TimedOut {
                    waited: started.elapsed(),
                });
            }

            trace!(attempt, interval_ms = self.interval.as_millis() as u64, "poll not ready");
            tokio::time::sleep(self.interval).await;
        }
    }
}
