//! Bounded polling
//!
//! Every "wait until X shows up" in the engine is a [`PollingWaiter`] over an
//! async predicate. A timeout is an ordinary `false`, not an error.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Default pause between predicate evaluations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Re-evaluates a predicate until it holds or a deadline passes
#[derive(Debug, Clone, Copy)]
pub struct PollingWaiter {
    interval: Duration,
}

impl Default for PollingWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl PollingWaiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `predicate` until it returns true or `timeout` elapses.
    ///
    /// The predicate runs at least once. A call still pending at the deadline
    /// is dropped, and sleeps are clipped to the remaining time, so this
    /// never returns later than `timeout` plus scheduling jitter.
    pub async fn poll_until<F, Fut>(&self, mut predicate: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, predicate()).await {
                Ok(true) => {
                    tracing::trace!(
                        "Poll satisfied after {} attempt(s) in {:?}",
                        attempts,
                        start.elapsed()
                    );
                    return true;
                }
                Ok(false) => {}
                Err(_) => {
                    tracing::trace!("Poll abandoned an in-flight probe at the deadline");
                    return false;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::trace!(
                    "Poll timed out after {} attempt(s) ({}ms)",
                    attempts,
                    timeout.as_millis()
                );
                return false;
            }

            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }

    /// Like [`poll_until`](Self::poll_until) but a timeout becomes `on_timeout()`
    pub async fn poll_until_or_fail<F, Fut, E>(
        &self,
        predicate: F,
        timeout: Duration,
        on_timeout: E,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
        E: FnOnce() -> Error,
    {
        if self.poll_until(predicate, timeout).await {
            Ok(())
        } else {
            Err(on_timeout())
        }
    }
}
