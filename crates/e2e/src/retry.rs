//! Bounded waiting on out-of-process state
//!
//! Two shapes are used across the pipeline: [`Poller`] re-evaluates a
//! predicate until it holds or a deadline passes, and [`Attempts`] retries an
//! operation a fixed number of times with a short pause in between.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::trace;

use crate::error::{E2eError, E2eResult};

/// Default interval between predicate evaluations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout-bounded predicate polling.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Poller {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Evaluate `check` until it yields `true`.
    ///
    /// Transient errors (see [`E2eError::is_transient`]) count as "not yet";
    /// any other error aborts the wait immediately. The predicate is always
    /// evaluated at least once, even with a zero timeout, but a single
    /// evaluation that stalls is cut off at the deadline.
    pub async fn until<F, Fut>(&self, what: &str, mut check: F) -> E2eResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<bool>>,
    {
        self.until_some(what, || {
            let pending = check();
            async move { Ok::<_, E2eError>(pending.await?.then_some(())) }
        })
        .await
    }

    /// Like [`until`](Self::until), but for checks that produce a value.
    pub async fn until_some<T, F, Fut>(&self, what: &str, mut check: F) -> E2eResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<Option<T>>>,
    {
        let start = Instant::now();
        loop {
            let remaining = self.timeout.saturating_sub(start.elapsed());
            match timeout(remaining, check()).await {
                Ok(Ok(Some(value))) => return Ok(value),
                Ok(Ok(None)) => {}
                Ok(Err(e)) if e.is_transient() => trace!("{}: not yet ({})", what, e),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    trace!("{}: check still pending at deadline", what);
                    return Err(self.expired(what));
                }
            }

            if start.elapsed() >= self.timeout {
                return Err(self.expired(what));
            }
            sleep(self.interval).await;
        }
    }

    fn expired(&self, what: &str) -> E2eError {
        E2eError::Timeout {
            what: what.to_string(),
            after: self.timeout,
        }
    }
}

/// Attempt-count-bounded retry.
#[derive(Debug, Clone, Copy)]
pub struct Attempts {
    pub max: u32,
    pub delay: Duration,
}

impl Attempts {
    pub fn new(max: u32, delay: Duration) -> Self {
        Self { max, delay }
    }

    /// Run `op` until it succeeds, retrying only errors accepted by
    /// `retryable`. Fails with [`E2eError::TooManyRetries`] once `max`
    /// attempts have all failed.
    pub async fn retry<T, F, Fut, R>(&self, what: &str, retryable: R, mut op: F) -> E2eResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<T>>,
        R: Fn(&E2eError) -> bool,
    {
        for attempt in 1..=self.max {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) => {
                    trace!("{}: attempt {}/{} failed: {}", what, attempt, self.max, e);
                    if attempt < self.max {
                        sleep(self.delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(E2eError::TooManyRetries {
            what: what.to_string(),
            attempts: self.max,
        })
    }
}
