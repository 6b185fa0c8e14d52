//! Deadline-aware retry with exponential backoff
//!
//! The controller never creates deadlines itself: every call gets a
//! [`CallContext`] from its caller, so one chunk's retries can't eat into the
//! next chunk's budget. Time is read and waited on through [`Clock`], which
//! lets tests drive the loop without real sleeps.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: u32 = 2;

/// Source of "now" and of waiting.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Why a call stopped before the operation itself gave an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Aborted {
    #[error("context deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    #[error("context canceled")]
    Cancelled,
}

/// Deadline plus cancellation for one bounded call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn with_timeout(clock: &dyn Clock, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: clock.now() + timeout,
            timeout,
            cancel,
        }
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        self.deadline.saturating_duration_since(clock.now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn deadline_exceeded(&self) -> Aborted {
        Aborted::DeadlineExceeded(self.timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 act as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }

    /// Wait before retry number `retry` (1-based): initial, 2x, 4x, ...
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds or the policy gives up.
///
/// Each invocation is bounded by the time left on `ctx`. Between failed
/// attempts the controller waits `policy.backoff_for(n)`; if the deadline
/// passes or `ctx` is canceled during that wait it returns the abort error
/// right away. After the last attempt no wait happens and the last error is
/// returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    ctx: &CallContext,
    policy: RetryPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Aborted> + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if ctx.is_cancelled() {
            return Err(Aborted::Cancelled.into());
        }
        let remaining = ctx.remaining(clock);
        if remaining.is_zero() {
            return Err(ctx.deadline_exceeded().into());
        }

        let outcome: Result<T, E> = tokio::select! {
            res = tokio::time::timeout(remaining, op()) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ctx.deadline_exceeded().into()),
            },
            _ = ctx.cancel.cancelled() => Err(Aborted::Cancelled.into()),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= max_attempts {
            return Err(err);
        }

        let backoff = policy.backoff_for(attempt);
        let remaining = ctx.remaining(clock);
        tracing::warn!(
            request_attempt = attempt,
            max_request_attempts = max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "request failed, retrying"
        );

        tokio::select! {
            _ = clock.sleep(backoff.min(remaining)) => {}
            _ = ctx.cancel.cancelled() => return Err(Aborted::Cancelled.into()),
        }
        if backoff >= remaining {
            return Err(ctx.deadline_exceeded().into());
        }

        attempt += 1;
    }
}

#[cfg(test)]
pub(crate) mod manual {
    use super::Clock;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Clock whose time only moves when something sleeps on it.
    pub(crate) struct ManualClock {
        origin: Instant,
        elapsed: Mutex<Duration>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                origin: Instant::now(),
                elapsed: Mutex::new(Duration::ZERO),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.elapsed.lock().unwrap() += by;
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.origin + *self.elapsed.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            self.advance(duration);
        }
    }
}
