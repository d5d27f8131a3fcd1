//! Retry engine: bounded attempts with a delay schedule, jitter, and
//! deadline honor.
//!
//! The default retry predicate is the error classification itself, so
//! non-retryable failures (auth, quota, open breakers, programmer errors)
//! are surfaced after a single attempt. Waits never run past the caller's
//! deadline: when the remaining budget would elapse mid-wait the policy
//! returns the last error without further attempts.

use crate::error::EnsembleError;
use crate::jitter::Jitter;
use crate::schedule::RetrySchedule;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How the policy spends the time between attempts. Tests swap the real
/// waits out, optionally keeping a record of what would have been slept.
#[derive(Debug, Clone, Default)]
pub enum Waiter {
    /// Real waits on the tokio timer.
    #[default]
    Tokio,
    /// Skip every delay (fast tests).
    Skip,
    /// Skip every delay but log each one (tests asserting schedules).
    Recording(DelayLog),
}

impl Waiter {
    async fn wait(&self, delay: Duration) {
        match self {
            Waiter::Tokio => tokio::time::sleep(delay).await,
            Waiter::Skip => {}
            Waiter::Recording(log) => log.push(delay),
        }
    }
}

/// Shared log of the delays a [`Waiter::Recording`] policy would have
/// slept.
#[derive(Debug, Clone, Default)]
pub struct DelayLog {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl DelayLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, delay: Duration) {
        self.delays.lock().unwrap_or_else(|p| p.into_inner()).push(delay);
    }

    /// Every recorded delay, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.delays.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: RetrySchedule,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&EnsembleError) -> bool + Send + Sync>,
    waiter: Waiter,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("schedule", &self.schedule)
            .field("jitter", &self.jitter)
            .field("waiter", &self.waiter)
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryBuildError {
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for RetryBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryBuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for RetryBuildError {}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Execute with no external deadline.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, EnsembleError>
    where
        T: Send,
        Fut: Future<Output = Result<T, EnsembleError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        // Far-enough horizon that no realistic schedule reaches it.
        self.execute_until(Instant::now() + Duration::from_secs(30 * 24 * 60 * 60), operation).await
    }

    /// Execute, giving up when `deadline` would elapse before the next
    /// attempt could start.
    pub async fn execute_until<T, Fut, Op>(
        &self,
        deadline: Instant,
        mut operation: Op,
    ) -> Result<T, EnsembleError>
    where
        T: Send,
        Fut: Future<Output = Result<T, EnsembleError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut last_error: Option<EnsembleError> = None;

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !(self.should_retry)(&e) || attempt >= self.max_attempts {
                        return Err(e);
                    }

                    // delay_for is 1-indexed over completed attempts
                    let delay = self.jitter.apply(self.schedule.delay_for(attempt));
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || delay >= remaining {
                        tracing::debug!(
                            attempt,
                            ?delay,
                            ?remaining,
                            "deadline would elapse before next attempt, giving up"
                        );
                        return Err(e);
                    }

                    tracing::debug!(attempt, ?delay, error = %e, "retrying after backoff");
                    last_error = Some(e);
                    self.waiter.wait(delay).await;
                }
            }
        }

        // Loop always returns from its body; max_attempts >= 1 is enforced
        // at build time.
        Err(last_error.unwrap_or_else(|| EnsembleError::internal("retry loop exited without error")))
    }

    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: usize,
    schedule: RetrySchedule,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&EnsembleError) -> bool + Send + Sync>,
    waiter: Waiter,
}

impl std::fmt::Debug for RetryPolicyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyBuilder")
            .field("max_attempts", &self.max_attempts)
            .field("schedule", &self.schedule)
            .field("jitter", &self.jitter)
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            schedule: RetrySchedule::default(),
            jitter: Jitter::additive(Duration::from_millis(100)),
            should_retry: Arc::new(EnsembleError::is_retryable),
            waiter: Waiter::Tokio,
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Result<Self, RetryBuildError> {
        if attempts == 0 {
            return Err(RetryBuildError::InvalidMaxAttempts(attempts));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn schedule(mut self, schedule: RetrySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EnsembleError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn waiter(mut self, waiter: Waiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            schedule: self.schedule,
            jitter: self.jitter,
            should_retry: self.should_retry,
            waiter: self.waiter,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
