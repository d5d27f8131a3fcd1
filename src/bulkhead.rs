//! Bulkhead limiting concurrent ensemble requests.
//!
//! The dispatcher never queues work: when every permit is taken, new
//! requests are shed immediately with a retryable [`EnsembleError::Capacity`]
//! so callers can back off instead of piling up.

use crate::error::EnsembleError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, EnsembleError>
    where
        Fut: Future<Output = Result<T, EnsembleError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let available = self.semaphore.available_permits();
        let in_flight = self.max_concurrent.saturating_sub(available);

        let _permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| EnsembleError::Capacity { in_flight, max: self.max_concurrent })?;

        operation().await
    }
}
