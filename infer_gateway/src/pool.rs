use crate::{config::PreprocessConfig, error::GatewayError, telemetry::Metrics};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Runs CPU-bound preprocessing off the async workers with bounded
/// concurrency and a bounded number of waiters.
pub struct PreprocessPool {
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_capacity: usize,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PreprocessPool {
    pub fn new(config: &PreprocessConfig, metrics: Arc<Metrics>) -> Self {
        tracing::info!(
            pool_size = config.pool_size,
            queue_capacity = config.queue_capacity,
            "Created preprocessing pool"
        );
        Self {
            permits: Arc::new(Semaphore::new(config.pool_size)),
            waiting: AtomicUsize::new(0),
            queue_capacity: config.queue_capacity,
            timeout: config.timeout(),
            metrics,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Result<T, GatewayError> + Send + 'static,
        T: Send + 'static,
    {
        let work = async {
            let permit = self.acquire().await?;
            tokio::task::spawn_blocking(move || {
                // held until the job returns, even if the caller gave up
                let _permit = permit;
                job()
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("preprocessing task failed: {}", e)))?
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_preprocess_rejection("timeout");
                Err(GatewayError::Overloaded(format!(
                    "preprocessing did not finish within {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }

        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_capacity {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            self.metrics.record_preprocess_rejection("queue_full");
            return Err(GatewayError::Overloaded(
                "preprocessing queue is full".to_string(),
            ));
        }
        let _guard = WaitingGuard(&self.waiting);

        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Internal("preprocessing pool is closed".to_string()))
    }
}
