use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::error;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Bounded pool of blocking threads.
///
/// At most `size` closures run at once; callers beyond that wait in FIFO
/// order without occupying a runtime thread.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `work` on a blocking thread once a slot is free.
    pub async fn run<F, T>(&self, work: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Blocking task did not complete");
            PoolError::Join(e.to_string())
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
