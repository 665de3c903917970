// Worker pool for blocking decode and inference jobs

use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounds how many blocking frame jobs run at once across all sessions.
///
/// Jobs run on tokio's blocking pool; waiting for a permit only suspends the
/// calling session, never the accept loop.
#[derive(Clone)]
pub struct InferencePool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl InferencePool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Run a blocking job once a worker permit is available.
    ///
    /// If the caller stops waiting, the job still runs to completion and its
    /// result is discarded; the permit is held until then.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                PoolError::Panicked
            } else {
                PoolError::Cancelled
            }
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    Closed,
    Panicked,
    Cancelled,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Closed => write!(f, "Inference pool closed"),
            PoolError::Panicked => write!(f, "Inference job panicked"),
            PoolError::Cancelled => write!(f, "Inference job cancelled"),
        }
    }
}

impl std::error::Error for PoolError {}
