use crate::error::{PatchError, Result};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal shared between the dispatcher and tasks
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the signal has been raised
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Default worker count: available parallelism, at least 1
pub fn default_workers() -> usize {
    num_cpus::get().max(1)
}

/// Bounded pool of workers draining a queue of per-file tasks
///
/// Tasks run in any interleaving. Results come back in submission order so
/// callers see the same report regardless of scheduling.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("patchsync-worker-{}", i))
            .build()
            .map_err(|e| PatchError::Config(format!("failed to start worker pool: {}", e)))?;

        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` over every item
    ///
    /// The token is checked before each task starts; tasks that never started
    /// come back as `None`.
    pub fn run<T, R, F>(&self, items: Vec<T>, cancel: &CancelToken, task: F) -> Vec<Option<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        self.pool.install(|| {
            items
                .into_par_iter()
                .with_max_len(1)
                .map(|item| {
                    if cancel.is_cancelled() {
                        None
                    } else {
                        Some(task(item))
                    }
                })
                .collect()
        })
    }
}
