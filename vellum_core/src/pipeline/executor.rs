//! Worker pool for independent external work.

use crate::error::{Error, Result};
use std::sync::mpsc::{self, Receiver};
use threadpool::ThreadPool;

/// Runs independent work items on a fixed pool of threads.
///
/// Work items never see the tree; operations submit them, wait for the
/// results and apply any tree changes on the calling thread.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: ThreadPool,
}

impl Executor {
    pub fn new(workers: usize) -> Self {
        let pool = threadpool::Builder::new()
            .num_threads(workers.max(1))
            .thread_name("vellum-worker".to_string())
            .build();
        Self { pool }
    }

    pub fn workers(&self) -> usize {
        self.pool.max_count()
    }

    /// Queue `job` and return a handle to its result.
    pub fn submit<T, F>(&self, job: F) -> Pending<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        self.pool.execute(move || {
            // The receiver may have been dropped by a caller that gave up.
            let _ = sender.send(job());
        });
        Pending { receiver }
    }
}

impl Default for Executor {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(workers)
    }
}

/// Result of a submitted work item.
#[derive(Debug)]
pub struct Pending<T> {
    receiver: Receiver<T>,
}

impl<T> Pending<T> {
    /// Block until the work item finishes.
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .map_err(|_| Error::failed("work item panicked before producing a result"))
    }
}

/// Wait for every item, in submission order.
pub fn wait_all<T>(pending: Vec<Pending<T>>) -> Result<Vec<T>> {
    pending.into_iter().map(Pending::wait).collect()
}
