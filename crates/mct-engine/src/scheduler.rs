//! Job scheduling boundary
//!
//! Queues schedule at most one job at a time; the scheduler only needs to
//! run boxed closures on some worker thread. The default implementation
//! wraps a rayon pool. Single-stripe operation schedules nothing, so a
//! scheduler is required exactly when any component uses more than one
//! stripe.

use std::sync::Arc;

pub trait JobScheduler: Send + Sync {
    /// Run `job` on a worker thread. `last` hints that no further job will
    /// ever be scheduled on the same queue, letting the pool favour
    /// locality when moving workers on.
    fn schedule_job(&self, job: Box<dyn FnOnce() + Send>, last: bool);
}

/// Rayon-backed scheduler shared by every queue of a tile
pub struct ThreadPoolScheduler {
    pool: Arc<rayon::ThreadPool>,
}

impl ThreadPoolScheduler {
    pub fn new(pool: Arc<rayon::ThreadPool>) -> Self {
        Self { pool }
    }

    pub fn with_threads(num_threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?;
        Ok(Self::new(Arc::new(pool)))
    }
}

impl JobScheduler for ThreadPoolScheduler {
    fn schedule_job(&self, job: Box<dyn FnOnce() + Send>, _last: bool) {
        self.pool.spawn(job);
    }
}

/// Runs each job inline on the calling thread. Useful for tests and for
/// callers that want the multi-stripe protocol without real worker
/// threads.
#[derive(Debug, Default)]
pub struct InlineScheduler;

impl JobScheduler for InlineScheduler {
    fn schedule_job(&self, job: Box<dyn FnOnce() + Send>, _last: bool) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_inline_scheduler_runs_job() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        InlineScheduler.schedule_job(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }), false);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_thread_pool_scheduler_runs_job() {
        let scheduler = ThreadPoolScheduler::with_threads(1).unwrap();
        let done = Arc::new(crate::wait::WaitHandle::new());
        let count = Arc::new(AtomicU32::new(0));
        let (d, c) = (done.clone(), count.clone());
        scheduler.schedule_job(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            d.notify();
        }), true);
        done.wait_until(|| count.load(Ordering::SeqCst) == 1);
    }
}
