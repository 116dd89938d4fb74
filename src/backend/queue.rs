//! Execution queue synchronization
//!
//! The allocator only needs one thing from the execution queue: a way to wait
//! until every enqueued job has retired, so that buffers released by those
//! jobs are visible as free before an allocation is retried.

use std::sync::Mutex;

use crate::error::MemResult;

/// Execution queue seen from the allocator
pub trait Queue: Send + Sync {
    /// Block until all enqueued work for the active device has completed
    fn sync(&self) -> MemResult<()>;
}

/// Queue whose work runs inline on the submitting thread
///
/// Nothing is ever pending, so [`sync`](Queue::sync) returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateQueue;

impl Queue for ImmediateQueue {
    fn sync(&self) -> MemResult<()> {
        Ok(())
    }
}

type Job = Box<dyn FnOnce() -> MemResult<()> + Send>;

/// Queue that holds jobs until the next [`sync`](Queue::sync)
///
/// Models deferred release: a buffer handed to a job stays in use until the
/// queue is synchronized, at which point the job runs and frees it.
#[derive(Default)]
pub struct DeferredQueue {
    pending: Mutex<Vec<Job>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job to run at the next sync
    pub fn enqueue<F>(&self, job: F) -> MemResult<()>
    where
        F: FnOnce() -> MemResult<()> + Send + 'static,
    {
        self.pending.lock()?.push(Box::new(job));
        Ok(())
    }

    /// Number of jobs waiting for the next sync
    pub fn pending(&self) -> MemResult<usize> {
        Ok(self.pending.lock()?.len())
    }
}

impl std::fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("DeferredQueue")
            .field("pending", &pending)
            .finish()
    }
}

impl Queue for DeferredQueue {
    fn sync(&self) -> MemResult<()> {
        // Take the jobs out first: a job may enqueue more work or re-enter the allocator
        let jobs = std::mem::take(&mut *self.pending.lock()?);
        if !jobs.is_empty() {
            tracing::debug!("DeferredQueue::sync: running {} pending jobs", jobs.len());
        }

        let mut first_err = None;
        for job in jobs {
            if let Err(e) = job() {
                tracing::error!("DeferredQueue::sync: job failed: {}", e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
