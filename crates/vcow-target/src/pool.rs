//! Bounded pre-allocated pool of job records.
//!
//! Every record the target will ever use is allocated at activation, so the
//! mapping hot path never allocates and keeps making progress under memory
//! pressure. Acquisition is a constant-time pop that never blocks on I/O;
//! an empty pool is reported to the caller, which fails that one request.

use crate::job::CowJob;
use parking_lot::Mutex;
use tracing::trace;

pub(crate) struct JobPool {
    free: Mutex<Vec<Box<CowJob>>>,
    capacity: usize,
}

impl JobPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Box::new(CowJob::blank())).collect();
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    /// Pop a free record, or `None` when the pool is exhausted.
    pub(crate) fn try_acquire(&self) -> Option<Box<CowJob>> {
        let job = self.free.lock().pop();
        if job.is_none() {
            trace!(target: "vcow::pool", event = "job_pool_empty");
        }
        job
    }

    /// Return a record to the pool. The pool never grows past its
    /// configured capacity.
    pub(crate) fn release(&self, job: Box<CowJob>) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(job);
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
