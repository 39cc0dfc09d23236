//! Worker pool executing copy-on-write jobs.
//!
//! Threads are spawned at activation and the queue is a bounded channel
//! sized to the job pool, so neither dispatch nor drain depends on fresh
//! allocation. Teardown closes the queue and joins every thread, which is
//! the target's quiescence point: after `drain` returns, no job is running
//! or queued.

use crate::job::{self, CowJob};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};
use vcow_error::{Result, VcowError};

pub(crate) struct WorkerPool {
    queue: Option<Sender<Box<CowJob>>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(threads: usize, queue_depth: usize) -> Result<Self> {
        let (tx, rx) = bounded::<Box<CowJob>>(queue_depth);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Box<CowJob>> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("vcow-worker-{i}"))
                .spawn(move || worker_loop(&rx))
                .map_err(|_| VcowError::ResourceExhausted("worker thread"))?;
            handles.push(handle);
        }
        Ok(Self {
            queue: Some(tx),
            handles,
        })
    }

    /// Hand a job to the pool without blocking.
    ///
    /// The queue is as deep as the job pool, so a live pool always has
    /// room; failure means teardown has begun, and the job comes back
    /// intact for the caller to unwind.
    pub(crate) fn enqueue(&self, job: Box<CowJob>) -> std::result::Result<(), Box<CowJob>> {
        match &self.queue {
            Some(tx) => tx.try_send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }

    /// Drain to quiescence: stop intake, then join every worker.
    pub(crate) fn drain(&mut self) {
        self.queue = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(target: "vcow::worker", event = "worker_panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.drain();
    }
}

fn worker_loop(rx: &Receiver<Box<CowJob>>) {
    for job in rx.iter() {
        job::process(job);
    }
    debug!(target: "vcow::worker", event = "worker_exit");
}
