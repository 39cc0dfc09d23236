//! The per-first-write copy-on-write job.
//!
//! A job exists from the moment the mapper sees a write to a chunk whose
//! bit is clear until the original bio has been re-dispatched to the cow
//! device (or failed). The worker drives it through an explicit state
//! machine:
//!
//! ```text
//! Initialized -> CopyingData -> UpdatingMetadata -> PersistingMetadata -> Completing
//!                    |                 |                    |
//!                    +-----------------+--------------------+--> Error
//! ```
//!
//! Ordering is data before metadata: the 4 KiB chunk copy reaches durable
//! media before the bitmap sector does, and the in-memory bit is published
//! only after both. A crash between the two leaves the bit clear, so the
//! chunk keeps reading from the origin.

use crate::metadata;
use crate::target::TargetInner;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use vcow_block::{Bio, WriteMode, submit};
use vcow_error::{Result, VcowError};
use vcow_types::{CHUNK_BYTES, Chunk, cow_data_sector};

/// State tag of a [`CowJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Initialized,
    CopyingData,
    UpdatingMetadata,
    PersistingMetadata,
    Completing,
    Error,
}

/// One in-flight copy-on-write operation.
///
/// Records are pre-allocated by the job pool; `bio` and `target` are filled
/// in by the mapper ([`CowJob::arm`]) and cleared again before the record
/// returns to the pool.
pub(crate) struct CowJob {
    pub(crate) state: JobState,
    pub(crate) chunk: Chunk,
    pub(crate) error: Option<VcowError>,
    pub(crate) bio: Option<Bio>,
    pub(crate) target: Option<Arc<TargetInner>>,
}

impl CowJob {
    /// An unarmed record, as held by the pool.
    pub(crate) fn blank() -> Self {
        Self {
            state: JobState::Initialized,
            chunk: Chunk(0),
            error: None,
            bio: None,
            target: None,
        }
    }

    /// Populate the record for one write to `chunk`.
    pub(crate) fn arm(&mut self, target: Arc<TargetInner>, bio: Bio, chunk: Chunk) {
        self.state = JobState::Initialized;
        self.chunk = chunk;
        self.error = None;
        self.bio = Some(bio);
        self.target = Some(target);
    }

    /// Clear transient fields before the record returns to the pool.
    pub(crate) fn reset(&mut self) {
        self.state = JobState::Initialized;
        self.chunk = Chunk(0);
        self.error = None;
        self.bio = None;
        self.target = None;
    }
}

/// Worker entry point: drive one job to a terminal state.
pub(crate) fn process(mut job: Box<CowJob>) {
    let Some(target) = job.target.take() else {
        error!(target: "vcow::job", event = "job_without_target");
        return;
    };

    job.state = JobState::CopyingData;

    // Claim the chunk, or learn that a racing job already moved it to cow.
    // Exactly one job per chunk runs the copy; late duplicates must not
    // re-copy origin data over a chunk that newer writes already reached.
    if acquire_chunk(&target, job.chunk) {
        if let Err(err) = copy_chunk(&target, job.chunk) {
            release_chunk(&target, job.chunk);
            fail(&target, job, err);
            return;
        }

        job.state = JobState::UpdatingMetadata;
        let guard = target.bitmap.begin_update();
        let current = guard.current();
        // Re-test under the lock: exactly one job transitions a chunk from
        // clear to set.
        if !current.test(job.chunk) {
            let mut next = (*current).clone();
            next.set(job.chunk);

            job.state = JobState::PersistingMetadata;
            if let Err(err) = metadata::persist_bitmap_sector(target.cow.as_ref(), &next, job.chunk)
            {
                // The clone is discarded unpublished: published in-memory
                // state and the medium still agree the chunk is on origin.
                drop(guard);
                release_chunk(&target, job.chunk);
                fail(&target, job, err);
                return;
            }
            guard.publish(next);
        }
        drop(guard);
        release_chunk(&target, job.chunk);
    } else {
        trace!(
            target: "vcow::job",
            event = "cow_already_done",
            chunk = job.chunk.0,
        );
    }

    job.state = JobState::Completing;
    let Some(mut bio) = job.bio.take() else {
        error!(target: "vcow::job", event = "job_without_bio", chunk = job.chunk.0);
        release(&target, job);
        return;
    };
    let dest = cow_data_sector(bio.sector());
    bio.remap(Arc::clone(&target.cow), dest);
    submit(bio);

    trace!(target: "vcow::job", event = "cow_job_done", chunk = job.chunk.0);
    release(&target, job);
}

/// Claim exclusive copy rights for `chunk`.
///
/// Returns `true` when the caller owns the copy, `false` when the chunk is
/// already on cow. A job that finds another copy in flight waits for it;
/// if that copy succeeded the bit is set and the waiter short-circuits,
/// if it failed the waiter inherits the claim and retries the copy.
fn acquire_chunk(target: &TargetInner, chunk: Chunk) -> bool {
    let mut in_flight = target.in_flight.lock();
    loop {
        if target.bitmap.read().test(chunk) {
            return false;
        }
        if !in_flight.contains(&chunk) {
            in_flight.insert(chunk);
            return true;
        }
        target.copy_done.wait(&mut in_flight);
    }
}

fn release_chunk(target: &TargetInner, chunk: Chunk) {
    let mut in_flight = target.in_flight.lock();
    in_flight.remove(&chunk);
    drop(in_flight);
    target.copy_done.notify_all();
}

/// Copy one chunk's worth of data from origin to its slot on cow.
///
/// The write is write-through + FUA: the copy must be durable before the
/// bitmap bit that points at it is persisted.
fn copy_chunk(target: &TargetInner, chunk: Chunk) -> Result<()> {
    let mut page = vec![0_u8; CHUNK_BYTES];
    target.origin.read_sectors(chunk.origin_start(), &mut page)?;
    target
        .cow
        .write_sectors(chunk.cow_start(), &page, WriteMode::Fua)?;
    debug!(target: "vcow::job", event = "chunk_copied", chunk = chunk.0);
    Ok(())
}

fn fail(target: &Arc<TargetInner>, mut job: Box<CowJob>, err: VcowError) {
    warn!(
        target: "vcow::job",
        event = "cow_job_failed",
        chunk = job.chunk.0,
        state = ?job.state,
        error = %err,
    );
    job.state = JobState::Error;
    job.error = Some(err);
    if let Some(bio) = job.bio.take()
        && let Some(err) = job.error.take()
    {
        bio.fail(err);
    }
    release(target, job);
}

fn release(target: &Arc<TargetInner>, mut job: Box<CowJob>) {
    job.reset();
    target.job_pool.release(job);
}
