//! Target lifecycle and the request-mapping hot path.
//!
//! A [`CowTarget`] composes one origin device and one cow device into a
//! writable virtual device. The mapper decides, per bio, whether the data
//! lives on origin or cow; first writes to untouched chunks are handed to
//! the worker pool as copy-on-write jobs and complete asynchronously.

use crate::bitmap::ChunkBitmap;
use crate::metadata;
use crate::pool::JobPool;
use crate::publish::PublishedBitmap;
use crate::worker::WorkerPool;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use vcow_block::{Bio, BioDir, FileSectorDevice, SectorDevice, submit};
use vcow_error::{Result, VcowError};
use vcow_types::{CHUNK_SECTORS, Chunk, chunks_for_sectors, cow_data_sector};

/// Tunables fixed at activation.
#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    /// Pre-allocated job records; also the worker queue depth. One record
    /// per in-flight first write.
    pub job_pool_capacity: usize,
    /// Worker threads executing copy-on-write jobs.
    pub worker_threads: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            job_pool_capacity: 256,
            worker_threads: 4,
        }
    }
}

impl TargetConfig {
    pub fn validate(self) -> Result<Self> {
        if self.job_pool_capacity == 0 {
            return Err(VcowError::InvalidArgument(
                "job_pool_capacity must be at least 1".to_owned(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(VcowError::InvalidArgument(
                "worker_threads must be at least 1".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Mapper verdict for one bio, the contract with the dispatching framework.
#[derive(Debug)]
pub enum MapOutcome {
    /// The bio has been rewritten in place; the caller re-dispatches it.
    Remapped(Bio),
    /// The target took ownership; the bio completes asynchronously.
    Submitted,
    /// The bio is rejected; the caller fails it with the given error.
    Kill(Bio, VcowError),
}

/// Point-in-time counters for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetStatus {
    pub len_sectors: u64,
    pub nr_chunks: u64,
    pub chunks_on_cow: u64,
    pub bitmap_updates: u64,
    pub free_job_records: usize,
}

/// State shared between the mapper and in-flight jobs.
///
/// Jobs hold this via `Arc`, so device handles outlive every job by
/// construction. Field order is teardown order: the published bitmap is
/// retired before the job pool, and the devices are released last.
pub(crate) struct TargetInner {
    pub(crate) len_sectors: u64,
    pub(crate) nr_chunks: u64,
    pub(crate) bitmap: PublishedBitmap,
    /// Chunks whose copy is currently running; at most one job copies a
    /// given chunk at a time.
    pub(crate) in_flight: Mutex<HashSet<Chunk>>,
    pub(crate) copy_done: Condvar,
    pub(crate) job_pool: JobPool,
    pub(crate) origin: Arc<dyn SectorDevice>,
    pub(crate) cow: Arc<dyn SectorDevice>,
}

/// An active copy-on-write virtual device.
pub struct CowTarget {
    inner: Arc<TargetInner>,
    workers: WorkerPool,
}

impl std::fmt::Debug for CowTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowTarget").finish()
    }
}

impl CowTarget {
    /// Largest request, in sectors, the framework may pass to [`map`].
    /// Declared so no bio ever spans a chunk boundary.
    ///
    /// [`map`]: CowTarget::map
    pub const MAX_IO_SECTORS: u64 = CHUNK_SECTORS;

    /// Activate a target from framework argument tokens:
    /// `<origin_path> <cow_path>`, exactly two. The virtual device length
    /// is the origin image length.
    pub fn activate(args: &[&str], config: TargetConfig) -> Result<Self> {
        if args.len() != 2 {
            return Err(VcowError::InvalidArgument(
                "Invalid argument count".to_owned(),
            ));
        }
        let origin = FileSectorDevice::open(args[0])?;
        let cow = FileSectorDevice::open(args[1])?;
        let len_sectors = origin.len_sectors();
        Self::with_devices(Arc::new(origin), Arc::new(cow), len_sectors, config)
    }

    /// Activate over already-open devices, exposing `len_sectors` sectors.
    ///
    /// The cow device must hold either a bitmap previously written by this
    /// target or zeroes; zero-filled metadata means every chunk still reads
    /// from the origin.
    pub fn with_devices(
        origin: Arc<dyn SectorDevice>,
        cow: Arc<dyn SectorDevice>,
        len_sectors: u64,
        config: TargetConfig,
    ) -> Result<Self> {
        let config = config.validate()?;
        let nr_chunks = chunks_for_sectors(len_sectors);

        let mut bitmap = ChunkBitmap::new(nr_chunks)?;
        metadata::load_bitmap(cow.as_ref(), &mut bitmap)?;

        let job_pool = JobPool::new(config.job_pool_capacity);
        let workers = WorkerPool::spawn(config.worker_threads, config.job_pool_capacity)?;

        let chunks_on_cow = bitmap.count_set();
        let inner = Arc::new(TargetInner {
            len_sectors,
            nr_chunks,
            bitmap: PublishedBitmap::new(bitmap),
            in_flight: Mutex::new(HashSet::new()),
            copy_done: Condvar::new(),
            job_pool,
            origin,
            cow,
        });
        info!(
            target: "vcow::target",
            event = "target_activated",
            len_sectors,
            nr_chunks,
            chunks_on_cow,
            job_pool_capacity = config.job_pool_capacity,
            worker_threads = config.worker_threads,
        );
        Ok(Self { inner, workers })
    }

    /// Map one bio: the hot path.
    ///
    /// Wait-free aside from one snapshot load and one pool pop; never
    /// performs I/O and never blocks. The read-side critical section is
    /// held from the bit test through job enqueue, so the decision is
    /// atomic with respect to the snapshot it was made against.
    pub fn map(&self, mut bio: Bio) -> MapOutcome {
        let chunk = bio.sector().chunk();
        if !chunk.in_bounds(self.inner.nr_chunks) {
            error!(
                target: "vcow::target",
                event = "map_out_of_bounds",
                sector = bio.sector().0,
            );
            let sector = bio.sector().0;
            return MapOutcome::Kill(
                bio,
                VcowError::OutOfBounds {
                    sector,
                    len_sectors: self.inner.len_sectors,
                },
            );
        }
        if bio.spans_chunk_boundary() {
            error!(
                target: "vcow::target",
                event = "map_spans_chunk",
                sector = bio.sector().0,
                sectors = bio.len_sectors(),
            );
            let sector = bio.sector().0;
            let sectors = bio.len_sectors();
            return MapOutcome::Kill(
                bio,
                VcowError::SpansChunkBoundary { sector, sectors },
            );
        }

        let snapshot = self.inner.bitmap.read();

        if snapshot.test(chunk) {
            // Chunk already lives on cow: redirect reads and writes alike.
            let dest = cow_data_sector(bio.sector());
            bio.remap(Arc::clone(&self.inner.cow), dest);
            return MapOutcome::Remapped(bio);
        }

        if bio.dir() == BioDir::Read {
            // Untouched chunk: the origin still holds it, identity-mapped.
            let sector = bio.sector();
            bio.remap(Arc::clone(&self.inner.origin), sector);
            return MapOutcome::Remapped(bio);
        }

        // First write to an untouched chunk: hand it to a worker. The
        // snapshot guard stays held across allocation and enqueue.
        let Some(mut job) = self.inner.job_pool.try_acquire() else {
            warn!(
                target: "vcow::target",
                event = "job_pool_exhausted",
                chunk = chunk.0,
            );
            return MapOutcome::Kill(bio, VcowError::ResourceExhausted("job pool"));
        };
        job.arm(Arc::clone(&self.inner), bio, chunk);

        match self.workers.enqueue(job) {
            Ok(()) => {
                drop(snapshot);
                MapOutcome::Submitted
            }
            Err(mut job) => {
                let killed = job.bio.take();
                job.reset();
                self.inner.job_pool.release(job);
                let Some(bio) = killed else {
                    error!(target: "vcow::target", event = "unqueued_job_lost_bio");
                    return MapOutcome::Submitted;
                };
                MapOutcome::Kill(bio, VcowError::ShuttingDown)
            }
        }
    }

    /// Map and dispatch in one step: remapped bios are submitted to their
    /// device, killed bios are failed. The convenience entry point for
    /// hosts without their own dispatch loop.
    pub fn handle(&self, bio: Bio) {
        match self.map(bio) {
            MapOutcome::Remapped(bio) => submit(bio),
            MapOutcome::Submitted => {}
            MapOutcome::Kill(bio, err) => bio.fail(err),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn status(&self) -> TargetStatus {
        let snapshot = self.inner.bitmap.read();
        TargetStatus {
            len_sectors: self.inner.len_sectors,
            nr_chunks: self.inner.nr_chunks,
            chunks_on_cow: snapshot.count_set(),
            bitmap_updates: self.inner.bitmap.update_count(),
            free_job_records: self.inner.job_pool.available(),
        }
    }

    #[must_use]
    pub fn len_sectors(&self) -> u64 {
        self.inner.len_sectors
    }

    /// Tear the target down: drain workers to quiescence, then release the
    /// bitmap, the job pool, and finally the device handles.
    pub fn shutdown(mut self) {
        self.workers.drain();
        info!(target: "vcow::target", event = "target_shut_down");
    }
}

impl Drop for CowTarget {
    fn drop(&mut self) {
        // Quiesce before any shared state is released; the remaining
        // teardown order is the field order of `TargetInner`.
        self.workers.drain();
    }
}
