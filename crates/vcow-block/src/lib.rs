#![forbid(unsafe_code)]
//! Block-layer collaborator surface for the vcow target.
//!
//! Provides the `SectorDevice` trait (synchronous sector-granular I/O with
//! optional write-through + FUA durability), file-backed and in-memory
//! devices, and the `Bio` request type with its submission and completion
//! plumbing. The target core only rewrites a bio's device binding and start
//! sector; payload buffers stay owned by the bio until completion hands them
//! back to the submitter.

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, trace};
use vcow_error::{Result, VcowError};
use vcow_types::{SECTOR_SHIFT, SECTOR_SIZE, Sector};

/// Durability mode for a sector write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Completion may be acknowledged from a volatile cache.
    Posted,
    /// Write-through with forced unit access: the bytes are on durable
    /// media before the call returns.
    Fua,
}

/// Synchronous sector-granular I/O interface.
///
/// Buffers must be a whole number of sectors; implementations reject
/// out-of-range accesses rather than truncating them.
pub trait SectorDevice: Send + Sync {
    /// Total device length in sectors.
    fn len_sectors(&self) -> u64;

    /// Read `buf.len() / 512` sectors starting at `start` into `buf`.
    fn read_sectors(&self, start: Sector, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` starting at `start`. `WriteMode::Fua` guarantees
    /// the data is durable before returning.
    fn write_sectors(&self, start: Sector, buf: &[u8], mode: WriteMode) -> Result<()>;

    /// Flush any posted writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(len_sectors: u64, start: Sector, buf_len: usize) -> Result<u64> {
    if buf_len % SECTOR_SIZE != 0 {
        return Err(VcowError::InvalidArgument(format!(
            "buffer length {buf_len} is not a multiple of the sector size"
        )));
    }
    let sectors = (buf_len / SECTOR_SIZE) as u64;
    let end = start
        .0
        .checked_add(sectors)
        .ok_or(VcowError::OutOfBounds {
            sector: start.0,
            len_sectors,
        })?;
    if end > len_sectors {
        return Err(VcowError::OutOfBounds {
            sector: start.0,
            len_sectors,
        });
    }
    Ok(sectors)
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed sector device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared seek
/// position, so one handle serves concurrent submitters and workers. FUA
/// writes are realized as `write_all_at` followed by `sync_data`.
#[derive(Debug, Clone)]
pub struct FileSectorDevice {
    file: Arc<File>,
    len_sectors: u64,
    writable: bool,
}

impl FileSectorDevice {
    /// Open a device image read-write, falling back to read-only.
    ///
    /// The image length must be a whole number of sectors.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            return Err(VcowError::InvalidArgument(format!(
                "device image length {len} is not sector-aligned"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            len_sectors: len / SECTOR_SIZE as u64,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl SectorDevice for FileSectorDevice {
    fn len_sectors(&self) -> u64 {
        self.len_sectors
    }

    fn read_sectors(&self, start: Sector, buf: &mut [u8]) -> Result<()> {
        check_range(self.len_sectors, start, buf.len())?;
        self.file.read_exact_at(buf, start.0 << SECTOR_SHIFT)?;
        Ok(())
    }

    fn write_sectors(&self, start: Sector, buf: &[u8], mode: WriteMode) -> Result<()> {
        check_range(self.len_sectors, start, buf.len())?;
        if !self.writable {
            return Err(VcowError::InvalidArgument(
                "device is read-only".to_owned(),
            ));
        }
        self.file.write_all_at(buf, start.0 << SECTOR_SHIFT)?;
        if mode == WriteMode::Fua {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

/// Monotonic I/O counters kept by [`MemSectorDevice`].
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub fua_writes: AtomicU64,
    pub sectors_read: AtomicU64,
    pub sectors_written: AtomicU64,
}

impl DeviceStats {
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn fua_writes(&self) -> u64 {
        self.fua_writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

/// In-memory sector device for tests and benchmarks.
///
/// Clones share the same backing store, so a clone can stand in for the
/// same physical medium across a simulated crash and re-activation.
#[derive(Debug, Clone)]
pub struct MemSectorDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    stats: Arc<DeviceStats>,
}

impl MemSectorDevice {
    /// Create a zero-filled device of `len_sectors` sectors.
    #[must_use]
    pub fn new(len_sectors: u64) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len_sectors as usize * SECTOR_SIZE])),
            stats: Arc::new(DeviceStats::default()),
        }
    }

    /// Create a device filled with `fill`.
    #[must_use]
    pub fn filled(len_sectors: u64, fill: u8) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![fill; len_sectors as usize * SECTOR_SIZE])),
            stats: Arc::new(DeviceStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Copy of one sector's contents, for assertions.
    #[must_use]
    pub fn sector_contents(&self, sector: Sector) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let start = sector.0 as usize * SECTOR_SIZE;
        bytes[start..start + SECTOR_SIZE].to_vec()
    }
}

impl SectorDevice for MemSectorDevice {
    fn len_sectors(&self) -> u64 {
        (self.bytes.lock().len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&self, start: Sector, buf: &mut [u8]) -> Result<()> {
        let sectors = check_range(self.len_sectors(), start, buf.len())?;
        let bytes = self.bytes.lock();
        let offset = start.0 as usize * SECTOR_SIZE;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        drop(bytes);
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        self.stats.sectors_read.fetch_add(sectors, Ordering::SeqCst);
        Ok(())
    }

    fn write_sectors(&self, start: Sector, buf: &[u8], mode: WriteMode) -> Result<()> {
        let sectors = check_range(self.len_sectors(), start, buf.len())?;
        let mut bytes = self.bytes.lock();
        let offset = start.0 as usize * SECTOR_SIZE;
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        drop(bytes);
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        if mode == WriteMode::Fua {
            self.stats.fua_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.stats
            .sectors_written
            .fetch_add(sectors, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Bio ─────────────────────────────────────────────────────────────────────

/// Transfer direction of a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioDir {
    Read,
    Write,
}

/// Completion record handed back to the submitter.
///
/// `data` returns buffer ownership: for reads it holds the bytes read, for
/// writes it is the original payload.
#[derive(Debug)]
pub struct BioCompletion {
    pub result: Result<()>,
    pub data: Vec<u8>,
}

impl BioCompletion {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// An in-flight block request.
///
/// A bio starts out addressed in virtual-device coordinates with no device
/// binding. The target's mapper rewrites `sector` and binds `dev` via
/// [`Bio::remap`]; [`submit`] then executes it against the bound device and
/// delivers a [`BioCompletion`] to the channel created with the bio.
pub struct Bio {
    dir: BioDir,
    sector: Sector,
    data: Vec<u8>,
    mode: WriteMode,
    dev: Option<Arc<dyn SectorDevice>>,
    completion: Sender<BioCompletion>,
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("dir", &self.dir)
            .field("sector", &self.sector)
            .field("len_bytes", &self.data.len())
            .field("bound", &self.dev.is_some())
            .finish_non_exhaustive()
    }
}

impl Bio {
    /// Create a read bio for `len_bytes` bytes at virtual sector `sector`.
    #[must_use]
    pub fn read(sector: Sector, len_bytes: usize) -> (Self, Receiver<BioCompletion>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                dir: BioDir::Read,
                sector,
                data: vec![0_u8; len_bytes],
                mode: WriteMode::Posted,
                dev: None,
                completion: tx,
            },
            rx,
        )
    }

    /// Create a write bio carrying `payload` at virtual sector `sector`.
    #[must_use]
    pub fn write(sector: Sector, payload: Vec<u8>) -> (Self, Receiver<BioCompletion>) {
        Self::write_with_mode(sector, payload, WriteMode::Posted)
    }

    /// Create a write bio with an explicit durability mode.
    #[must_use]
    pub fn write_with_mode(
        sector: Sector,
        payload: Vec<u8>,
        mode: WriteMode,
    ) -> (Self, Receiver<BioCompletion>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                dir: BioDir::Write,
                sector,
                data: payload,
                mode,
                dev: None,
                completion: tx,
            },
            rx,
        )
    }

    #[must_use]
    pub fn dir(&self) -> BioDir {
        self.dir
    }

    /// Current start sector (virtual until remapped, then device-local).
    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn len_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    /// Whether this bio crosses a chunk boundary. The host framework is
    /// told to split requests at `CHUNK_SECTORS`, so a spanning bio is a
    /// contract violation and is rejected by the mapper.
    #[must_use]
    pub fn spans_chunk_boundary(&self) -> bool {
        let last = self.sector.0 + self.len_sectors().saturating_sub(1);
        self.sector.chunk() != Sector(last).chunk()
    }

    /// Rebind this bio to `dev` at device-local `sector`.
    pub fn remap(&mut self, dev: Arc<dyn SectorDevice>, sector: Sector) {
        trace!(
            target: "vcow::block",
            event = "bio_remap",
            from = self.sector.0,
            to = sector.0,
        );
        self.sector = sector;
        self.dev = Some(dev);
    }

    /// Complete the bio with an error, returning buffer ownership.
    pub fn fail(self, err: VcowError) {
        let _ = self.completion.send(BioCompletion {
            result: Err(err),
            data: self.data,
        });
    }

    fn complete(self, result: Result<()>) {
        let _ = self.completion.send(BioCompletion {
            result,
            data: self.data,
        });
    }
}

/// Execute a remapped bio against its bound device and complete it.
///
/// The `submit_bio` analog: by the time a bio reaches here it is an
/// ordinary single-device request. Unbound bios complete with an error.
pub fn submit(mut bio: Bio) {
    let Some(dev) = bio.dev.take() else {
        error!(target: "vcow::block", event = "bio_unbound", sector = bio.sector.0);
        bio.fail(VcowError::InvalidArgument(
            "bio submitted without a device binding".to_owned(),
        ));
        return;
    };
    let result = match bio.dir {
        BioDir::Read => dev.read_sectors(bio.sector, &mut bio.data),
        BioDir::Write => dev.write_sectors(bio.sector, &bio.data, bio.mode),
    };
    bio.complete(result);
}
