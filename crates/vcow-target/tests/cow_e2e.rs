#![forbid(unsafe_code)]
//! End-to-end behavior of the copy-on-write target over in-memory devices.

use crossbeam_channel::Receiver;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use vcow_block::{Bio, BioCompletion, MemSectorDevice, SectorDevice, WriteMode};
use vcow_error::{Result, VcowError};
use vcow_target::{CowTarget, MapOutcome, TargetConfig};
use vcow_types::{CHUNK_BYTES, METADATA_SECTORS, SECTOR_SIZE, Sector};

/// 8 chunks of origin, cow sized for metadata plus every chunk.
const ORIGIN_SECTORS: u64 = 64;
const COW_SECTORS: u64 = METADATA_SECTORS + ORIGIN_SECTORS;

fn activate(origin: &MemSectorDevice, cow: &MemSectorDevice) -> CowTarget {
    CowTarget::with_devices(
        Arc::new(origin.clone()),
        Arc::new(cow.clone()),
        ORIGIN_SECTORS,
        TargetConfig::default(),
    )
    .unwrap()
}

fn recv(rx: &Receiver<BioCompletion>) -> BioCompletion {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("bio completion timed out")
}

fn read_at(target: &CowTarget, sector: u64, len: usize) -> Vec<u8> {
    let (bio, rx) = Bio::read(Sector(sector), len);
    target.handle(bio);
    let done = recv(&rx);
    done.result.expect("read failed");
    done.data
}

fn write_at(target: &CowTarget, sector: u64, payload: Vec<u8>) {
    let (bio, rx) = Bio::write(Sector(sector), payload);
    target.handle(bio);
    recv(&rx).result.expect("write failed");
}

#[test]
fn fresh_activation_pure_read() {
    let origin = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = activate(&origin, &cow);

    let data = read_at(&target, 0, CHUNK_BYTES);
    assert_eq!(data, vec![0xAA_u8; CHUNK_BYTES]);

    let status = target.status();
    assert_eq!(status.chunks_on_cow, 0);
    assert_eq!(status.bitmap_updates, 0);
    // The cow device saw the metadata load but no data traffic.
    assert_eq!(cow.stats().writes(), 0);
}

#[test]
fn first_write_then_read() {
    let origin = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = activate(&origin, &cow);

    write_at(&target, 0, vec![0xBB_u8; CHUNK_BYTES]);

    // Chunk 0 now occupies cow sectors 8..=15, fully overwritten.
    for s in 8..16 {
        assert_eq!(
            cow.sector_contents(Sector(s)),
            vec![0xBB_u8; SECTOR_SIZE],
            "cow sector {s}"
        );
    }
    // Bit 0 of the persisted bitmap is set.
    assert_eq!(cow.sector_contents(Sector(0))[0], 0b0000_0001);
    // The origin was never written.
    assert_eq!(origin.stats().writes(), 0);
    assert_eq!(origin.sector_contents(Sector(0)), vec![0xAA_u8; SECTOR_SIZE]);
    // Copy and bitmap persist were both FUA; the guest write was not.
    assert_eq!(cow.stats().fua_writes(), 2);
    assert_eq!(cow.stats().writes(), 3);

    assert_eq!(read_at(&target, 0, CHUNK_BYTES), vec![0xBB_u8; CHUNK_BYTES]);
    assert_eq!(target.status().chunks_on_cow, 1);
}

#[test]
fn partial_write_preserves_rest_of_chunk() {
    let origin = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = activate(&origin, &cow);

    write_at(&target, 3, vec![0xCC_u8; SECTOR_SIZE]);

    // Cow data region: the pre-write copy everywhere except sector 11
    // (virtual sector 3 of chunk 0).
    for s in 8..16 {
        let expected = if s == 11 { 0xCC } else { 0xAA };
        assert_eq!(
            cow.sector_contents(Sector(s)),
            vec![expected; SECTOR_SIZE],
            "cow sector {s}"
        );
    }

    let mut expected = vec![0xAA_u8; CHUNK_BYTES];
    expected[3 * SECTOR_SIZE..4 * SECTOR_SIZE].fill(0xCC);
    assert_eq!(read_at(&target, 0, CHUNK_BYTES), expected);
}

#[test]
fn racing_writes_to_one_chunk_copy_once() {
    let origin = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = Arc::new(activate(&origin, &cow));

    let barrier = Arc::new(Barrier::new(2));
    let writers: Vec<_> = [(0_u64, 0x11_u8), (7, 0x22)]
        .into_iter()
        .map(|(sector, fill)| {
            let target = Arc::clone(&target);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let (bio, rx) = Bio::write(Sector(sector), vec![fill; SECTOR_SIZE]);
                target.handle(bio);
                recv(&rx).result.expect("racing write failed");
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    // Exactly one job copied the chunk and exactly one published the bit.
    assert_eq!(origin.stats().reads(), 1);
    assert_eq!(target.status().bitmap_updates, 1);
    assert_eq!(target.status().chunks_on_cow, 1);

    let mut expected = vec![0xAA_u8; CHUNK_BYTES];
    expected[..SECTOR_SIZE].fill(0x11);
    expected[7 * SECTOR_SIZE..].fill(0x22);
    assert_eq!(read_at(&target, 0, CHUNK_BYTES), expected);
}

#[test]
fn remap_is_direct_once_bit_is_set() {
    let origin = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = activate(&origin, &cow);

    write_at(&target, 8, vec![0xBB_u8; CHUNK_BYTES]);
    let updates_after_first = target.status().bitmap_updates;
    assert_eq!(updates_after_first, 1);

    // Later writes to the same chunk remap in place, no job, no new
    // bitmap update, same on-disk layout.
    let (bio, rx) = Bio::write(Sector(8), vec![0xDD_u8; CHUNK_BYTES]);
    match target.map(bio) {
        MapOutcome::Remapped(bio) => {
            // Chunk 1 starts at cow sector 8 + 8.
            assert_eq!(bio.sector(), Sector(16));
            vcow_block::submit(bio);
        }
        other => panic!("expected direct remap, got {other:?}"),
    }
    recv(&rx).result.expect("second write failed");

    assert_eq!(target.status().bitmap_updates, updates_after_first);
    assert_eq!(read_at(&target, 8, CHUNK_BYTES), vec![0xDD_u8; CHUNK_BYTES]);
}

#[test]
fn reads_and_writes_to_distinct_chunks_do_not_interfere() {
    let origin = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = activate(&origin, &cow);

    write_at(&target, 16, vec![0x33_u8; CHUNK_BYTES]);
    write_at(&target, 40, vec![0x44_u8; CHUNK_BYTES]);

    assert_eq!(read_at(&target, 0, CHUNK_BYTES), vec![0xAA_u8; CHUNK_BYTES]);
    assert_eq!(read_at(&target, 16, CHUNK_BYTES), vec![0x33_u8; CHUNK_BYTES]);
    assert_eq!(read_at(&target, 40, CHUNK_BYTES), vec![0x44_u8; CHUNK_BYTES]);
    assert_eq!(target.status().chunks_on_cow, 2);
}

// ── Job pool exhaustion ─────────────────────────────────────────────────────

/// Origin wrapper whose reads wait for a token, pinning copy jobs in
/// flight so the pool can be drained deterministically.
#[derive(Clone)]
struct GatedDevice {
    inner: MemSectorDevice,
    tokens: Receiver<()>,
}

impl SectorDevice for GatedDevice {
    fn len_sectors(&self) -> u64 {
        self.inner.len_sectors()
    }

    fn read_sectors(&self, start: Sector, buf: &mut [u8]) -> Result<()> {
        self.tokens.recv().expect("gate closed");
        self.inner.read_sectors(start, buf)
    }

    fn write_sectors(&self, start: Sector, buf: &[u8], mode: WriteMode) -> Result<()> {
        self.inner.write_sectors(start, buf, mode)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[test]
fn exhausted_job_pool_kills_the_write_without_blocking() {
    let origin_mem = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let origin = GatedDevice {
        inner: origin_mem,
        tokens: gate_rx,
    };
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = CowTarget::with_devices(
        Arc::new(origin),
        Arc::new(cow.clone()),
        ORIGIN_SECTORS,
        TargetConfig {
            job_pool_capacity: 1,
            worker_threads: 1,
        },
    )
    .unwrap();

    // First write claims the only job record and parks in the gated copy.
    let (first, first_rx) = Bio::write(Sector(0), vec![0x55_u8; SECTOR_SIZE]);
    assert!(matches!(target.map(first), MapOutcome::Submitted));

    // Second first-write finds the pool empty and is killed immediately.
    let (second, second_rx) = Bio::write(Sector(8), vec![0x66_u8; SECTOR_SIZE]);
    match target.map(second) {
        MapOutcome::Kill(bio, err) => {
            assert!(matches!(err, VcowError::ResourceExhausted("job pool")));
            // Exhaustion is confined to the one rejected request.
            assert!(err.is_request_local());
            bio.fail(err);
        }
        other => panic!("expected kill on exhausted pool, got {other:?}"),
    }
    assert!(second_rx.recv_timeout(Duration::from_secs(10)).unwrap().result.is_err());

    // Release the gate; the parked job finishes normally and its record
    // returns to the pool.
    gate_tx.send(()).unwrap();
    recv(&first_rx).result.expect("gated write failed");
    wait_for_free_records(&target, 1);
}

/// The job record returns to the pool just after the bio completes; give
/// the worker a moment to put it back.
fn wait_for_free_records(target: &CowTarget, want: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if target.status().free_job_records == want {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(target.status().free_job_records, want, "pool did not refill");
}

// ── Teardown ────────────────────────────────────────────────────────────────

#[test]
fn shutdown_quiesces_in_flight_jobs() {
    let origin = MemSectorDevice::filled(ORIGIN_SECTORS, 0xAA);
    let cow = MemSectorDevice::new(COW_SECTORS);
    let target = activate(&origin, &cow);

    let mut completions = Vec::new();
    for chunk in 0..8_u64 {
        let (bio, rx) = Bio::write(Sector(chunk * 8), vec![0x77_u8; SECTOR_SIZE]);
        target.handle(bio);
        completions.push(rx);
    }

    // Drains every queued job before releasing anything.
    target.shutdown();

    for rx in completions {
        recv(&rx).result.expect("write failed during shutdown");
    }
    // All eight chunks reached the cow device and their bits are durable.
    let bitmap_sector = cow.sector_contents(Sector(0));
    assert_eq!(bitmap_sector[0], 0xFF);
}
