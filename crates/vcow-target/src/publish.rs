//! Lock-free publication of the redirection bitmap.
//!
//! Readers on the mapping hot path load the current snapshot through
//! [`arc_swap::ArcSwap`] without taking any lock; the returned guard is the
//! read-side critical section, and a snapshot's backing memory is reclaimed
//! only after the last guard or `Arc` referencing it has been dropped.
//!
//! Writers are serialized by a mutex. A mutation clones the current
//! snapshot (at most 4 KiB), flips the bit on the clone, persists the
//! changed sector, and only then publishes the clone. Readers that loaded
//! the old snapshot keep seeing it until they drop their guard; readers
//! that load after `publish` see the new one.

use crate::bitmap::ChunkBitmap;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// The published bitmap cell: one per target.
#[derive(Debug)]
pub struct PublishedBitmap {
    current: ArcSwap<ChunkBitmap>,
    write_lock: Mutex<()>,
    updates: AtomicU64,
}

impl PublishedBitmap {
    #[must_use]
    pub fn new(initial: ChunkBitmap) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            write_lock: Mutex::new(()),
            updates: AtomicU64::new(0),
        }
    }

    /// Enter a read-side critical section and return the current snapshot.
    ///
    /// Lock-free; the guard must not be held across blocking operations.
    #[inline]
    pub fn read(&self) -> arc_swap::Guard<Arc<ChunkBitmap>> {
        self.current.load()
    }

    /// Load the current snapshot as a full `Arc`, for holders that outlive
    /// a guard's intended scope.
    #[must_use]
    pub fn load_full(&self) -> Arc<ChunkBitmap> {
        self.current.load_full()
    }

    /// Acquire the write side. All mutation and the paired metadata
    /// persistence happen under this one guard, so test-and-set against the
    /// current snapshot is atomic with respect to other writers.
    pub fn begin_update(&self) -> BitmapWriteGuard<'_> {
        BitmapWriteGuard {
            owner: self,
            _lock: self.write_lock.lock(),
        }
    }

    /// Number of published updates since activation.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

/// Write-side guard over the published bitmap.
pub struct BitmapWriteGuard<'a> {
    owner: &'a PublishedBitmap,
    _lock: MutexGuard<'a, ()>,
}

impl BitmapWriteGuard<'_> {
    /// The snapshot current at this point in the write critical section.
    /// No concurrent writer can replace it while the guard is held.
    #[must_use]
    pub fn current(&self) -> Arc<ChunkBitmap> {
        self.owner.current.load_full()
    }

    /// Atomically publish `next` as the new snapshot. The previous snapshot
    /// is retired and reclaimed once its remaining readers drop out.
    pub fn publish(&self, next: ChunkBitmap) {
        self.owner.current.store(Arc::new(next));
        let count = self.owner.updates.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            target: "vcow::publish",
            event = "bitmap_published",
            update_count = count,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use vcow_types::Chunk;

    fn bitmap(nr_chunks: u64) -> ChunkBitmap {
        ChunkBitmap::new(nr_chunks).unwrap()
    }

    #[test]
    fn readers_see_published_updates() {
        let cell = PublishedBitmap::new(bitmap(64));
        assert!(!cell.read().test(Chunk(5)));

        let guard = cell.begin_update();
        let mut next = (*guard.current()).clone();
        next.set(Chunk(5));
        guard.publish(next);
        drop(guard);

        assert!(cell.read().test(Chunk(5)));
        assert_eq!(cell.update_count(), 1);
    }

    #[test]
    fn old_snapshot_stays_valid_for_in_flight_readers() {
        let cell = PublishedBitmap::new(bitmap(64));
        let before = cell.load_full();

        let guard = cell.begin_update();
        let mut next = (*guard.current()).clone();
        next.set(Chunk(0));
        guard.publish(next);
        drop(guard);

        // The retired snapshot is still readable and unchanged.
        assert!(!before.test(Chunk(0)));
        assert!(cell.read().test(Chunk(0)));
    }

    #[test]
    fn concurrent_readers_never_observe_torn_state() {
        let cell = Arc::new(PublishedBitmap::new(bitmap(512)));
        let barrier = Arc::new(Barrier::new(5));

        let writer = {
            let cell = Arc::clone(&cell);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..512 {
                    let guard = cell.begin_update();
                    let mut next = (*guard.current()).clone();
                    next.set(Chunk(i));
                    guard.publish(next);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut prev = 0_u64;
                    for _ in 0..2_000 {
                        let snap = cell.read();
                        let count = snap.count_set();
                        // Single writer setting bits monotonically: a
                        // snapshot can never show fewer set bits than an
                        // earlier one.
                        assert!(count >= prev, "set count regressed: {count} < {prev}");
                        prev = count;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cell.read().count_set(), 512);
    }

    #[test]
    fn write_guard_serializes_test_and_set() {
        let cell = Arc::new(PublishedBitmap::new(bitmap(64)));
        let winners = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let winners = Arc::clone(&winners);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let guard = cell.begin_update();
                    if !guard.current().test(Chunk(7)) {
                        let mut next = (*guard.current()).clone();
                        next.set(Chunk(7));
                        guard.publish(next);
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(cell.update_count(), 1);
    }
}
