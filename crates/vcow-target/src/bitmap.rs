//! The chunk redirection bitmap.
//!
//! One bit per chunk: set means the chunk's authoritative copy lives on the
//! cow device, clear means it still lives on the origin. The byte buffer is
//! rounded up to whole sectors so the loader and persister can move full
//! 512-byte sectors without overrunning it.
//!
//! Bit ordering is LSB-first: bit `i` lives in byte `i / 8` at position
//! `i % 8`. This matches the on-disk layout of the reserved region.

use vcow_error::{Result, VcowError};
use vcow_types::{Chunk, MAX_CHUNKS, SECTOR_SIZE};

/// In-memory image of the on-disk redirection bitmap.
///
/// Snapshots handed to readers are immutable; mutation happens on a private
/// clone which is then published wholesale (see [`crate::publish`]).
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    nr_chunks: u64,
    bytes: Vec<u8>,
}

impl ChunkBitmap {
    /// Allocate an all-clear bitmap for `nr_chunks` chunks.
    ///
    /// Fails when the bitmap would not fit the reserved metadata region
    /// (more than [`MAX_CHUNKS`] chunks, i.e. a target over 128 MiB).
    pub fn new(nr_chunks: u64) -> Result<Self> {
        if nr_chunks > MAX_CHUNKS {
            return Err(VcowError::TargetTooLarge {
                chunks: nr_chunks,
                max: MAX_CHUNKS,
            });
        }
        let byte_len = nr_chunks.div_ceil(8) as usize;
        let rounded = byte_len.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        Ok(Self {
            nr_chunks,
            bytes: vec![0_u8; rounded],
        })
    }

    #[must_use]
    pub fn nr_chunks(&self) -> u64 {
        self.nr_chunks
    }

    /// Whether `chunk` currently resides on the cow device.
    #[must_use]
    pub fn test(&self, chunk: Chunk) -> bool {
        let byte = (chunk.0 / 8) as usize;
        if byte >= self.bytes.len() {
            return false;
        }
        (self.bytes[byte] >> (chunk.0 % 8)) & 1 == 1
    }

    /// Mark `chunk` as residing on the cow device.
    pub(crate) fn set(&mut self, chunk: Chunk) {
        let byte = (chunk.0 / 8) as usize;
        if byte < self.bytes.len() {
            self.bytes[byte] |= 1 << (chunk.0 % 8);
        }
    }

    /// Number of sectors the loader must read to cover the bitmap.
    #[must_use]
    pub fn metadata_sectors(&self) -> u64 {
        (self.bytes.len() / SECTOR_SIZE) as u64
    }

    /// The 512-byte slice backing bitmap sector `sector_index`.
    #[must_use]
    pub fn sector_bytes(&self, sector_index: u64) -> &[u8] {
        let start = sector_index as usize * SECTOR_SIZE;
        &self.bytes[start..start + SECTOR_SIZE]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Count of chunks currently redirected to the cow device.
    #[must_use]
    pub fn count_set(&self) -> u64 {
        let full_bytes = (self.nr_chunks / 8) as usize;
        let mut set: u64 = self.bytes[..full_bytes]
            .iter()
            .map(|b| u64::from(b.count_ones()))
            .sum();
        let remainder = self.nr_chunks % 8;
        if remainder > 0 && full_bytes < self.bytes.len() {
            let byte = self.bytes[full_bytes];
            for bit in 0..remainder {
                set += u64::from((byte >> bit) & 1);
            }
        }
        set
    }
}
