#![forbid(unsafe_code)]
//! Shared unit types and address arithmetic for the vcow target.
//!
//! The geometry is fixed by the on-disk format: 512-byte sectors, 8-sector
//! (4 KiB) chunks, and an 8-sector reserved metadata region at the start of
//! the cow device. All address translation between the virtual device, the
//! origin device, and the cow device lives here as pure functions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// log2 of [`SECTOR_SIZE`].
pub const SECTOR_SHIFT: u32 = 9;

/// Sectors per chunk. A chunk is the unit of copy-on-write.
pub const CHUNK_SECTORS: u64 = 8;

/// log2 of [`CHUNK_SECTORS`].
pub const CHUNK_SHIFT: u32 = 3;

/// Bytes per chunk (4 KiB).
pub const CHUNK_BYTES: usize = CHUNK_SECTORS as usize * SECTOR_SIZE;

/// Sectors reserved at the start of the cow device for the bitmap.
/// Chunk data begins at this sector.
pub const METADATA_SECTORS: u64 = 8;

/// Bits covered by one 512-byte bitmap sector.
pub const BITS_PER_SECTOR: u64 = SECTOR_SIZE as u64 * 8;

/// Largest supported target: the bitmap must fit in the reserved region,
/// so at most `METADATA_SECTORS * BITS_PER_SECTOR` chunks (128 MiB).
pub const MAX_CHUNKS: u64 = METADATA_SECTORS * BITS_PER_SECTOR;

/// A 512-byte sector address.
///
/// Which device the address refers to (virtual, origin, or cow) is
/// positional: the translation functions below are the only way an address
/// changes coordinate systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(pub u64);

/// A chunk index on the virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Chunk(pub u64);

impl Sector {
    /// Chunk containing this sector.
    #[must_use]
    pub fn chunk(self) -> Chunk {
        Chunk(self.0 >> CHUNK_SHIFT)
    }

    /// Sector offset within its chunk (0..8).
    #[must_use]
    pub fn offset_in_chunk(self) -> u64 {
        self.0 & (CHUNK_SECTORS - 1)
    }

    /// Byte offset of this sector on its device, `None` on overflow.
    #[must_use]
    pub fn byte_offset(self) -> Option<u64> {
        self.0.checked_mul(SECTOR_SIZE as u64)
    }
}

impl Chunk {
    /// First sector of this chunk on the origin device (identity mapped).
    #[must_use]
    pub fn origin_start(self) -> Sector {
        Sector(self.0 << CHUNK_SHIFT)
    }

    /// First sector of this chunk's copy on the cow device, past the
    /// reserved metadata region.
    #[must_use]
    pub fn cow_start(self) -> Sector {
        Sector(METADATA_SECTORS + (self.0 << CHUNK_SHIFT))
    }

    /// Index of the 512-byte bitmap sector holding this chunk's bit.
    #[must_use]
    pub fn bitmap_sector(self) -> u64 {
        self.0 / BITS_PER_SECTOR
    }

    /// Whether this chunk lies inside a target with `nr_chunks` chunks.
    #[must_use]
    pub fn in_bounds(self, nr_chunks: u64) -> bool {
        self.0 < nr_chunks
    }
}

/// Translate a virtual-device sector to its location on the cow device.
#[must_use]
pub fn cow_data_sector(virt: Sector) -> Sector {
    Sector(virt.chunk().cow_start().0 + virt.offset_in_chunk())
}

/// Number of chunks needed to cover `len_sectors` sectors.
#[must_use]
pub fn chunks_for_sectors(len_sectors: u64) -> u64 {
    len_sectors.div_ceil(CHUNK_SECTORS)
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
