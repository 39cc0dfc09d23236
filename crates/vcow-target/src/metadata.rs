//! Loading and persisting the redirection bitmap.
//!
//! The bitmap occupies the reserved region at the start of the cow device
//! (sectors 0..8). The loader reads it back wholesale at activation; the
//! persister writes exactly the one 512-byte sector whose bit changed,
//! write-through + FUA, bounding metadata write amplification to one sector
//! per first touch of a chunk.

use crate::bitmap::ChunkBitmap;
use tracing::{debug, error};
use vcow_block::{SectorDevice, WriteMode};
use vcow_error::{Result, VcowError};
use vcow_types::{Chunk, METADATA_SECTORS, SECTOR_SIZE, Sector};

/// Read the persisted bitmap from the cow device's reserved region.
///
/// `bitmap` must already be allocated (and therefore zeroed) for the
/// target's chunk count; a cow device that has never been written keeps the
/// bitmap all-clear, so every chunk reads from the origin.
pub fn load_bitmap(cow: &dyn SectorDevice, bitmap: &mut ChunkBitmap) -> Result<()> {
    let sectors = bitmap.metadata_sectors();
    if sectors > METADATA_SECTORS {
        error!(
            target: "vcow::metadata",
            event = "bitmap_oversized",
            sectors,
            max = METADATA_SECTORS,
        );
        return Err(VcowError::MetadataTooLarge {
            sectors,
            max: METADATA_SECTORS,
        });
    }
    if sectors == 0 {
        return Ok(());
    }

    let len = sectors as usize * SECTOR_SIZE;
    cow.read_sectors(Sector(0), &mut bitmap.bytes_mut()[..len])?;
    debug!(
        target: "vcow::metadata",
        event = "bitmap_loaded",
        sectors,
        chunks_on_cow = bitmap.count_set(),
    );
    Ok(())
}

/// Durably write the one bitmap sector containing `chunk`'s bit.
///
/// Callers hold the write-side lock, so no concurrent persister can touch
/// the same sector. The write returns only once the sector is on durable
/// media.
pub fn persist_bitmap_sector(
    cow: &dyn SectorDevice,
    bitmap: &ChunkBitmap,
    chunk: Chunk,
) -> Result<()> {
    let sector_index = chunk.bitmap_sector();
    if sector_index >= METADATA_SECTORS {
        error!(
            target: "vcow::metadata",
            event = "bitmap_sector_out_of_bounds",
            sector = sector_index,
            chunk = chunk.0,
        );
        return Err(VcowError::MetadataSectorOutOfBounds {
            sector: sector_index,
            max: METADATA_SECTORS,
        });
    }

    cow.write_sectors(
        Sector(sector_index),
        bitmap.sector_bytes(sector_index),
        WriteMode::Fua,
    )?;
    debug!(
        target: "vcow::metadata",
        event = "bitmap_sector_persisted",
        sector = sector_index,
        chunk = chunk.0,
    );
    Ok(())
}
