#![forbid(unsafe_code)]
//! Block-level copy-on-write virtual device target.
//!
//! A target composes two backing devices: an **origin**, whose
//! activation-time contents are preserved indefinitely, and a **cow**
//! device that absorbs every post-activation write together with the
//! pre-write copy of its 4 KiB chunk. The first 8 sectors of the cow
//! device persist a one-bit-per-chunk redirection bitmap; chunk data
//! follows from sector 8.
//!
//! The mapping hot path is lock-free: readers load an immutable bitmap
//! snapshot and never contend with the serialized write side. First writes
//! to untouched chunks become asynchronous copy-on-write jobs executed by
//! a worker pool, with data persisted strictly before metadata so a crash
//! at any point leaves the virtual device consistent.

pub mod bitmap;
mod job;
pub mod metadata;
mod pool;
pub mod publish;
mod target;
mod worker;

pub use bitmap::ChunkBitmap;
pub use publish::PublishedBitmap;
pub use target::{CowTarget, MapOutcome, TargetConfig, TargetStatus};
