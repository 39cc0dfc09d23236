#![forbid(unsafe_code)]
//! Error types for vcow.
//!
//! Defines `VcowError` and a `Result<T>` alias used throughout the
//! workspace. Activation errors carry the diagnostic string surfaced to the
//! host framework; per-request errors fail only the offending request.

use thiserror::Error;

/// Unified error type for all vcow operations.
#[derive(Debug, Error)]
pub enum VcowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("target too large: {chunks} chunks, maximum {max}")]
    TargetTooLarge { chunks: u64, max: u64 },

    #[error("bitmap needs {sectors} sectors, reserved region holds {max}")]
    MetadataTooLarge { sectors: u64, max: u64 },

    #[error("bitmap sector {sector} outside reserved region of {max} sectors")]
    MetadataSectorOutOfBounds { sector: u64, max: u64 },

    #[error("sector {sector} out of target bounds ({len_sectors} sectors)")]
    OutOfBounds { sector: u64, len_sectors: u64 },

    #[error("request spans a chunk boundary: sector {sector}, {sectors} sectors")]
    SpansChunkBoundary { sector: u64, sectors: u64 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("target is shutting down")]
    ShuttingDown,
}

impl VcowError {
    /// Whether this error is a per-request condition (as opposed to an
    /// activation or device failure).
    #[must_use]
    pub fn is_request_local(&self) -> bool {
        matches!(
            self,
            Self::OutOfBounds { .. }
                | Self::SpansChunkBoundary { .. }
                | Self::ResourceExhausted(_)
                | Self::ShuttingDown
        )
    }
}

/// Result alias using `VcowError`.
pub type Result<T> = std::result::Result<T, VcowError>;
