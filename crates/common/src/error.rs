//! Central error types for the decode-pipeline core (thiserror-based).

use thiserror::Error;

use crate::types::PixelFormat;

/// Session-level error returned by the codec operation table and the
/// session helpers.
#[derive(Error, Debug)]
pub enum VdecError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Extended firmware too small: expected at least {expected} bytes, got {got}")]
    FirmwareTooSmall { expected: usize, got: usize },

    #[error("Unsupported capture pixel format: {0:?}")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("Failed to allocate {what} ({size} bytes)")]
    OutOfMemory { what: &'static str, size: usize },

    #[error("Reached max number of canvas ({max})")]
    CanvasExhausted { max: usize },

    #[error("Canvas provider error: {0}")]
    Canvas(#[from] CanvasError),

    #[error("Invalid codec state: {0}")]
    InvalidState(String),

    #[error("Decoding session aborted")]
    Aborted,
}

/// Recoverable timestamp-ledger inconsistencies. Callers log and continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("timestamp list is empty")]
    Empty,

    #[error("no timestamp entry for {0}")]
    NotFound(u64),
}

/// Errors reported by the tiling-descriptor ("canvas") provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanvasError {
    #[error("no free canvas descriptor left in the pool")]
    PoolExhausted,

    #[error("canvas descriptor {0} is not allocated")]
    NotAllocated(u8),
}

/// Errors reported by the DMA-coherent memory collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DmaError {
    #[error("coherent allocation of {size} bytes failed")]
    AllocFailed { size: usize },
}

/// Convenience Result type for session operations.
pub type VdecResult<T> = Result<T, VdecError>;
