//! `vdec-common`: shared types, configuration, and errors for the vdec
//! decode-pipeline core.
//!
//! - **Types**: `PixelFormat`, `Field`, `Rational` (capture-side metadata)
//! - **Config**: `SessionConfig` (serde-loadable session parameters)
//! - **Errors**: `VdecError`, `LedgerError`, `CanvasError`, `DmaError` (thiserror-based)

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used items at crate root
pub use config::{check_frame_size, SessionConfig, MAX_FRAME_DIM};
pub use error::{CanvasError, DmaError, LedgerError, VdecError, VdecResult};
pub use types::{Field, PixelFormat, Rational};
