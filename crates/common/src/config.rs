//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::error::VdecError;
use crate::types::PixelFormat;

/// Default bitstream FIFO ("vififo") size: 16 MiB.
pub const DEFAULT_VIFIFO_SIZE: u32 = 16 * 1024 * 1024;

/// Default per-session canvas budget: 32 capture buffers × 3 planes.
pub const DEFAULT_MAX_CANVAS: usize = 32 * 3;

/// Largest coded width or height accepted. Keeps every plane-size product
/// well inside `u32`.
pub const MAX_FRAME_DIM: u32 = 8192;

/// Parameters of one decode session, as negotiated by the outer framework.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capture pixel layout.
    pub pixel_format: PixelFormat,
    /// Coded frame width in pixels.
    pub width: u32,
    /// Coded frame height in pixels.
    pub height: u32,
    /// Logical size of the bitstream FIFO; hardware offsets wrap at this value.
    pub vififo_size: u32,
    /// Maximum number of canvas descriptors the session may hold.
    pub max_canvas: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Nv12m,
            width: 1920,
            height: 1080,
            vififo_size: DEFAULT_VIFIFO_SIZE,
            max_canvas: DEFAULT_MAX_CANVAS,
        }
    }
}

impl SessionConfig {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            ..Self::default()
        }
    }

    /// Reject configurations the offset arithmetic cannot handle.
    pub fn validate(&self) -> Result<(), VdecError> {
        check_frame_size(self.width, self.height)?;
        if self.vififo_size == 0 || self.vififo_size > i32::MAX as u32 {
            return Err(VdecError::InvalidArgument(format!(
                "vififo size {} out of range",
                self.vififo_size
            )));
        }
        if self.max_canvas == 0 {
            return Err(VdecError::InvalidArgument(
                "max_canvas must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reject an empty frame, or one whose sides exceed [`MAX_FRAME_DIM`].
pub fn check_frame_size(width: u32, height: u32) -> Result<(), VdecError> {
    if width == 0 || height == 0 {
        return Err(VdecError::InvalidArgument(format!(
            "frame size {width}x{height} is empty"
        )));
    }
    if width > MAX_FRAME_DIM || height > MAX_FRAME_DIM {
        return Err(VdecError::InvalidArgument(format!(
            "frame size {width}x{height} exceeds {MAX_FRAME_DIM}x{MAX_FRAME_DIM}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_oversized_fifo() {
        let config = SessionConfig {
            vififo_size: u32::MAX,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(VdecError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_frames_beyond_max_dimension() {
        for (w, h) in [(65536, 65536), (MAX_FRAME_DIM + 1, 16), (16, MAX_FRAME_DIM + 1)] {
            assert!(
                matches!(
                    SessionConfig::new(PixelFormat::Nv12m, w, h).validate(),
                    Err(VdecError::InvalidArgument(_))
                ),
                "{w}x{h} must be rejected"
            );
        }
        let largest = SessionConfig::new(PixelFormat::Am21c, MAX_FRAME_DIM, MAX_FRAME_DIM);
        assert!(largest.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "pixel_format": "yuv420m", "vififo_size": 100000 }"#)
                .unwrap();
        assert_eq!(config.pixel_format, PixelFormat::Yuv420m);
        assert_eq!(config.vififo_size, 100_000);
        assert_eq!(config.width, 1920);
        assert_eq!(config.max_canvas, DEFAULT_MAX_CANVAS);
    }
}
