//! Canvas/plane configuration.
//!
//! The decode engine does not take plane addresses directly. It reads a
//! canvas descriptor index per plane from its bank-select registers, and
//! each descriptor binds a physical plane, its geometry and its tiling
//! mode. Capture buffers revolve through a pool whose addresses shift, so
//! descriptors are bound per buffer every time the set is (re)programmed.

use tracing::{debug, error};

use vdec_common::{CanvasError, PixelFormat, VdecError, VdecResult};

use crate::queue::DstBuffer;
use crate::regs::RegisterIo;

const NUM_CANVAS_NV12: usize = 2;
const NUM_CANVAS_YUV420: usize = 3;

/// Canvases are programmed with dimensions aligned to 64 pixels.
pub const CANVAS_ALIGN: u32 = 64;

/// Address wrapping of a canvas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanvasWrap {
    None,
    X,
    Y,
}

/// Memory block layout of a canvas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanvasBlockMode {
    Linear,
    Block32x32,
    Block64x32,
}

/// Byte swapping applied when the engine reads or writes the canvas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanvasEndian {
    None,
    Swap64,
}

/// Full binding of one descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CanvasConfig {
    pub paddr: u32,
    pub width: u32,
    pub height: u32,
    pub wrap: CanvasWrap,
    pub block_mode: CanvasBlockMode,
    pub endian: CanvasEndian,
}

impl CanvasConfig {
    /// Linear, unwrapped, 64-bit swapped plane: what every decoded plane uses.
    pub fn linear(paddr: u32, width: u32, height: u32) -> Self {
        Self {
            paddr,
            width,
            height,
            wrap: CanvasWrap::None,
            block_mode: CanvasBlockMode::Linear,
            endian: CanvasEndian::Swap64,
        }
    }
}

/// Hardware descriptor pool shared by every user of the tiling unit.
pub trait CanvasProvider: Send + Sync {
    fn alloc(&self) -> Result<u8, CanvasError>;
    fn config(&self, id: u8, config: CanvasConfig) -> Result<(), CanvasError>;
    fn free(&self, id: u8) -> Result<(), CanvasError>;
}

/// A run of consecutive bank-select registers a codec exposes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CanvasBank {
    /// First register of the run.
    pub base: u32,
    /// Number of registers (one capture buffer each).
    pub count: u32,
}

/// Descriptors allocated by one session, capped at a fixed budget.
#[derive(Debug)]
pub struct CanvasSlots {
    ids: Vec<u8>,
    max: usize,
}

impl CanvasSlots {
    pub fn new(max: usize) -> Self {
        Self {
            ids: Vec::with_capacity(max),
            max,
        }
    }

    /// Allocate one descriptor from the pool and record it.
    fn alloc(&mut self, provider: &dyn CanvasProvider) -> VdecResult<u8> {
        if self.ids.len() >= self.max {
            error!(max = self.max, "Reached max number of canvas");
            return Err(VdecError::CanvasExhausted { max: self.max });
        }
        let id = provider.alloc()?;
        self.ids.push(id);
        Ok(id)
    }

    /// Return every recorded descriptor to the pool.
    pub fn release(&mut self, provider: &dyn CanvasProvider) {
        for id in self.ids.drain(..) {
            if let Err(e) = provider.free(id) {
                error!(canvas = id, error = %e, "Failed to free canvas");
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Everything [`set_canvases`] needs from the session.
pub struct CanvasTarget<'a> {
    pub provider: &'a dyn CanvasProvider,
    pub regs: &'a dyn RegisterIo,
    pub slots: &'a mut CanvasSlots,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// Bind descriptors for every buffer in `buffers` and program the
/// bank-select registers, walking `banks` in order.
///
/// Stops at the first failure; buffers bound before it stay bound.
pub fn set_canvases(
    target: &mut CanvasTarget<'_>,
    buffers: &[DstBuffer],
    banks: &[CanvasBank],
) -> VdecResult<()> {
    let width = align_up(target.width, CANVAS_ALIGN);
    let height = align_up(target.height, CANVAS_ALIGN);
    let mut bank = 0usize;
    let mut reg_num = 0u32;

    for buf in buffers {
        let Some(cur) = banks.get(bank).filter(|b| b.base != 0) else {
            return Err(VdecError::InvalidArgument(format!(
                "no canvas register left for buffer {}",
                buf.index
            )));
        };
        let reg = cur.base + reg_num * 4;

        match target.pixel_format {
            PixelFormat::Nv12m => set_canvas_nv12m(target, buf, width, height, reg)?,
            PixelFormat::Yuv420m => set_canvas_yuv420m(target, buf, width, height, reg)?,
            other => {
                error!(pixfmt = other.name(), "Unsupported pixfmt");
                return Err(VdecError::UnsupportedPixelFormat(other));
            }
        }

        reg_num += 1;
        if reg_num >= cur.count {
            bank += 1;
            reg_num = 0;
        }
    }

    Ok(())
}

fn plane_addresses<const N: usize>(buf: &DstBuffer) -> VdecResult<[u32; N]> {
    let mut paddr = [0u32; N];
    for (i, slot) in paddr.iter_mut().enumerate() {
        *slot = buf.plane_paddr(i).ok_or_else(|| {
            VdecError::InvalidArgument(format!("buffer {} has no plane {i}", buf.index))
        })?;
    }
    Ok(paddr)
}

fn set_canvas_nv12m(
    target: &mut CanvasTarget<'_>,
    buf: &DstBuffer,
    width: u32,
    height: u32,
    reg: u32,
) -> VdecResult<()> {
    let paddr = plane_addresses::<NUM_CANVAS_NV12>(buf)?;
    let mut id = [0u8; NUM_CANVAS_NV12];
    for slot in id.iter_mut() {
        *slot = target.slots.alloc(target.provider)?;
    }

    // Y plane
    target
        .provider
        .config(id[0], CanvasConfig::linear(paddr[0], width, height))?;
    // U/V plane
    target
        .provider
        .config(id[1], CanvasConfig::linear(paddr[1], width, height / 2))?;

    let val = (u32::from(id[1]) << 16) | (u32::from(id[1]) << 8) | u32::from(id[0]);
    target.regs.write_dos(reg, val);
    debug!(buf = buf.index, reg, val, "Bound NV12M canvases");
    Ok(())
}

fn set_canvas_yuv420m(
    target: &mut CanvasTarget<'_>,
    buf: &DstBuffer,
    width: u32,
    height: u32,
    reg: u32,
) -> VdecResult<()> {
    let paddr = plane_addresses::<NUM_CANVAS_YUV420>(buf)?;
    let mut id = [0u8; NUM_CANVAS_YUV420];
    for slot in id.iter_mut() {
        *slot = target.slots.alloc(target.provider)?;
    }

    target
        .provider
        .config(id[0], CanvasConfig::linear(paddr[0], width, height))?;
    target
        .provider
        .config(id[1], CanvasConfig::linear(paddr[1], width / 2, height / 2))?;
    target
        .provider
        .config(id[2], CanvasConfig::linear(paddr[2], width / 2, height / 2))?;

    let val = (u32::from(id[2]) << 16) | (u32::from(id[1]) << 8) | u32::from(id[0]);
    target.regs.write_dos(reg, val);
    debug!(buf = buf.index, reg, val, "Bound YUV420M canvases");
    Ok(())
}
