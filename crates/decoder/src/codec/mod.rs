//! Codec operation table.
//!
//! Each codec variant owns its private state behind [`CodecOps`]. The set of
//! variants is closed ([`Codec`]); [`CodecKind`] is the state-free tag the
//! interrupt top half dispatches on.
//!
//! # Two-stage interrupts
//!
//! The top half runs with interrupts masked. It receives an [`IrqContext`],
//! which exposes register access and nothing else: no session, no
//! allocator, no buffer queue. It acknowledges the source and returns
//! [`IrqReturn::WakeThread`]. The bottom half ([`CodecOps::threaded_isr`])
//! gets the whole session and may block and allocate.

pub mod h264;

use std::fmt;

use vdec_common::VdecResult;

use crate::regs::RegisterIo;
use crate::session::Session;

pub use h264::H264Codec;

/// Outcome of an interrupt handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours.
    None,
    /// Fully handled.
    Handled,
    /// Acknowledged; the bottom half must run.
    WakeThread,
}

/// What the interrupt top half may touch: registers only.
pub struct IrqContext<'a> {
    regs: &'a dyn RegisterIo,
}

impl<'a> IrqContext<'a> {
    pub fn new(regs: &'a dyn RegisterIo) -> Self {
        Self { regs }
    }

    pub fn read_dos(&self, reg: u32) -> u32 {
        self.regs.read_dos(reg)
    }

    pub fn write_dos(&self, reg: u32, val: u32) {
        self.regs.write_dos(reg, val);
    }
}

impl fmt::Debug for IrqContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqContext").finish_non_exhaustive()
    }
}

/// Interrupt top half of a codec. Stateless by construction.
pub trait TopHalf {
    fn isr(irq: &IrqContext<'_>) -> IrqReturn;
}

/// Per-codec lifecycle and bottom-half operations.
pub trait CodecOps: Send {
    /// Allocate working memory and program the engine.
    fn start(&mut self, sess: &Session) -> VdecResult<()>;

    /// Release everything the codec allocated, whatever state it is in.
    fn stop(&mut self, sess: &Session) -> VdecResult<()>;

    /// Take a copy of the codec's extended firmware.
    fn load_extended_firmware(&mut self, sess: &Session, data: &[u8]) -> VdecResult<()>;

    /// Interrupt bottom half.
    fn threaded_isr(&mut self, sess: &Session) -> IrqReturn;

    /// Whether the engine can accept another recycled capture buffer.
    fn can_recycle(&self, regs: &dyn RegisterIo) -> bool;

    /// Hand capture buffer `buf_idx` back to the engine.
    fn recycle(&self, regs: &dyn RegisterIo, buf_idx: u32);
}

/// Codec variant tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    H264,
}

impl CodecKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "H.264",
        }
    }

    /// Highest capture-buffer index the engine can address.
    pub fn max_buf_idx(self) -> u32 {
        match self {
            Self::H264 => h264::MAX_BUF_IDX,
        }
    }

    /// Fresh private state for this variant.
    pub fn instantiate(self) -> Codec {
        match self {
            Self::H264 => Codec::H264(H264Codec::new()),
        }
    }

    /// Run this variant's top half.
    pub fn isr(self, irq: &IrqContext<'_>) -> IrqReturn {
        match self {
            Self::H264 => H264Codec::isr(irq),
        }
    }
}

/// Closed set of codec variants with their private state.
#[derive(Debug)]
pub enum Codec {
    H264(H264Codec),
}

impl Codec {
    pub fn kind(&self) -> CodecKind {
        match self {
            Self::H264(_) => CodecKind::H264,
        }
    }
}

impl CodecOps for Codec {
    fn start(&mut self, sess: &Session) -> VdecResult<()> {
        match self {
            Self::H264(c) => c.start(sess),
        }
    }

    fn stop(&mut self, sess: &Session) -> VdecResult<()> {
        match self {
            Self::H264(c) => c.stop(sess),
        }
    }

    fn load_extended_firmware(&mut self, sess: &Session, data: &[u8]) -> VdecResult<()> {
        match self {
            Self::H264(c) => c.load_extended_firmware(sess, data),
        }
    }

    fn threaded_isr(&mut self, sess: &Session) -> IrqReturn {
        match self {
            Self::H264(c) => c.threaded_isr(sess),
        }
    }

    fn can_recycle(&self, regs: &dyn RegisterIo) -> bool {
        match self {
            Self::H264(c) => c.can_recycle(regs),
        }
    }

    fn recycle(&self, regs: &dyn RegisterIo, buf_idx: u32) {
        match self {
            Self::H264(c) => c.recycle(regs, buf_idx),
        }
    }
}
