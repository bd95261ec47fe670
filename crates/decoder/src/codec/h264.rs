//! H.264 codec: parameter negotiation and interrupt state machine.
//!
//! The bitstream syntax is handled by the engine firmware. The host side:
//!
//! 1. loads the extended firmware and allocates the workspace and SEI
//!    scratch at start;
//! 2. once the firmware has parsed the first keyframe it reports the
//!    macroblock geometry and reference count ("set parameters"), and the
//!    host sizes and allocates the reference motion-vector buffer and binds
//!    the capture canvases;
//! 3. in steady state the firmware reports batches of decoded pictures
//!    ("frames ready") that are completed through the session dispatcher.
//!
//! ## Status words
//!
//! | word | field | bits |
//! |---|---|---|
//! | `AV_SCRATCH_0` (status) | command | 7:0 |
//! | | decoded frame count | 15:8 |
//! | `AV_SCRATCH_1` (parsed info) | macroblocks per row | 7:0 |
//! | | total macroblocks | 23:8 |
//! | | max reference frames | 30:24 |
//! | `AV_SCRATCH_1 + 4i` (frame i) | buffer index | 4:0 |
//! | | picture structure | 7:5 |
//! | | decode error | 9 |
//! | | offset, low 16 bits | 31:16 |
//! | `AV_SCRATCH_A + 4(i/2)` | offset high 16 bits, even i | 15:0 |
//! | | offset high 16 bits, odd i | 31:16 |

use tracing::{debug, error, info, warn};

use vdec_common::{Field, VdecError, VdecResult};

use crate::canvas::{align_up, CanvasBank};
use crate::codec::{CodecOps, IrqContext, IrqReturn, TopHalf};
use crate::dma::{self, DmaBuffer};
use crate::regs::{
    bit, genmask, RegisterIo, ANC0_CANVAS_ADDR, ASSIST_MBOX1_CLR_REG, AV_SCRATCH_0, AV_SCRATCH_1,
    AV_SCRATCH_4, AV_SCRATCH_7, AV_SCRATCH_8, AV_SCRATCH_A, AV_SCRATCH_D, AV_SCRATCH_F,
    AV_SCRATCH_G, AV_SCRATCH_I, AV_SCRATCH_J, MDEC_PIC_DC_THRESH, POWER_CTL_VLD,
};
use crate::session::Session;

pub const SIZE_EXT_FW: usize = 20 * 1024;
pub const SIZE_WORKSPACE: usize = 0x1ee000;
pub const SIZE_SEI: usize = 8 * 1024;

/// The firmware adds this to the workspace address it is given.
const WORKSPACE_BUF_OFFSET: u32 = 0x100_0000;

// Status word
const CMD_MASK: u32 = genmask(7, 0);
pub const CMD_SET_PARAM: u32 = 1;
pub const CMD_FRAMES_READY: u32 = 2;
pub const CMD_FATAL_ERROR: u32 = 6;
pub const CMD_BAD_WIDTH: u32 = 7;
pub const CMD_BAD_HEIGHT: u32 = 8;
const NUM_FRAMES_BIT: u32 = 8;
const NUM_FRAMES_MASK: u32 = genmask(7, 0);

pub const SEI_DATA_READY: u32 = bit(15);

// Picture structure
pub const PIC_TOP_BOT: u32 = 5;
pub const PIC_BOT_TOP: u32 = 6;

/// Motion-vector storage per macroblock.
pub const MB_MV_SIZE: u32 = 96;

// Frame status word
const PIC_STRUCT_BIT: u32 = 5;
const PIC_STRUCT_MASK: u32 = genmask(2, 0);
const BUF_IDX_MASK: u32 = genmask(4, 0);
/// Highest capture-buffer index the status and recycle words can carry.
pub const MAX_BUF_IDX: u32 = BUF_IDX_MASK;
const ERROR_MASK: u32 = bit(9);
const OFFSET_BIT: u32 = 16;
const OFFSET_MASK: u32 = genmask(15, 0);

// Parsed-info word
const MB_TOTAL_BIT: u32 = 8;
const MB_TOTAL_MASK: u32 = genmask(15, 0);
const MB_WIDTH_MASK: u32 = genmask(7, 0);
const MAX_REF_BIT: u32 = 24;
const MAX_REF_MASK: u32 = genmask(6, 0);

/// Minimum DPB size programmed into the engine.
const MIN_DPB_SIZE: u32 = 4;

/// Capture-buffer bank-select registers of the H.264 firmware.
const CANVAS_BANKS: [CanvasBank; 1] = [CanvasBank {
    base: ANC0_CANVAS_ADDR,
    count: 24,
}];

// ---------------------------------------------------------------------------
// Status word decoding
// ---------------------------------------------------------------------------

/// Geometry report written by the firmware after the first keyframe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParsedInfo {
    /// Total number of 16x16 macroblocks.
    pub mb_total: u32,
    /// Macroblocks per line.
    pub mb_width: u32,
    /// Maximum number of reference frames.
    pub max_reference: u32,
}

impl ParsedInfo {
    pub fn from_word(word: u32) -> Self {
        Self {
            mb_total: (word >> MB_TOTAL_BIT) & MB_TOTAL_MASK,
            mb_width: word & MB_WIDTH_MASK,
            max_reference: (word >> MAX_REF_BIT) & MAX_REF_MASK,
        }
    }
}

/// Reference storage derived from a [`ParsedInfo`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DpbSizing {
    /// Macroblocks per line, aligned to 4.
    pub mb_width: u32,
    /// Macroblock lines, aligned to 4.
    pub mb_height: u32,
    /// `mb_width * mb_height` after alignment.
    pub mb_total: u32,
    /// DPB size programmed into the engine.
    pub max_dpb: u32,
    /// Reference frames including the one being decoded.
    pub max_reference: u32,
    /// Size of the reference motion-vector buffer in bytes.
    pub ref_size: u32,
}

impl DpbSizing {
    /// Returns `None` for a report with zero macroblocks per line, or one
    /// whose reference storage does not fit in 32 bits.
    pub fn from_parsed(info: ParsedInfo) -> Option<Self> {
        if info.mb_width == 0 {
            return None;
        }
        let mb_height = align_up(info.mb_total / info.mb_width, 4);
        let mb_width = align_up(info.mb_width, 4);
        let mb_total = mb_width * mb_height;

        let max_dpb = info.max_reference.max(MIN_DPB_SIZE);
        // Keep a slot for the picture being decoded.
        let max_reference = info.max_reference + 1;
        let ref_size = mb_total
            .checked_mul(MB_MV_SIZE)?
            .checked_mul(max_reference)?;

        Some(Self {
            mb_width,
            mb_height,
            mb_total,
            max_dpb,
            max_reference,
            ref_size,
        })
    }

    /// Control word acknowledging the parameters in `AV_SCRATCH_0`.
    pub fn control_word(&self, ready_dst_bufs: u32) -> u32 {
        (self.max_reference << 24) | (ready_dst_bufs << 16) | (self.max_dpb << 8)
    }
}

/// One entry of a frames-ready report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameStatus {
    pub buf_idx: u32,
    pub pic_struct: u32,
    /// Decoded with artifacts (e.g. a briefly corrupted bitstream).
    pub error: bool,
    /// Low 16 bits of the FIFO offset the picture came from.
    pub offset_lsb: u32,
}

impl FrameStatus {
    pub fn from_word(word: u32) -> Self {
        Self {
            buf_idx: word & BUF_IDX_MASK,
            pic_struct: (word >> PIC_STRUCT_BIT) & PIC_STRUCT_MASK,
            error: word & ERROR_MASK != 0,
            offset_lsb: (word >> OFFSET_BIT) & OFFSET_MASK,
        }
    }

    pub fn field(&self) -> Field {
        match self.pic_struct {
            PIC_TOP_BOT => Field::InterlacedTb,
            PIC_BOT_TOP => Field::InterlacedBt,
            _ => Field::None,
        }
    }
}

/// High half of frame `frame_num`'s offset, already shifted into place.
/// Two frames share one register.
fn offset_msb(regs: &dyn RegisterIo, frame_num: u32) -> u32 {
    let take_msb = frame_num % 2 == 1;
    let reg = AV_SCRATCH_A + (frame_num / 2) * 4;
    let val = regs.read_dos(reg);

    if take_msb {
        val & 0xffff_0000
    } else {
        (val & 0x0000_ffff) << 16
    }
}

/// Hand the reference storage to the engine and acknowledge the
/// parameters, which releases the pending set-parameters command.
fn program_references(regs: &dyn RegisterIo, ref_buf: &DmaBuffer, sizing: &DpbSizing, ready: u32) {
    // Reference MV storage: start and end
    regs.write_dos(AV_SCRATCH_1, ref_buf.paddr());
    regs.write_dos(AV_SCRATCH_4, ref_buf.end_paddr());
    regs.write_dos(AV_SCRATCH_0, sizing.control_word(ready));
}

// ---------------------------------------------------------------------------
// Codec state
// ---------------------------------------------------------------------------

/// Parameter negotiation progress.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum H264State {
    /// Not started.
    #[default]
    Unconfigured,
    /// Started; waiting for the firmware's geometry report.
    AwaitingFirstKeyframe,
    /// Reference storage allocated and programmed.
    Configured,
}

/// H.264 private state: the four DMA regions and negotiation state.
#[derive(Debug, Default)]
pub struct H264Codec {
    state: H264State,
    /// Extended firmware required by the H.264 decoder.
    ext_fw: Option<DmaBuffer>,
    workspace: Option<DmaBuffer>,
    /// Reference motion vectors, sized at set-parameters time.
    ref_buf: Option<DmaBuffer>,
    /// Geometry `ref_buf` was sized for.
    sizing: Option<DpbSizing>,
    /// Parsed SEI dump.
    sei: Option<DmaBuffer>,
}

impl H264Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> H264State {
        self.state
    }

    /// Size of the reference buffer, once allocated.
    pub fn ref_size(&self) -> Option<usize> {
        self.ref_buf.as_ref().map(DmaBuffer::len)
    }

    fn alloc(sess: &Session, size: usize, what: &'static str) -> VdecResult<DmaBuffer> {
        sess.dma().alloc_coherent(size).map_err(|e| {
            error!(size, error = %e, "Failed to alloc H.264 {what}");
            VdecError::OutOfMemory { what, size }
        })
    }

    /// Configure reference storage once the firmware parsed the first
    /// keyframe.
    ///
    /// A repeated report with the same geometry is acknowledged again with
    /// the existing references. A different geometry frees them and the
    /// canvases, then negotiates from scratch.
    fn set_param(&mut self, sess: &Session) {
        let regs = sess.regs();
        let actual_dpb_size = sess.num_dst_bufs_ready();
        let parsed = ParsedInfo::from_word(regs.read_dos(AV_SCRATCH_1));

        let Some(sizing) = DpbSizing::from_parsed(parsed) else {
            error!(
                mb_total = parsed.mb_total,
                mb_width = parsed.mb_width,
                "Firmware reported an unusable geometry"
            );
            sess.abort();
            return;
        };

        if self.state == H264State::Configured {
            if let (Some(ref_buf), Some(current)) = (&self.ref_buf, self.sizing) {
                if current == sizing {
                    warn!("Parameters reported again, re-acknowledging");
                    program_references(regs, ref_buf, &sizing, actual_dpb_size);
                    return;
                }
            }
            info!(
                mb_width = sizing.mb_width,
                mb_height = sizing.mb_height,
                max_ref_size = sizing.max_reference,
                "Stream geometry changed, reallocating references"
            );
            dma::release(sess.dma(), &mut self.ref_buf);
            sess.release_canvases();
            self.sizing = None;
            self.state = H264State::AwaitingFirstKeyframe;
        }

        if let Err(e) = sess.set_canvases(&CANVAS_BANKS) {
            error!(error = %e, "Failed to bind capture canvases");
            sess.abort();
            return;
        }

        debug!(
            mb_width = sizing.mb_width,
            mb_height = sizing.mb_height,
            max_ref_size = sizing.max_reference,
            max_dpb_size = sizing.max_dpb,
            actual_dpb_size,
            "H.264 parameters"
        );

        let ref_buf = match sess.dma().alloc_coherent(sizing.ref_size as usize) {
            Ok(buf) => buf,
            Err(e) => {
                error!(ref_size = sizing.ref_size, error = %e, "Failed to alloc refs");
                sess.abort();
                return;
            }
        };

        program_references(regs, &ref_buf, &sizing, actual_dpb_size);

        self.ref_buf = Some(ref_buf);
        self.sizing = Some(sizing);
        self.state = H264State::Configured;
        sess.set_keyframe_found();
    }

    fn frames_ready(&mut self, sess: &Session, status: u32) {
        let regs = sess.regs();
        let error_count = regs.read_dos(AV_SCRATCH_D);
        let num_frames = (status >> NUM_FRAMES_BIT) & NUM_FRAMES_MASK;

        if error_count != 0 {
            warn!(error_count, "decoder error(s) happened");
            regs.write_dos(AV_SCRATCH_D, 0);
        }

        for i in 0..num_frames {
            let frame = FrameStatus::from_word(regs.read_dos(AV_SCRATCH_1 + i * 4));
            if frame.error {
                debug!(buf_idx = frame.buf_idx, "Buffer decode error");
            }

            let offset = (frame.offset_lsb | offset_msb(regs, i)) as i32;
            sess.dst_buf_done_idx(frame.buf_idx, offset, frame.field());
        }
    }
}

impl TopHalf for H264Codec {
    fn isr(irq: &IrqContext<'_>) -> IrqReturn {
        irq.write_dos(ASSIST_MBOX1_CLR_REG, 1);
        IrqReturn::WakeThread
    }
}

impl CodecOps for H264Codec {
    fn start(&mut self, sess: &Session) -> VdecResult<()> {
        let Some(ext_fw_paddr) = self.ext_fw.as_ref().map(DmaBuffer::paddr) else {
            return Err(VdecError::InvalidState(
                "extended firmware not loaded".to_string(),
            ));
        };
        if self.state != H264State::Unconfigured {
            return Err(VdecError::InvalidState(format!(
                "start while {:?}",
                self.state
            )));
        }

        // Leftovers of a start that failed half-way.
        dma::release(sess.dma(), &mut self.workspace);
        dma::release(sess.dma(), &mut self.sei);

        let workspace = Self::alloc(sess, SIZE_WORKSPACE, "workspace")?;
        let workspace_paddr = workspace.paddr();
        self.workspace = Some(workspace);

        let sei = Self::alloc(sess, SIZE_SEI, "SEI")?;
        let sei_paddr = sei.paddr();
        self.sei = Some(sei);

        let regs = sess.regs();
        regs.write_dos_bits(POWER_CTL_VLD, bit(9) | bit(6));

        let workspace_offset = workspace_paddr.wrapping_sub(WORKSPACE_BUF_OFFSET);
        regs.write_dos(AV_SCRATCH_1, workspace_offset);
        regs.write_dos(AV_SCRATCH_G, ext_fw_paddr);
        regs.write_dos(AV_SCRATCH_I, sei_paddr.wrapping_sub(workspace_offset));

        // Enable error correction
        regs.write_dos(
            AV_SCRATCH_F,
            (regs.read_dos(AV_SCRATCH_F) & 0xffff_ffc3) | bit(4) | bit(7),
        );

        regs.write_dos(MDEC_PIC_DC_THRESH, 0x4040_38aa);

        self.state = H264State::AwaitingFirstKeyframe;
        Ok(())
    }

    fn stop(&mut self, sess: &Session) -> VdecResult<()> {
        let dma = sess.dma();
        dma::release(dma, &mut self.ext_fw);
        dma::release(dma, &mut self.workspace);
        dma::release(dma, &mut self.ref_buf);
        dma::release(dma, &mut self.sei);
        self.sizing = None;
        self.state = H264State::Unconfigured;
        Ok(())
    }

    fn load_extended_firmware(&mut self, sess: &Session, data: &[u8]) -> VdecResult<()> {
        if data.len() < SIZE_EXT_FW {
            return Err(VdecError::FirmwareTooSmall {
                expected: SIZE_EXT_FW,
                got: data.len(),
            });
        }

        let mut fw = Self::alloc(sess, SIZE_EXT_FW, "extended fw")?;
        fw.as_mut_slice().copy_from_slice(&data[..SIZE_EXT_FW]);
        dma::release(sess.dma(), &mut self.ext_fw);
        self.ext_fw = Some(fw);
        debug!(len = data.len(), "H.264 extended firmware loaded");
        Ok(())
    }

    fn threaded_isr(&mut self, sess: &Session) -> IrqReturn {
        let regs = sess.regs();
        let status = regs.read_dos(AV_SCRATCH_0);
        let cmd = status & CMD_MASK;

        match cmd {
            CMD_SET_PARAM => self.set_param(sess),
            CMD_FRAMES_READY => self.frames_ready(sess, status),
            CMD_FATAL_ERROR => {
                error!("H.264 decoder fatal error");
                sess.abort();
                return IrqReturn::Handled;
            }
            CMD_BAD_WIDTH => {
                let size = regs.read_dos(AV_SCRATCH_1).wrapping_add(1).wrapping_mul(16);
                error!(size, "Unsupported video width");
                sess.abort();
                return IrqReturn::Handled;
            }
            CMD_BAD_HEIGHT => {
                let size = regs.read_dos(AV_SCRATCH_1).wrapping_add(1).wrapping_mul(16);
                error!(size, "Unsupported video height");
                sess.abort();
                return IrqReturn::Handled;
            }
            // Unused but not worth printing for
            0 | 9 => {}
            _ => info!("Unexpected H264 ISR: {cmd:08X}"),
        }

        // Set-parameters stays pending until the control word replaces it.
        if cmd != 0 && cmd != CMD_SET_PARAM {
            regs.write_dos(AV_SCRATCH_0, 0);
        }

        // SEI data is not consumed, only acknowledged.
        if regs.read_dos(AV_SCRATCH_J) & SEI_DATA_READY != 0 {
            regs.write_dos(AV_SCRATCH_J, 0);
        }

        IrqReturn::Handled
    }

    fn can_recycle(&self, regs: &dyn RegisterIo) -> bool {
        regs.read_dos(AV_SCRATCH_7) == 0 || regs.read_dos(AV_SCRATCH_8) == 0
    }

    fn recycle(&self, regs: &dyn RegisterIo, buf_idx: u32) {
        // Zero means "empty", hence the +1. AV_SCRATCH_8 is a second mailbox.
        let mailbox = (buf_idx & BUF_IDX_MASK) + 1;
        if regs.read_dos(AV_SCRATCH_7) == 0 {
            regs.write_dos(AV_SCRATCH_7, mailbox);
        } else {
            regs.write_dos(AV_SCRATCH_8, mailbox);
        }
    }
}
