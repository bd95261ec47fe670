//! In-memory hardware model.
//!
//! Implements every collaborator trait without hardware so a whole session
//! can be driven from tests and from the replay tool. [`SimRegisters`] also
//! carries helpers that post firmware reports the way the engine lays them
//! out in its scratch registers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, error};

use vdec_common::{CanvasError, DmaError, PixelFormat, SessionConfig, VdecResult};

use crate::canvas::{align_up, CanvasConfig, CanvasProvider};
use crate::codec::h264::{CMD_FRAMES_READY, CMD_SET_PARAM, SIZE_EXT_FW};
use crate::codec::CodecKind;
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::queue::{BufferQueue, BufferState, DecoderEvent, DstBuffer, EventSink, Plane};
use crate::regs::{RegisterIo, AV_SCRATCH_0, AV_SCRATCH_1, AV_SCRATCH_A};
use crate::session::{am21c_size, Core, Session, SubmitWaker};

const DOS_WINDOW: usize = 0x1_0000;
const PARSER_WINDOW: usize = 0x1000;

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

/// Both register windows as plain memory. Accesses outside a window read
/// as zero and drop writes.
pub struct SimRegisters {
    dos: Box<[AtomicU32]>,
    parser: Box<[AtomicU32]>,
}

fn window(words: usize) -> Box<[AtomicU32]> {
    (0..words).map(|_| AtomicU32::new(0)).collect()
}

impl SimRegisters {
    pub fn new() -> Self {
        Self {
            dos: window(DOS_WINDOW / 4),
            parser: window(PARSER_WINDOW / 4),
        }
    }

    /// Firmware: report command `cmd` in the status word.
    pub fn post_command(&self, cmd: u32) {
        self.write_dos(AV_SCRATCH_0, cmd);
    }

    /// Firmware: report stream geometry after the first keyframe.
    pub fn post_set_param(&self, mb_total: u32, mb_width: u32, max_ref: u32) {
        let info = ((max_ref & 0x7f) << 24) | ((mb_total & 0xffff) << 8) | (mb_width & 0xff);
        self.write_dos(AV_SCRATCH_1, info);
        self.post_command(CMD_SET_PARAM);
    }

    /// Firmware: report a batch of decoded pictures.
    pub fn post_frames_ready(&self, frames: &[SimFrame]) {
        for (i, frame) in frames.iter().enumerate() {
            let i = i as u32;
            self.write_dos(AV_SCRATCH_1 + i * 4, frame.status_word());

            let msb_reg = AV_SCRATCH_A + (i / 2) * 4;
            let msb = frame.offset >> 16;
            let val = self.read_dos(msb_reg);
            let val = if i % 2 == 1 {
                (val & 0x0000_ffff) | (msb << 16)
            } else {
                (val & 0xffff_0000) | msb
            };
            self.write_dos(msb_reg, val);
        }
        self.post_command(((frames.len() as u32 & 0xff) << 8) | CMD_FRAMES_READY);
    }

    fn slot(win: &[AtomicU32], reg: u32) -> Option<&AtomicU32> {
        win.get(reg as usize / 4)
    }
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for SimRegisters {
    fn read_dos(&self, reg: u32) -> u32 {
        Self::slot(&self.dos, reg).map_or(0, |r| r.load(Ordering::Acquire))
    }

    fn write_dos(&self, reg: u32, val: u32) {
        match Self::slot(&self.dos, reg) {
            Some(r) => r.store(val, Ordering::Release),
            None => debug!(reg, "Write outside DOS window dropped"),
        }
    }

    fn read_parser(&self, reg: u32) -> u32 {
        Self::slot(&self.parser, reg).map_or(0, |r| r.load(Ordering::Acquire))
    }

    fn write_parser(&self, reg: u32, val: u32) {
        match Self::slot(&self.parser, reg) {
            Some(r) => r.store(val, Ordering::Release),
            None => debug!(reg, "Write outside parser window dropped"),
        }
    }
}

/// One picture of a frames-ready report.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SimFrame {
    pub index: u32,
    /// FIFO offset; only the low 32 bits are reported.
    pub offset: u32,
    pub pic_struct: u32,
    pub error: bool,
}

impl SimFrame {
    pub fn new(index: u32, offset: u32) -> Self {
        Self {
            index,
            offset,
            ..Self::default()
        }
    }

    pub fn with_pic_struct(mut self, pic_struct: u32) -> Self {
        self.pic_struct = pic_struct;
        self
    }

    pub fn with_error(mut self) -> Self {
        self.error = true;
        self
    }

    fn status_word(&self) -> u32 {
        ((self.offset & 0xffff) << 16)
            | (u32::from(self.error) << 9)
            | ((self.pic_struct & 0x7) << 5)
            | (self.index & 0x1f)
    }
}

// ---------------------------------------------------------------------------
// DMA
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DmaLedger {
    live: HashMap<u32, usize>,
    history: Vec<(u32, usize)>,
    frees: usize,
}

/// Heap-backed coherent allocator handing out page-aligned bus addresses.
pub struct SimDma {
    next_paddr: AtomicU32,
    fail_next: AtomicBool,
    ledger: Mutex<DmaLedger>,
}

impl SimDma {
    pub fn new() -> Self {
        Self {
            next_paddr: AtomicU32::new(0x1000_0000),
            fail_next: AtomicBool::new(false),
            ledger: Mutex::new(DmaLedger::default()),
        }
    }

    /// Make the next allocation fail.
    pub fn fail_next_alloc(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    pub fn live_allocations(&self) -> usize {
        self.ledger.lock().live.len()
    }

    pub fn total_allocs(&self) -> usize {
        self.ledger.lock().history.len()
    }

    pub fn total_frees(&self) -> usize {
        self.ledger.lock().frees
    }

    /// Every successful allocation as `(paddr, size)`, oldest first.
    pub fn allocations(&self) -> Vec<(u32, usize)> {
        self.ledger.lock().history.clone()
    }
}

impl Default for SimDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for SimDma {
    fn alloc_coherent(&self, size: usize) -> Result<DmaBuffer, DmaError> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(DmaError::AllocFailed { size });
        }
        let span = align_up(size as u32, 4096);
        let paddr = self.next_paddr.fetch_add(span, Ordering::AcqRel);

        let mut ledger = self.ledger.lock();
        ledger.live.insert(paddr, size);
        ledger.history.push((paddr, size));
        Ok(DmaBuffer::new(paddr, vec![0u8; size].into_boxed_slice()))
    }

    fn free_coherent(&self, buf: DmaBuffer) {
        let mut ledger = self.ledger.lock();
        if ledger.live.remove(&buf.paddr()).is_none() {
            error!(paddr = buf.paddr(), "Freeing unknown DMA region");
            return;
        }
        ledger.frees += 1;
    }
}

// ---------------------------------------------------------------------------
// Canvas pool
// ---------------------------------------------------------------------------

/// Descriptor pool handing out the lowest free index.
pub struct SimCanvas {
    capacity: usize,
    slots: Mutex<BTreeMap<u8, Option<CanvasConfig>>>,
}

impl SimCanvas {
    /// Pool of `capacity` descriptors (at most 256).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(256),
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config_of(&self, id: u8) -> Option<CanvasConfig> {
        self.slots.lock().get(&id).copied().flatten()
    }

    pub fn allocated(&self) -> usize {
        self.slots.lock().len()
    }
}

impl CanvasProvider for SimCanvas {
    fn alloc(&self) -> Result<u8, CanvasError> {
        let mut slots = self.slots.lock();
        let id = (0..self.capacity)
            .map(|i| i as u8)
            .find(|id| !slots.contains_key(id))
            .ok_or(CanvasError::PoolExhausted)?;
        slots.insert(id, None);
        Ok(id)
    }

    fn config(&self, id: u8, config: CanvasConfig) -> Result<(), CanvasError> {
        match self.slots.lock().get_mut(&id) {
            Some(slot) => {
                *slot = Some(config);
                Ok(())
            }
            None => Err(CanvasError::NotAllocated(id)),
        }
    }

    fn free(&self, id: u8) -> Result<(), CanvasError> {
        self.slots
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(CanvasError::NotAllocated(id))
    }
}

// ---------------------------------------------------------------------------
// Buffer queue and events
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    ready: Vec<DstBuffer>,
    done: Vec<(DstBuffer, BufferState)>,
    next_index: u32,
    next_paddr: u32,
}

/// Capture queue: buffers wait in `ready` until the session completes them.
pub struct SimQueue {
    state: Mutex<QueueState>,
    errored: AtomicBool,
}

impl SimQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_paddr: 0x4000_0000,
                ..QueueState::default()
            }),
            errored: AtomicBool::new(false),
        }
    }

    /// Allocate and queue `count` capture buffers for the given geometry.
    /// Returns their indices.
    pub fn add_buffers(
        &self,
        pixel_format: PixelFormat,
        count: u32,
        width: u32,
        height: u32,
    ) -> Vec<u32> {
        let luma = width * height;
        let lengths = match pixel_format {
            PixelFormat::Nv12m => vec![luma, luma / 2],
            PixelFormat::Yuv420m => vec![luma, luma / 4, luma / 4],
            PixelFormat::Am21c => vec![am21c_size(width, height)],
        };

        let mut state = self.state.lock();
        let mut indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = state.next_index;
            state.next_index += 1;
            let mut planes = Vec::with_capacity(lengths.len());
            for &length in &lengths {
                planes.push(Plane {
                    paddr: state.next_paddr,
                    length,
                    bytesused: 0,
                });
                state.next_paddr = state.next_paddr.wrapping_add(align_up(length, 4096));
            }
            state.ready.push(DstBuffer::new(index, planes));
            indices.push(index);
        }
        indices
    }

    /// Give a completed buffer back to the queue, metadata cleared.
    pub fn requeue(&self, mut buf: DstBuffer) {
        for plane in &mut buf.planes {
            plane.bytesused = 0;
        }
        let buf = DstBuffer::new(buf.index, buf.planes);
        self.state.lock().ready.push(buf);
    }

    /// Drain the completed buffers, oldest first.
    pub fn take_done(&self) -> Vec<(DstBuffer, BufferState)> {
        std::mem::take(&mut self.state.lock().done)
    }

    pub fn ready_count(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }
}

impl Default for SimQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferQueue for SimQueue {
    fn dst_buf_remove_by_idx(&self, index: u32) -> Option<DstBuffer> {
        let mut state = self.state.lock();
        let pos = state.ready.iter().position(|b| b.index == index)?;
        Some(state.ready.remove(pos))
    }

    fn dst_buf_done(&self, buf: DstBuffer, buf_state: BufferState) {
        self.state.lock().done.push((buf, buf_state));
    }

    fn ready_dst_buffers(&self) -> Vec<DstBuffer> {
        self.state.lock().ready.clone()
    }

    fn num_dst_bufs_ready(&self) -> u32 {
        self.state.lock().ready.len() as u32
    }

    fn queue_error(&self) {
        self.errored.store(true, Ordering::Release);
    }
}

/// Records every event in arrival order.
#[derive(Default)]
pub struct SimEvents {
    events: Mutex<Vec<DecoderEvent>>,
}

impl SimEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DecoderEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for SimEvents {
    fn queue_event(&self, event: DecoderEvent) {
        self.events.lock().push(event);
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A complete simulated device: every collaborator plus the receiving end
/// of the submission wake-up.
pub struct SimDevice {
    pub regs: Arc<SimRegisters>,
    pub dma: Arc<SimDma>,
    pub canvas: Arc<SimCanvas>,
    pub queue: Arc<SimQueue>,
    pub events: Arc<SimEvents>,
    pub submit_rx: Receiver<()>,
    waker: SubmitWaker,
}

impl SimDevice {
    pub fn new() -> Self {
        let (waker, submit_rx) = SubmitWaker::new();
        Self {
            regs: Arc::new(SimRegisters::new()),
            dma: Arc::new(SimDma::new()),
            canvas: Arc::new(SimCanvas::new(256)),
            queue: Arc::new(SimQueue::new()),
            events: Arc::new(SimEvents::new()),
            submit_rx,
            waker,
        }
    }

    pub fn core(&self) -> Core {
        Core {
            regs: self.regs.clone(),
            dma: self.dma.clone(),
            canvas: self.canvas.clone(),
        }
    }

    /// H.264 session on this device.
    pub fn session(&self, config: SessionConfig) -> VdecResult<Arc<Session>> {
        let sess = Session::new(
            self.core(),
            CodecKind::H264,
            &config,
            self.queue.clone(),
            self.events.clone(),
            self.waker.clone(),
        )?;
        Ok(Arc::new(sess))
    }

    /// H.264 session with blank extended firmware loaded and started.
    pub fn started_h264_session(&self, config: SessionConfig) -> VdecResult<Arc<Session>> {
        let sess = self.session(config)?;
        sess.load_extended_firmware(&vec![0u8; SIZE_EXT_FW])?;
        sess.start()?;
        Ok(sess)
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}
