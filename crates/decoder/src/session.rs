//! Decode session, the shared context every stage of the pipeline works on.
//!
//! `Session` owns the timestamp ledger, the canvas slots, the codec-private
//! state and the capture-side metadata of one decode. It is shared (`Arc`)
//! between three contexts:
//!
//! 1. the interrupt top half, which only reaches registers through
//!    [`IrqContext`](crate::codec::IrqContext);
//! 2. the interrupt bottom half ([`IrqThread`](crate::irq::IrqThread)),
//!    which runs the codec state machine and completes buffers;
//! 3. the submission worker, which records submitted units through
//!    [`Session::submit`] and is woken by [`SubmitWaker`] when completions
//!    free FIFO space.
//!
//! ## Lock ordering
//!
//! `codec` → `state`. The ledger lock is never held together with either;
//! the recycle queue lock is a leaf.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use vdec_common::{check_frame_size, PixelFormat, Rational, SessionConfig, VdecError, VdecResult};

use crate::canvas::{self, align_up, CanvasBank, CanvasProvider, CanvasSlots, CanvasTarget};
use crate::codec::{Codec, CodecKind, CodecOps, IrqContext, IrqReturn};
use crate::dma::DmaAllocator;
use crate::ledger::TimestampLedger;
use crate::queue::{BufferQueue, EventSink};
use crate::regs::RegisterIo;

// ---------------------------------------------------------------------------
// Hardware handles
// ---------------------------------------------------------------------------

/// Handles to the device-wide collaborators a session programs.
#[derive(Clone)]
pub struct Core {
    pub regs: Arc<dyn RegisterIo>,
    pub dma: Arc<dyn DmaAllocator>,
    pub canvas: Arc<dyn CanvasProvider>,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Submission wake-up
// ---------------------------------------------------------------------------

/// One-directional wake-up of the submission worker.
///
/// Wake-ups coalesce: if one is already pending, further ones are dropped.
#[derive(Clone, Debug)]
pub struct SubmitWaker {
    tx: Sender<()>,
}

impl SubmitWaker {
    /// Create the waker and the receiver the submission worker blocks on.
    pub fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = channel::bounded(1);
        (Self { tx }, rx)
    }

    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                debug!("Submission worker gone, dropping wake-up");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AM21C sizing
// ---------------------------------------------------------------------------

/// Body of an AM21C picture: 4 KiB per 64x32 block.
pub fn am21c_body_size(width: u32, height: u32) -> u32 {
    let width_64 = align_up(width, 64) / 64;
    let height_32 = align_up(height, 32) / 32;
    4096 * width_64 * height_32
}

/// Header of an AM21C picture: 32 bytes per 128x64 block.
pub fn am21c_head_size(width: u32, height: u32) -> u32 {
    let width_128 = align_up(width, 128) / 128;
    let height_64 = align_up(height, 64) / 64;
    32 * width_128 * height_64
}

/// Total AM21C picture size, aligned to 64 KiB.
pub fn am21c_size(width: u32, height: u32) -> u32 {
    align_up(
        am21c_body_size(width, height) + am21c_head_size(width, height),
        64 * 1024,
    )
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Capture-side state guarded by one lock.
#[derive(Debug)]
pub(crate) struct CaptureState {
    pub(crate) pixel_format: PixelFormat,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) sequence: u32,
    pub(crate) pixel_aspect: Rational,
    pub(crate) canvases: CanvasSlots,
}

/// Snapshot of session counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStats {
    /// Capture buffers completed with valid metadata.
    pub frames_done: u64,
    /// Capture buffers completed in error state.
    pub frames_errored: u64,
    /// Submitted units not yet completed or evicted.
    pub pending_bufs: i32,
    /// Entries currently in the timestamp ledger.
    pub ledger_depth: usize,
    /// Canvas descriptors held by the session.
    pub canvases_in_use: usize,
    pub keyframe_found: bool,
    pub aborted: bool,
}

/// One active decode context.
pub struct Session {
    core: Core,
    kind: CodecKind,
    codec: Mutex<Codec>,
    queue: Arc<dyn BufferQueue>,
    events: Arc<dyn EventSink>,
    waker: SubmitWaker,
    vififo_size: u32,
    pub(crate) ledger: TimestampLedger,
    pub(crate) state: Mutex<CaptureState>,
    recycle_queue: Mutex<VecDeque<u32>>,
    keyframe_found: AtomicBool,
    pub(crate) should_stop: AtomicBool,
    pub(crate) eos_sent: AtomicBool,
    aborted: AtomicBool,
    pub(crate) frames_done: AtomicU64,
    pub(crate) frames_errored: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("codec", &self.kind)
            .field("vififo_size", &self.vififo_size)
            .field("ledger_depth", &self.ledger.len())
            .field("pending_bufs", &self.ledger.pending())
            .field("keyframe_found", &self.keyframe_found())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl Session {
    /// Create a session for `kind` with the negotiated `config`.
    ///
    /// # Errors
    /// Returns `VdecError::InvalidArgument` if the configuration is unusable.
    pub fn new(
        core: Core,
        kind: CodecKind,
        config: &SessionConfig,
        queue: Arc<dyn BufferQueue>,
        events: Arc<dyn EventSink>,
        waker: SubmitWaker,
    ) -> VdecResult<Self> {
        config.validate()?;

        info!(
            codec = kind.name(),
            pixfmt = config.pixel_format.name(),
            width = config.width,
            height = config.height,
            vififo_size = config.vififo_size,
            "Decode session created"
        );

        Ok(Self {
            core,
            kind,
            codec: Mutex::new(kind.instantiate()),
            queue,
            events,
            waker,
            vififo_size: config.vififo_size,
            ledger: TimestampLedger::new(),
            state: Mutex::new(CaptureState {
                pixel_format: config.pixel_format,
                width: config.width,
                height: config.height,
                sequence: 0,
                pixel_aspect: Rational::ONE,
                canvases: CanvasSlots::new(config.max_canvas),
            }),
            recycle_queue: Mutex::new(VecDeque::new()),
            keyframe_found: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            eos_sent: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            frames_done: AtomicU64::new(0),
            frames_errored: AtomicU64::new(0),
        })
    }

    // ── codec operation table ─────────────────────────────────────

    /// Hand the codec its extended firmware blob.
    pub fn load_extended_firmware(&self, data: &[u8]) -> VdecResult<()> {
        self.codec.lock().load_extended_firmware(self, data)
    }

    /// Allocate codec memory and program the engine for decoding.
    pub fn start(&self) -> VdecResult<()> {
        if self.is_aborted() {
            return Err(VdecError::Aborted);
        }
        self.codec.lock().start(self)?;
        info!(codec = self.kind.name(), "Decode session started");
        Ok(())
    }

    /// Release codec memory and canvases and drop every in-flight timestamp.
    pub fn stop(&self) -> VdecResult<()> {
        let result = self.codec.lock().stop(self);
        self.release_canvases();
        self.ledger.clear();
        self.recycle_queue.lock().clear();
        self.keyframe_found.store(false, Ordering::Release);
        info!(codec = self.kind.name(), "Decode session stopped");
        result
    }

    /// Interrupt top half: acknowledge and decide whether to wake the
    /// bottom half. Only registers are reachable from here.
    pub fn isr(&self) -> IrqReturn {
        let irq = IrqContext::new(&*self.core.regs);
        self.kind.isr(&irq)
    }

    /// Interrupt bottom half: run the codec state machine.
    pub fn threaded_isr(&self) -> IrqReturn {
        self.codec.lock().threaded_isr(self)
    }

    /// Whether the engine can take another recycled capture buffer.
    pub fn can_recycle(&self) -> bool {
        self.codec.lock().can_recycle(&*self.core.regs)
    }

    /// Give capture buffer `buf_idx` back to the engine.
    pub fn recycle(&self, buf_idx: u32) -> VdecResult<()> {
        self.check_buf_idx(buf_idx)?;
        self.codec.lock().recycle(&*self.core.regs, buf_idx);
        Ok(())
    }

    // ── recycling ─────────────────────────────────────────────────

    /// Queue a capture buffer for recycling to the engine.
    pub fn queue_recycle(&self, buf_idx: u32) -> VdecResult<()> {
        self.check_buf_idx(buf_idx)?;
        self.recycle_queue.lock().push_back(buf_idx);
        Ok(())
    }

    fn check_buf_idx(&self, buf_idx: u32) -> VdecResult<()> {
        let max = self.kind.max_buf_idx();
        if buf_idx > max {
            return Err(VdecError::InvalidArgument(format!(
                "buffer index {buf_idx} above {max}"
            )));
        }
        Ok(())
    }

    /// Hand queued buffers to the engine while it has room for them.
    /// Returns how many were recycled.
    ///
    /// Must not be called from inside a codec callback (it takes the codec
    /// lock).
    pub fn pump_recycle(&self) -> usize {
        let codec = self.codec.lock();
        let regs = &*self.core.regs;
        let mut queue = self.recycle_queue.lock();
        let mut recycled = 0;
        while let Some(&idx) = queue.front() {
            if !codec.can_recycle(regs) {
                break;
            }
            codec.recycle(regs, idx);
            queue.pop_front();
            recycled += 1;
            debug!(buf_idx = idx, "Recycled capture buffer");
        }
        recycled
    }

    // ── submission side ───────────────────────────────────────────

    /// Record a compressed unit written at `offset` in the bitstream FIFO.
    pub fn submit(&self, timestamp: u64, offset: i32) {
        self.ledger.note_submitted();
        self.ledger.insert(timestamp, offset);
        debug!(timestamp, offset, "Queued timestamp");
    }

    /// Forget a submitted unit by timestamp (e.g. its output buffer was
    /// returned by the consumer). A miss is logged and ignored.
    pub fn remove_ts(&self, timestamp: u64) {
        let _ = self.ledger.remove_by_timestamp(timestamp);
    }

    /// Request a drain: the buffer completing the last pending unit is
    /// flagged as last and an end-of-stream event is emitted once.
    pub fn request_stop(&self) {
        self.eos_sent.store(false, Ordering::Release);
        self.should_stop.store(true, Ordering::Release);
        info!(pending = self.ledger.pending(), "Drain requested");
    }

    /// Leave drain mode.
    pub fn resume(&self) {
        self.should_stop.store(false, Ordering::Release);
    }

    // ── capture configuration ─────────────────────────────────────

    /// Change the capture geometry (format renegotiation). Sizes the
    /// session config would reject are refused and the old geometry kept.
    pub fn set_format(&self, pixel_format: PixelFormat, width: u32, height: u32) -> VdecResult<()> {
        check_frame_size(width, height)?;
        let mut state = self.state.lock();
        state.pixel_format = pixel_format;
        state.width = width;
        state.height = height;
        Ok(())
    }

    /// Bind canvases for every ready capture buffer, programming the
    /// bank-select registers described by `banks`.
    pub fn set_canvases(&self, banks: &[CanvasBank]) -> VdecResult<()> {
        let buffers = self.queue.ready_dst_buffers();
        let mut state = self.state.lock();
        let CaptureState {
            pixel_format,
            width,
            height,
            canvases,
            ..
        } = &mut *state;
        let mut target = CanvasTarget {
            provider: &*self.core.canvas,
            regs: &*self.core.regs,
            slots: canvases,
            pixel_format: *pixel_format,
            width: *width,
            height: *height,
        };
        canvas::set_canvases(&mut target, &buffers, banks)
    }

    /// Return every canvas descriptor the session holds.
    pub fn release_canvases(&self) {
        self.state.lock().canvases.release(&*self.core.canvas);
    }

    /// Derive the pixel aspect ratio from a display aspect ratio.
    pub fn set_par_from_dar(&self, dar_num: u32, dar_den: u32) {
        let mut state = self.state.lock();
        let num = u64::from(state.height) * u64::from(dar_num);
        let den = u64::from(state.width) * u64::from(dar_den);
        let div = gcd(num, den).max(1);
        let (Ok(num), Ok(den)) = (u32::try_from(num / div), u32::try_from(den / div)) else {
            warn!(dar_num, dar_den, "Pixel aspect ratio out of range, keeping {}", state.pixel_aspect);
            return;
        };
        let par = Rational::new(num, den);
        state.pixel_aspect = par;
        debug!(par = %par, "Pixel aspect ratio updated");
    }

    pub fn pixel_aspect(&self) -> Rational {
        self.state.lock().pixel_aspect
    }

    /// Luma payload of one capture buffer.
    pub fn output_size(&self) -> u32 {
        let state = self.state.lock();
        state.width * state.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.state.lock().pixel_format
    }

    pub fn frame_size(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.width, state.height)
    }

    // ── lifecycle flags ───────────────────────────────────────────

    /// Abort decoding: both buffer queues go to error state so pending and
    /// future operations fail fast.
    pub fn abort(&self) {
        info!("Aborting decoding session!");
        self.aborted.store(true, Ordering::Release);
        self.queue.queue_error();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn set_keyframe_found(&self) {
        self.keyframe_found.store(true, Ordering::Release);
    }

    /// Whether the first keyframe has been parsed and geometry is known.
    pub fn keyframe_found(&self) -> bool {
        self.keyframe_found.load(Ordering::Acquire)
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    // ── accessors ─────────────────────────────────────────────────

    pub fn codec_kind(&self) -> CodecKind {
        self.kind
    }

    pub fn regs(&self) -> &dyn RegisterIo {
        &*self.core.regs
    }

    pub fn dma(&self) -> &dyn DmaAllocator {
        &*self.core.dma
    }

    pub(crate) fn queue(&self) -> &dyn BufferQueue {
        &*self.queue
    }

    pub(crate) fn events(&self) -> &dyn EventSink {
        &*self.events
    }

    pub(crate) fn waker(&self) -> &SubmitWaker {
        &self.waker
    }

    pub fn vififo_size(&self) -> u32 {
        self.vififo_size
    }

    /// Capture buffers currently queued by the framework.
    pub fn num_dst_bufs_ready(&self) -> u32 {
        self.queue.num_dst_bufs_ready()
    }

    pub fn ledger(&self) -> &TimestampLedger {
        &self.ledger
    }

    /// Submitted units still awaiting completion.
    pub fn pending_bufs(&self) -> i32 {
        self.ledger.pending()
    }

    pub fn stats(&self) -> SessionStats {
        let canvases_in_use = self.state.lock().canvases.in_use();
        SessionStats {
            frames_done: self.frames_done.load(Ordering::Relaxed),
            frames_errored: self.frames_errored.load(Ordering::Relaxed),
            pending_bufs: self.ledger.pending(),
            ledger_depth: self.ledger.len(),
            canvases_in_use,
            keyframe_found: self.keyframe_found(),
            aborted: self.is_aborted(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let canvases = self.state.get_mut().canvases.in_use();
        if canvases > 0 {
            warn!(canvases, "Session dropped without stop, releasing canvases");
            self.state.get_mut().canvases.release(&*self.core.canvas);
        }
    }
}
