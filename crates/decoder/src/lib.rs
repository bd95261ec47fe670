//! `vdec-decoder`: host-side orchestration for an interrupt-driven hardware
//! video decoder.
//!
//! - **Ledger**: in-flight timestamps matched against engine-reported FIFO
//!   offsets (`ledger`)
//! - **Completion**: decoded capture buffers stamped and handed back
//!   (`dispatch`)
//! - **Codec**: operation table and the H.264 parameter/ISR state machine
//!   (`codec`)
//! - **Interrupts**: top half plus bottom-half worker thread (`irq`)
//! - **Collaborators**: register, DMA, canvas and buffer-queue traits, with
//!   an in-memory implementation in `sim`

pub mod canvas;
pub mod codec;
pub mod dispatch;
pub mod dma;
pub mod irq;
pub mod ledger;
pub mod queue;
pub mod regs;
pub mod session;
pub mod sim;

pub use codec::{Codec, CodecKind, CodecOps, H264Codec, IrqContext, IrqReturn};
pub use dma::{DmaAllocator, DmaBuffer};
pub use irq::{IrqLine, IrqThread};
pub use ledger::{OffsetMatch, TimestampEntry, TimestampLedger};
pub use queue::{BufferQueue, BufferState, DecoderEvent, DstBuffer, EventSink, Plane};
pub use regs::RegisterIo;
pub use session::{Core, Session, SessionStats, SubmitWaker};
