//! Outer buffer-queue collaborator interfaces.
//!
//! The session never owns capture buffers outright: the framework queues
//! them, the session looks them up by index when the engine reports a
//! decoded picture, fills in the metadata, and hands them back.

use vdec_common::Field;

/// Final state of a capture buffer handed back to the queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Decoded picture with valid metadata.
    Done,
    /// The buffer could not be associated with a submitted unit.
    Error,
}

/// One memory plane of a capture buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    /// Bus address of the plane.
    pub paddr: u32,
    /// Allocated size in bytes.
    pub length: u32,
    /// Payload written by the decoder.
    pub bytesused: u32,
}

/// A capture (destination) buffer removed from the queue for completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DstBuffer {
    /// Index of the buffer inside its queue.
    pub index: u32,
    pub planes: Vec<Plane>,
    pub timestamp: u64,
    pub sequence: u32,
    pub field: Field,
    /// Last buffer of the stream after a drain.
    pub last: bool,
}

impl DstBuffer {
    pub fn new(index: u32, planes: Vec<Plane>) -> Self {
        Self {
            index,
            planes,
            ..Self::default()
        }
    }

    /// Bus address of plane `n`, if present.
    pub fn plane_paddr(&self, n: usize) -> Option<u32> {
        self.planes.get(n).map(|p| p.paddr)
    }
}

/// Access to the framework's capture and output queues.
pub trait BufferQueue: Send + Sync {
    /// Remove the ready capture buffer with `index`, if the framework still
    /// has it queued.
    fn dst_buf_remove_by_idx(&self, index: u32) -> Option<DstBuffer>;

    /// Hand a capture buffer back with its final state.
    fn dst_buf_done(&self, buf: DstBuffer, state: BufferState);

    /// Capture buffers currently queued and available to the engine, in
    /// queue order. Only plane addresses and indices are needed.
    fn ready_dst_buffers(&self) -> Vec<DstBuffer>;

    /// Number of capture buffers currently queued.
    fn num_dst_bufs_ready(&self) -> u32 {
        self.ready_dst_buffers().len() as u32
    }

    /// Put both queues into the error state: pending and future buffer
    /// operations fail fast.
    fn queue_error(&self);
}

/// Events delivered to whoever listens on the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderEvent {
    /// The last capture buffer of a drained stream has been returned.
    Eos,
}

pub trait EventSink: Send + Sync {
    fn queue_event(&self, event: DecoderEvent);
}
