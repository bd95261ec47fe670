//! Buffer completion: match a decoded capture buffer to the unit it came
//! from and hand it back to the queue.

use std::sync::atomic::Ordering;

use tracing::{debug, error, info};

use vdec_common::{Field, PixelFormat};

use crate::queue::{BufferState, DecoderEvent, DstBuffer};
use crate::session::{am21c_size, Session};

/// Payload per plane of a decoded `width` x `height` picture.
fn plane_payloads(pixel_format: PixelFormat, width: u32, height: u32) -> Vec<u32> {
    let luma = width * height;
    match pixel_format {
        PixelFormat::Nv12m => vec![luma, luma / 2],
        PixelFormat::Yuv420m => vec![luma, luma / 4, luma / 4],
        PixelFormat::Am21c => vec![am21c_size(width, height)],
    }
}

impl Session {
    /// Complete capture buffer `buf_idx`, reported by the engine as decoded
    /// from FIFO position `offset`.
    ///
    /// A negative `offset` means the codec cannot report one; the oldest
    /// submitted unit is taken instead. A buffer that matches no unit is
    /// returned in error state, and so is every buffer completed after the
    /// session aborted (its unit still leaves the ledger).
    pub fn dst_buf_done_idx(&self, buf_idx: u32, offset: i32, field: Field) {
        let Some(buf) = self.queue().dst_buf_remove_by_idx(buf_idx) else {
            error!(buf_idx, "Buffer not found in dst queue");
            // Keep the ledger in step with the engine.
            let _ = self.ledger.remove_oldest();
            return;
        };

        let timestamp = if offset >= 0 {
            let found = self.ledger.match_by_offset(offset, self.vififo_size());
            if found.evicted > 0 {
                debug!(evicted = found.evicted, offset, "Dropped timestamps without picture");
            }
            found.timestamp
        } else {
            self.ledger.take_oldest().map(|entry| entry.timestamp)
        };

        if self.is_aborted() {
            if timestamp.is_some() {
                self.ledger.note_completed();
            }
            debug!(buf_idx, offset, "Session aborted, returning buffer in error");
            self.frames_errored.fetch_add(1, Ordering::Relaxed);
            self.queue().dst_buf_done(buf, BufferState::Error);
            return;
        }

        let Some(timestamp) = timestamp else {
            error!(buf_idx, offset, "Buffer has no matching timestamp");
            self.frames_errored.fetch_add(1, Ordering::Relaxed);
            self.queue().dst_buf_done(buf, BufferState::Error);
            return;
        };

        self.dst_buf_done(buf, timestamp, field);
    }

    fn dst_buf_done(&self, mut buf: DstBuffer, timestamp: u64, field: Field) {
        {
            let mut state = self.state.lock();
            let payloads = plane_payloads(state.pixel_format, state.width, state.height);
            for (plane, bytesused) in buf.planes.iter_mut().zip(payloads) {
                plane.bytesused = bytesused;
            }
            buf.sequence = state.sequence;
            state.sequence = state.sequence.wrapping_add(1);
        }
        buf.timestamp = timestamp;
        buf.field = field;

        self.ledger.note_completed();

        if self.should_stop() && self.ledger.is_empty() {
            buf.last = true;
            if !self.eos_sent.swap(true, Ordering::AcqRel) {
                info!(buf_idx = buf.index, "Sending EOS");
                self.events().queue_event(DecoderEvent::Eos);
            }
        } else {
            debug!(remaining = self.ledger.len(), "Buffers still in flight");
        }

        debug!(
            buf_idx = buf.index,
            timestamp,
            sequence = buf.sequence,
            last = buf.last,
            "Capture buffer done"
        );
        self.queue().dst_buf_done(buf, BufferState::Done);
        self.frames_done.fetch_add(1, Ordering::Relaxed);
        self.waker().wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use vdec_common::{SessionConfig, MAX_FRAME_DIM};

    fn device(pixel_format: PixelFormat, width: u32, height: u32) -> (SimDevice, std::sync::Arc<Session>) {
        let dev = SimDevice::new();
        dev.queue.add_buffers(pixel_format, 4, width, height);
        let sess = dev
            .session(SessionConfig::new(pixel_format, width, height))
            .unwrap();
        (dev, sess)
    }

    #[test]
    fn nv12m_1080p_completion() {
        let (dev, sess) = device(PixelFormat::Nv12m, 1920, 1080);
        sess.submit(1000, 0);
        sess.dst_buf_done_idx(2, 100, Field::InterlacedTb);

        let done = dev.queue.take_done();
        assert_eq!(done.len(), 1);
        let (buf, state) = &done[0];
        assert_eq!(*state, BufferState::Done);
        assert_eq!(buf.index, 2);
        assert_eq!(buf.planes[0].bytesused, 2_073_600);
        assert_eq!(buf.planes[1].bytesused, 1_036_800);
        assert_eq!(buf.timestamp, 1000);
        assert_eq!(buf.sequence, 0);
        assert_eq!(buf.field, Field::InterlacedTb);
        assert!(!buf.last);
        assert_eq!(sess.pending_bufs(), 0);
        assert!(dev.submit_rx.try_recv().is_ok());
    }

    #[test]
    fn yuv420m_and_am21c_payloads() {
        assert_eq!(
            plane_payloads(PixelFormat::Yuv420m, 640, 480),
            vec![307_200, 76_800, 76_800]
        );
        assert_eq!(
            plane_payloads(PixelFormat::Am21c, 1920, 1080),
            vec![4_194_304]
        );
    }

    #[test]
    fn sequence_increments_per_completion() {
        let (dev, sess) = device(PixelFormat::Nv12m, 320, 240);
        sess.submit(1, 0);
        sess.submit(2, 10_000);
        sess.dst_buf_done_idx(0, 0, Field::None);
        sess.dst_buf_done_idx(1, 10_000, Field::None);

        let seqs: Vec<_> = dev
            .queue
            .take_done()
            .iter()
            .map(|(b, _)| (b.timestamp, b.sequence))
            .collect();
        assert_eq!(seqs, vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn missing_buffer_drops_oldest_unit() {
        let (dev, sess) = device(PixelFormat::Nv12m, 320, 240);
        sess.submit(5, 0);
        sess.submit(6, 8192);
        sess.dst_buf_done_idx(31, 0, Field::None);

        assert!(dev.queue.take_done().is_empty());
        assert_eq!(sess.ledger().len(), 1);
        assert_eq!(sess.pending_bufs(), 1);
        assert_eq!(sess.ledger().snapshot()[0].timestamp, 6);
    }

    #[test]
    fn negative_offset_takes_head() {
        let (dev, sess) = device(PixelFormat::Nv12m, 320, 240);
        sess.submit(7, 50_000);
        sess.submit(8, 0);
        sess.dst_buf_done_idx(0, -1, Field::None);

        let done = dev.queue.take_done();
        assert_eq!(done[0].0.timestamp, 7);
        assert_eq!(sess.pending_bufs(), 1);
    }

    #[test]
    fn unmatched_buffer_completes_in_error() {
        let (dev, sess) = device(PixelFormat::Nv12m, 320, 240);
        sess.dst_buf_done_idx(1, 100, Field::None);

        let done = dev.queue.take_done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1, BufferState::Error);
        assert_eq!(sess.stats().frames_errored, 1);
        assert_eq!(sess.stats().frames_done, 0);
        // Nothing to wake the submitter for.
        assert!(dev.submit_rx.try_recv().is_err());
    }

    #[test]
    fn completion_after_abort_is_an_error() {
        let (dev, sess) = device(PixelFormat::Nv12m, 320, 240);
        sess.abort();
        sess.submit(7, 0);
        sess.dst_buf_done_idx(1, 0, Field::None);

        let done: Vec<_> = dev
            .queue
            .take_done()
            .into_iter()
            .map(|(b, state)| (b.index, state))
            .collect();
        assert_eq!(done, vec![(1, BufferState::Error)]);
        // The unit is consumed all the same.
        assert!(sess.ledger().is_empty());
        assert_eq!(sess.pending_bufs(), 0);
        let stats = sess.stats();
        assert_eq!((stats.frames_done, stats.frames_errored), (0, 1));
        assert!(dev.events.events().is_empty());
    }

    #[test]
    fn largest_frame_payloads_fit() {
        let (dev, sess) = device(PixelFormat::Nv12m, MAX_FRAME_DIM, MAX_FRAME_DIM);
        sess.submit(1, 0);
        sess.dst_buf_done_idx(0, 0, Field::None);
        let done = dev.queue.take_done();
        let used: Vec<u32> = done[0].0.planes.iter().map(|p| p.bytesused).collect();
        assert_eq!(used, vec![64 * 1024 * 1024, 32 * 1024 * 1024]);

        assert_eq!(
            plane_payloads(PixelFormat::Am21c, MAX_FRAME_DIM, MAX_FRAME_DIM),
            vec![4096 * 128 * 256 + 32 * 64 * 128]
        );
    }

    #[test]
    fn drain_flags_last_buffer_and_sends_eos_once() {
        let (dev, sess) = device(PixelFormat::Nv12m, 320, 240);
        sess.submit(1, 0);
        sess.submit(2, 10_000);
        sess.request_stop();

        sess.dst_buf_done_idx(0, 0, Field::None);
        assert!(dev.events.events().is_empty());

        sess.dst_buf_done_idx(1, 10_000, Field::None);
        let done = dev.queue.take_done();
        assert!(!done[0].0.last);
        assert!(done[1].0.last);
        assert_eq!(dev.events.events(), vec![DecoderEvent::Eos]);

        // A stray completion after the drain does not repeat the event.
        sess.submit(3, 20_000);
        sess.remove_ts(3);
        dev.queue.add_buffers(PixelFormat::Nv12m, 1, 320, 240);
        sess.dst_buf_done_idx(4, -1, Field::None);
        assert_eq!(dev.events.events().len(), 1);

        // A new drain re-arms it.
        sess.resume();
        sess.submit(4, 30_000);
        sess.request_stop();
        dev.queue.add_buffers(PixelFormat::Nv12m, 1, 320, 240);
        sess.dst_buf_done_idx(5, 30_000, Field::None);
        assert_eq!(dev.events.events().len(), 2);
    }
}
