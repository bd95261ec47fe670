//! Whole-session scenarios on the simulated device.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vdec_common::{Field, PixelFormat, SessionConfig};
use vdec_decoder::codec::h264::{CMD_FATAL_ERROR, PIC_BOT_TOP};
use vdec_decoder::regs::{AV_SCRATCH_7, AV_SCRATCH_8};
use vdec_decoder::sim::{SimDevice, SimFrame};
use vdec_decoder::{BufferState, DecoderEvent, IrqThread, RegisterIo, Session};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn configured(dev: &SimDevice, config: SessionConfig, buffers: u32) -> Arc<Session> {
    init_tracing();
    dev.queue
        .add_buffers(config.pixel_format, buffers, config.width, config.height);
    let sess = dev.started_h264_session(config).unwrap();
    // 320x240: 20 x 15 macroblocks
    dev.regs.post_set_param(300, 20, 1);
    sess.threaded_isr();
    assert!(sess.keyframe_found());
    sess
}

fn small() -> SessionConfig {
    SessionConfig::new(PixelFormat::Nv12m, 320, 240)
}

#[test]
fn three_units_with_eviction() {
    let dev = SimDevice::new();
    let config = SessionConfig {
        vififo_size: 100_000,
        ..small()
    };
    let sess = configured(&dev, config, 4);

    sess.submit(1, 0);
    sess.submit(2, 5000);
    sess.submit(3, 90_000);

    // Unit 1 produced no picture; the report lands on unit 2.
    dev.regs.post_frames_ready(&[SimFrame::new(0, 4900)]);
    sess.threaded_isr();
    let done = dev.queue.take_done();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].1, BufferState::Done);
    assert_eq!(done[0].0.timestamp, 2);
    assert_eq!(sess.ledger().len(), 1);
    assert_eq!(sess.pending_bufs(), 1);

    // Unit 3 sits more than half a FIFO ahead: it is stale after the wrap.
    dev.regs.post_frames_ready(&[SimFrame::new(1, 200)]);
    sess.threaded_isr();
    let done = dev.queue.take_done();
    assert_eq!(done[0].1, BufferState::Error);
    assert!(sess.ledger().is_empty());
    assert_eq!(sess.pending_bufs(), 0);

    let stats = sess.stats();
    assert_eq!((stats.frames_done, stats.frames_errored), (1, 1));
    sess.stop().unwrap();
}

#[test]
fn batch_report_with_wide_offsets() {
    let dev = SimDevice::new();
    let sess = configured(&dev, small(), 4);

    sess.submit(100, 0x12_3400);
    sess.submit(200, 0x25_0000);
    dev.regs.post_frames_ready(&[
        SimFrame::new(2, 0x12_3450).with_pic_struct(PIC_BOT_TOP),
        SimFrame::new(3, 0x25_0010),
    ]);
    sess.threaded_isr();

    let done = dev.queue.take_done();
    let got: Vec<_> = done
        .iter()
        .map(|(b, _)| (b.index, b.timestamp, b.field))
        .collect();
    assert_eq!(
        got,
        vec![(2, 100, Field::InterlacedBt), (3, 200, Field::None)]
    );
}

#[test]
fn drain_through_irq_thread() {
    let dev = SimDevice::new();
    let sess = configured(&dev, small(), 4);
    let (line, worker) = IrqThread::spawn(Arc::clone(&sess)).unwrap();

    for i in 0..3u64 {
        sess.submit(i * 40, (i * 10_000) as i32);
    }
    sess.request_stop();

    for i in 0..3u32 {
        dev.regs.post_frames_ready(&[SimFrame::new(i, i * 10_000)]);
        line.raise();
        assert!(line.synchronize(WAIT));
    }

    let done = dev.queue.take_done();
    let last: Vec<bool> = done.iter().map(|(b, _)| b.last).collect();
    assert_eq!(last, vec![false, false, true]);
    assert_eq!(dev.events.events(), vec![DecoderEvent::Eos]);
    assert!(dev.submit_rx.try_recv().is_ok());

    drop(line);
    worker.join().unwrap();
    sess.stop().unwrap();
    assert_eq!(dev.dma.live_allocations(), 0);
}

#[test]
fn fatal_report_aborts_and_stop_still_cleans_up() {
    let dev = SimDevice::new();
    let sess = configured(&dev, small(), 4);
    let (line, worker) = IrqThread::spawn(Arc::clone(&sess)).unwrap();

    dev.regs.post_command(CMD_FATAL_ERROR);
    line.raise();
    assert!(line.synchronize(WAIT));
    assert!(sess.stats().aborted);
    assert!(dev.queue.is_errored());

    drop(line);
    worker.join().unwrap();
    sess.stop().unwrap();
    assert_eq!(dev.dma.live_allocations(), 0);
    assert_eq!(dev.canvas.allocated(), 0);
    assert_eq!(sess.stats().canvases_in_use, 0);
}

#[test]
fn recycle_queue_waits_for_mailboxes() {
    let dev = SimDevice::new();
    let sess = configured(&dev, small(), 4);

    for idx in [0, 1, 2] {
        sess.queue_recycle(idx).unwrap();
    }
    assert_eq!(sess.pump_recycle(), 2);
    assert_eq!(dev.regs.read_dos(AV_SCRATCH_7), 1);
    assert_eq!(dev.regs.read_dos(AV_SCRATCH_8), 2);
    assert!(!sess.can_recycle());

    // Engine takes the first mailbox.
    dev.regs.write_dos(AV_SCRATCH_7, 0);
    assert_eq!(sess.pump_recycle(), 1);
    assert_eq!(dev.regs.read_dos(AV_SCRATCH_7), 3);
    assert_eq!(sess.pump_recycle(), 0);

    // Indices past the five-bit field never reach the mailboxes.
    assert!(sess.queue_recycle(u32::MAX).is_err());
    dev.regs.write_dos(AV_SCRATCH_8, 0);
    assert_eq!(sess.pump_recycle(), 0);
    assert_eq!(dev.regs.read_dos(AV_SCRATCH_8), 0);
}

#[test]
fn concurrent_submission_and_completion() {
    let dev = SimDevice::new();
    let sess = configured(&dev, small(), 4);
    let (line, worker) = IrqThread::spawn(Arc::clone(&sess)).unwrap();

    // Two submitters racing on the ledger.
    let submitters: Vec<_> = (0..2u64)
        .map(|half| {
            let sess = Arc::clone(&sess);
            thread::spawn(move || {
                for i in 0..16u64 {
                    let n = i * 2 + half;
                    sess.submit(n * 1000, (n * 8192) as i32);
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }
    assert_eq!(sess.pending_bufs(), 32);

    let mut completed = Vec::new();
    for n in 0..32u32 {
        let idx = n % 4;
        dev.regs.post_frames_ready(&[SimFrame::new(idx, n * 8192)]);
        line.raise();
        assert!(line.synchronize(WAIT));
        for (buf, state) in dev.queue.take_done() {
            assert_eq!(state, BufferState::Done);
            completed.push(buf.timestamp);
            dev.queue.requeue(buf);
        }
    }

    let expected: Vec<u64> = (0..32).map(|n| n * 1000).collect();
    assert_eq!(completed, expected);
    assert_eq!(sess.pending_bufs(), 0);
    assert_eq!(sess.stats().frames_done, 32);

    drop(line);
    worker.join().unwrap();
    sess.stop().unwrap();
}

#[test]
fn yuv420m_session_binds_three_planes() {
    let dev = SimDevice::new();
    let config = SessionConfig::new(PixelFormat::Yuv420m, 320, 240);
    let sess = configured(&dev, config, 2);
    assert_eq!(sess.stats().canvases_in_use, 6);

    sess.submit(5, 0);
    dev.regs.post_frames_ready(&[SimFrame::new(1, 0)]);
    sess.threaded_isr();
    let done = dev.queue.take_done();
    let used: Vec<u32> = done[0].0.planes.iter().map(|p| p.bytesused).collect();
    assert_eq!(used, vec![76_800, 19_200, 19_200]);
}
