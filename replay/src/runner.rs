//! Drives a scenario through a simulated device and the real IRQ thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info};

use vdec_decoder::codec::h264::SIZE_EXT_FW;
use vdec_decoder::regs::AV_SCRATCH_1;
use vdec_decoder::sim::{SimDevice, SimFrame};
use vdec_decoder::{BufferState, IrqLine, IrqThread, RegisterIo, Session};

use crate::scenario::{CompletedBuffer, Report, Scenario, Step};

pub struct Runner {
    dev: SimDevice,
    sess: Arc<Session>,
    line: IrqLine,
    worker: JoinHandle<()>,
    requeue: bool,
    timeout: Duration,
    completed: Vec<CompletedBuffer>,
}

impl Runner {
    /// Queue the capture buffers, load firmware and start the session.
    pub fn start(scenario: &Scenario, firmware: Option<Vec<u8>>, timeout: Duration) -> anyhow::Result<Self> {
        let dev = SimDevice::new();
        let config = &scenario.config;
        dev.queue
            .add_buffers(config.pixel_format, scenario.buffers, config.width, config.height);

        let sess = dev
            .session(config.clone())
            .context("creating decode session")?;
        let firmware = firmware.unwrap_or_else(|| vec![0u8; SIZE_EXT_FW]);
        sess.load_extended_firmware(&firmware)
            .context("loading extended firmware")?;
        sess.start().context("starting decode session")?;

        let (line, worker) =
            IrqThread::spawn(Arc::clone(&sess)).context("spawning IRQ thread")?;

        Ok(Self {
            dev,
            sess,
            line,
            worker,
            requeue: scenario.requeue,
            timeout,
            completed: Vec::new(),
        })
    }

    pub fn run(mut self, steps: &[Step]) -> anyhow::Result<Report> {
        for (n, step) in steps.iter().enumerate() {
            debug!(step = n, ?step, "Replaying");
            self.step(step)
                .with_context(|| format!("step {n} ({step:?})"))?;
        }
        self.finish()
    }

    fn step(&mut self, step: &Step) -> anyhow::Result<()> {
        match step {
            Step::Submit { timestamp, offset } => self.sess.submit(*timestamp, *offset),
            Step::RemoveTimestamp { timestamp } => self.sess.remove_ts(*timestamp),
            Step::SetParam {
                mb_total,
                mb_width,
                max_ref,
            } => {
                self.dev.regs.post_set_param(*mb_total, *mb_width, *max_ref);
                self.interrupt()?;
            }
            Step::FramesReady { frames } => {
                let frames: Vec<SimFrame> = frames
                    .iter()
                    .map(|f| SimFrame {
                        index: f.index,
                        offset: f.offset,
                        pic_struct: f.pic_struct,
                        error: f.error,
                    })
                    .collect();
                self.dev.regs.post_frames_ready(&frames);
                self.interrupt()?;
            }
            Step::Command { cmd, info } => {
                self.dev.regs.write_dos(AV_SCRATCH_1, *info);
                self.dev.regs.post_command(*cmd);
                self.interrupt()?;
            }
            Step::Recycle { index } => {
                self.sess
                    .queue_recycle(*index)
                    .with_context(|| format!("recycling buffer {index}"))?;
                let recycled = self.sess.pump_recycle();
                debug!(index, recycled, "Recycle requested");
            }
            Step::Drain => self.sess.request_stop(),
            Step::Resume => self.sess.resume(),
        }
        Ok(())
    }

    fn interrupt(&mut self) -> anyhow::Result<()> {
        self.line.raise();
        if !self.line.synchronize(self.timeout) {
            bail!("bottom half did not finish within {:?}", self.timeout);
        }
        self.collect();
        Ok(())
    }

    fn collect(&mut self) {
        for (buf, state) in self.dev.queue.take_done() {
            let entry = CompletedBuffer {
                index: buf.index,
                state: match state {
                    BufferState::Done => "done",
                    BufferState::Error => "error",
                },
                timestamp: buf.timestamp,
                sequence: buf.sequence,
                field: format!("{:?}", buf.field),
                last: buf.last,
                bytesused: buf.planes.iter().map(|p| p.bytesused).collect(),
            };
            info!(
                buf_idx = entry.index,
                state = entry.state,
                timestamp = entry.timestamp,
                sequence = entry.sequence,
                last = entry.last,
                "Buffer completed"
            );
            self.completed.push(entry);
            if self.requeue {
                self.dev.queue.requeue(buf);
            }
        }
    }

    fn finish(self) -> anyhow::Result<Report> {
        let Self {
            dev,
            sess,
            line,
            worker,
            completed,
            ..
        } = self;

        drop(line);
        worker
            .join()
            .map_err(|_| anyhow!("IRQ thread panicked"))?;

        let stats = sess.stats();
        let report = Report {
            completed,
            eos_events: dev.events.events().len(),
            frames_done: stats.frames_done,
            frames_errored: stats.frames_errored,
            pending_bufs: stats.pending_bufs,
            ledger_depth: stats.ledger_depth,
            aborted: stats.aborted,
        };

        sess.stop().context("stopping decode session")?;
        if dev.dma.live_allocations() != 0 {
            bail!("{} DMA regions leaked", dev.dma.live_allocations());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_unit_scenario() {
        let json = r#"{
            "config": { "width": 320, "height": 240, "vififo_size": 100000 },
            "steps": [
                { "step": "set_param", "mb_total": 300, "mb_width": 20, "max_ref": 1 },
                { "step": "submit", "timestamp": 1, "offset": 0 },
                { "step": "submit", "timestamp": 2, "offset": 5000 },
                { "step": "submit", "timestamp": 3, "offset": 90000 },
                { "step": "frames_ready", "frames": [{ "index": 0, "offset": 4900 }] },
                { "step": "frames_ready", "frames": [{ "index": 1, "offset": 200 }] }
            ]
        }"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        let runner = Runner::start(&scenario, None, Duration::from_secs(5)).unwrap();
        let report = runner.run(&scenario.steps).unwrap();

        assert_eq!(report.completed.len(), 2);
        assert_eq!(report.completed[0].timestamp, 2);
        assert_eq!(report.completed[0].state, "done");
        assert_eq!(report.completed[1].state, "error");
        assert_eq!(report.pending_bufs, 0);
        assert_eq!(report.ledger_depth, 0);
    }

    #[test]
    fn drain_scenario_ends_with_eos() {
        let scenario: Scenario =
            serde_json::from_str(include_str!("../scenarios/drain_1080p.json")).unwrap();
        let runner = Runner::start(&scenario, None, Duration::from_secs(5)).unwrap();
        let report = runner.run(&scenario.steps).unwrap();

        assert_eq!(report.frames_done, 3);
        assert_eq!(report.eos_events, 1);
        assert!(report.completed[2].last);
        assert_eq!(report.completed[1].field, "InterlacedTb");
        assert_eq!(report.completed[0].bytesused, vec![2_073_600, 1_036_800]);
    }

    #[test]
    fn bad_width_aborts() {
        let json = r#"{
            "config": { "width": 320, "height": 240 },
            "steps": [{ "step": "command", "cmd": 7, "info": 511 }]
        }"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        let runner = Runner::start(&scenario, None, Duration::from_secs(5)).unwrap();
        let report = runner.run(&scenario.steps).unwrap();
        assert!(report.aborted);
    }

    #[test]
    fn out_of_range_recycle_fails_the_step() {
        let json = r#"{
            "config": { "width": 320, "height": 240 },
            "steps": [{ "step": "recycle", "index": 4294967295 }]
        }"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        let runner = Runner::start(&scenario, None, Duration::from_secs(5)).unwrap();
        let err = runner.run(&scenario.steps).unwrap_err();
        assert!(format!("{err:#}").contains("recycling buffer 4294967295"));
    }

    #[test]
    fn short_firmware_fails_start() {
        let scenario: Scenario = serde_json::from_str(r#"{ "steps": [] }"#).unwrap();
        let err = Runner::start(&scenario, Some(vec![0u8; 100]), Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("too small"));
    }
}
