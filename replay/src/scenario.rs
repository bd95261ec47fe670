//! Scenario file format.
//!
//! ```json
//! {
//!   "config": { "width": 320, "height": 240, "vififo_size": 100000 },
//!   "buffers": 4,
//!   "steps": [
//!     { "step": "set_param", "mb_total": 300, "mb_width": 20, "max_ref": 1 },
//!     { "step": "submit", "timestamp": 1, "offset": 0 },
//!     { "step": "frames_ready", "frames": [{ "index": 0, "offset": 100 }] }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use vdec_common::SessionConfig;

fn default_buffers() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: SessionConfig,
    /// Capture buffers queued before the session starts.
    #[serde(default = "default_buffers")]
    pub buffers: u32,
    /// Put completed buffers straight back into the capture queue.
    #[serde(default = "default_true")]
    pub requeue: bool,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing scenario {}", path.display()))
    }
}

/// One scripted action, either host-side or a firmware report.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Host wrote a compressed unit into the FIFO.
    Submit { timestamp: u64, offset: i32 },

    /// Host forgets a unit by timestamp.
    RemoveTimestamp { timestamp: u64 },

    /// Firmware reports stream geometry.
    SetParam {
        mb_total: u32,
        mb_width: u32,
        max_ref: u32,
    },

    /// Firmware reports decoded pictures.
    FramesReady { frames: Vec<FrameReport> },

    /// Firmware posts a raw command word (fatal errors, bad geometry).
    Command {
        cmd: u32,
        /// Value left in the parsed-info register for the log.
        #[serde(default)]
        info: u32,
    },

    /// Consumer returned a buffer for the engine to reuse.
    Recycle { index: u32 },

    /// Host requests a drain.
    Drain,

    /// Host leaves drain mode.
    Resume,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FrameReport {
    pub index: u32,
    pub offset: u32,
    #[serde(default)]
    pub pic_struct: u32,
    #[serde(default)]
    pub error: bool,
}

/// One completed capture buffer, as printed by the tool.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedBuffer {
    pub index: u32,
    pub state: &'static str,
    pub timestamp: u64,
    pub sequence: u32,
    pub field: String,
    pub last: bool,
    pub bytesused: Vec<u32>,
}

/// End-of-run summary.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub completed: Vec<CompletedBuffer>,
    pub eos_events: usize,
    pub frames_done: u64,
    pub frames_errored: u64,
    pub pending_bufs: i32,
    pub ledger_depth: usize,
    pub aborted: bool,
}
