//! Two-stage interrupt plumbing.
//!
//! [`IrqLine::raise`] is the interrupt entry point: it runs the codec's top
//! half in the caller's context and, when asked to, wakes the bottom-half
//! worker through a preallocated bounded(1) channel. Pending wake-ups
//! coalesce, so raising never blocks and never allocates. The worker runs
//! [`Session::threaded_isr`] once per wake-up until the line is dropped.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::codec::IrqReturn;
use crate::session::Session;

#[derive(Default)]
struct Handled {
    count: Mutex<u64>,
    cond: Condvar,
}

/// Interrupt source bound to one session.
pub struct IrqLine {
    session: Arc<Session>,
    tx: Sender<()>,
    woken: AtomicU64,
    handled: Arc<Handled>,
}

impl IrqLine {
    /// Deliver one interrupt.
    pub fn raise(&self) -> IrqReturn {
        let ret = self.session.isr();
        if ret == IrqReturn::WakeThread {
            match self.tx.try_send(()) {
                Ok(()) => {
                    self.woken.fetch_add(1, Ordering::AcqRel);
                }
                // Already pending; that run covers this interrupt too.
                Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    warn!("IRQ thread gone, interrupt lost");
                }
            }
        }
        ret
    }

    /// Wait until every bottom half woken so far has finished.
    /// Returns `false` on timeout.
    pub fn synchronize(&self, timeout: Duration) -> bool {
        let target = self.woken.load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;
        let mut count = self.handled.count.lock();
        while *count < target {
            if self.handled.cond.wait_until(&mut count, deadline).timed_out() {
                return *count >= target;
            }
        }
        true
    }

    /// Bottom-half runs completed.
    pub fn handled(&self) -> u64 {
        *self.handled.count.lock()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// Bottom-half worker.
pub struct IrqThread;

impl IrqThread {
    /// Start the worker for `session`. Dropping the returned line stops it;
    /// join the handle to wait for the last bottom half.
    pub fn spawn(session: Arc<Session>) -> io::Result<(IrqLine, JoinHandle<()>)> {
        let (tx, rx) = channel::bounded(1);
        let handled = Arc::new(Handled::default());

        let worker_session = Arc::clone(&session);
        let worker_handled = Arc::clone(&handled);
        let handle = thread::Builder::new()
            .name("vdec-irq".into())
            .spawn(move || run(worker_session, rx, worker_handled))?;

        let line = IrqLine {
            session,
            tx,
            woken: AtomicU64::new(0),
            handled,
        };
        Ok((line, handle))
    }
}

fn run(session: Arc<Session>, rx: Receiver<()>, handled: Arc<Handled>) {
    debug!(codec = session.codec_kind().name(), "IRQ thread started");
    while rx.recv().is_ok() {
        session.threaded_isr();
        *handled.count.lock() += 1;
        handled.cond.notify_all();
    }
    debug!("IRQ thread exiting");
}
