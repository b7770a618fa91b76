//! Background frame submission.
//!
//! Each frame slot has a bounded channel carrying finished frames to the
//! worker and one carrying the "fence attached" acknowledgment back. Dropping
//! the senders stops the worker.

use crate::backend::RenderBackend;
use crate::error::{RenderError, Result};
use crate::frame::{run_frame, FrameOutcome, Shared};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// A finished frame waiting for translation and submission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameBatch {
    pub slot: usize,
    /// Frame counter, for logging.
    pub frame: u64,
}

/// `None` when the frame failed; the error has already been logged.
type Ack = Option<FrameOutcome>;

pub(crate) struct FrameWorker {
    batch_tx: Vec<Sender<FrameBatch>>,
    ack_rx: Vec<Receiver<Ack>>,
    pending: Vec<bool>,
    thread: Option<JoinHandle<()>>,
}

impl FrameWorker {
    pub fn spawn<B: RenderBackend>(shared: Arc<Shared<B>>, name: &str) -> Result<Self> {
        let slots = shared.slots.len();
        let first = shared.backend.current_frame();
        let (batch_tx, batch_rx): (Vec<_>, Vec<_>) = (0..slots).map(|_| bounded(1)).unzip();
        let (ack_tx, ack_rx): (Vec<_>, Vec<_>) = (0..slots).map(|_| bounded(1)).unzip();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&shared, &batch_rx, &ack_tx, first))?;
        info!(name, slots, "Frame worker started");

        Ok(Self {
            batch_tx,
            ack_rx,
            pending: vec![false; slots],
            thread: Some(thread),
        })
    }

    /// Hand a finished frame to the worker.
    pub fn submit(&mut self, batch: FrameBatch) -> Result<()> {
        assert!(
            !self.pending[batch.slot],
            "frame slot {} submitted twice without retiring",
            batch.slot
        );
        self.batch_tx[batch.slot]
            .send(batch)
            .map_err(|_| RenderError::WorkerDisconnected)?;
        self.pending[batch.slot] = true;
        Ok(())
    }

    /// Block until the worker attached the fence of the frame pending in `slot`.
    ///
    /// Returns `None` when nothing was pending or the frame failed.
    pub fn wait_fence_attached(&mut self, slot: usize) -> Result<Option<FrameOutcome>> {
        if !self.pending[slot] {
            return Ok(None);
        }
        let ack = self.ack_rx[slot]
            .recv()
            .map_err(|_| RenderError::WorkerDisconnected)?;
        self.pending[slot] = false;
        Ok(ack)
    }

    /// Wait for every pending frame. Outcomes are returned in slot order.
    pub fn drain(&mut self) -> Result<Vec<FrameOutcome>> {
        let mut outcomes = Vec::new();
        for slot in 0..self.pending.len() {
            outcomes.extend(self.wait_fence_attached(slot)?);
        }
        Ok(outcomes)
    }

    /// Close the channels and join the thread.
    pub fn shutdown(&mut self) {
        self.batch_tx.clear();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Frame worker panicked");
            } else {
                info!("Frame worker stopped");
            }
        }
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<B: RenderBackend>(
    shared: &Shared<B>,
    batches: &[Receiver<FrameBatch>],
    acks: &[Sender<Ack>],
    first: usize,
) {
    let mut next = first;
    while let Ok(batch) = batches[next].recv() {
        debug!(slot = batch.slot, frame = batch.frame, "Worker running frame");
        let ack = match run_frame(shared, batch.slot) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(slot = batch.slot, frame = batch.frame, "Frame submission failed: {e}");
                None
            }
        };
        if acks[batch.slot].send(ack).is_err() {
            break;
        }
        next = (next + 1) % batches.len();
    }
}
