//! Write coalescing.
//!
//! Callers append encoded frames to the active buffer and kick the writer. The writer swaps the
//! active buffer with its spare under the lock and writes the swapped-out batch outside of it, so
//! a caller never waits on the network.
use std::{
    io::{self, Write},
    mem,
};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::trace;
use parking_lot::Mutex;

use super::signal::Signal;

const BUF_CAP: usize = 16 * 1024;

#[derive(Debug)]
pub(crate) struct WritePipeline {
    active: Mutex<Vec<u8>>,
    kick_tx: Sender<()>,
    kick_rx: Receiver<()>,
}

impl WritePipeline {
    pub fn new() -> Self {
        let (kick_tx, kick_rx) = bounded(1);
        Self {
            active: Mutex::new(Vec::with_capacity(BUF_CAP)),
            kick_tx,
            kick_rx,
        }
    }

    /// Queues an encoded frame for the writer.
    pub fn submit(&self, frame: &[u8]) {
        self.active.lock().extend_from_slice(frame);
        // A pending kick already guarantees a wakeup.
        let _ = self.kick_tx.try_send(());
    }

    /// Swaps the queued bytes into `spare`. Returns false when nothing was queued.
    fn swap(&self, spare: &mut Vec<u8>) -> bool {
        let mut active = self.active.lock();
        if active.is_empty() {
            return false;
        }
        mem::swap(&mut *active, spare);
        true
    }

    /// Flushes queued frames to `sink` until `errored` fires or a write fails.
    pub fn run<W: Write>(&self, mut sink: W, errored: &Signal) -> io::Result<()> {
        let mut spare = Vec::with_capacity(BUF_CAP);
        loop {
            select! {
                recv(errored.receiver()) -> _ => return Ok(()),
                recv(self.kick_rx) -> _ => {}
            }

            if !self.swap(&mut spare) {
                if errored.is_fired() {
                    return Ok(());
                }
                continue;
            }

            trace!("flushing {} bytes", spare.len());
            sink.write_all(&spare)?;
            spare.clear();
        }
    }
}
