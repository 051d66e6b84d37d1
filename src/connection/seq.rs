//! Sequence number admission.
//!
//! A bounded pool holds one sequence number per request slot. Taking a number admits a call;
//! returning it advances the number by `queue_size` so that the next occupant of the same slot
//! can be told apart from a late reply to the previous one.
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use log::error;

use crate::{
    context::CallContext,
    error::{Error, Result},
};

/// Sequence numbers are `queue_size * SEQ_CYCLES` wide before wrapping.
pub(crate) const SEQ_CYCLES: u32 = 1_000_000;

#[derive(Debug)]
pub(crate) struct SequencePool {
    queue_size: u32,
    max_seq: u32,
    tx: Sender<u32>,
    rx: Receiver<u32>,
}

impl SequencePool {
    pub fn new(queue_size: u32) -> Self {
        assert!(queue_size > 0);

        let (tx, rx) = bounded(queue_size as usize);
        for seq in 0..queue_size {
            // Capacity equals queue_size, this cannot block.
            let _ = tx.try_send(seq);
        }
        Self {
            queue_size,
            max_seq: queue_size * SEQ_CYCLES,
            tx,
            rx,
        }
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size
    }

    /// Sentinel stored in a free slot; never a valid sequence number.
    pub fn max_seq(&self) -> u32 {
        self.max_seq
    }

    pub fn is_valid(&self, seq: u32) -> bool {
        seq < self.max_seq
    }

    pub fn slot_index(&self, seq: u32) -> usize {
        (seq % self.queue_size) as usize
    }

    /// Number the slot's next occupant will use.
    pub fn next(&self, seq: u32) -> u32 {
        let next = seq + self.queue_size;
        if next < self.max_seq {
            next
        } else {
            next - self.max_seq
        }
    }

    /// Waits for a free sequence number.
    ///
    /// Returns the number and the time left before the context deadline (`None` without one). A
    /// number obtained after the context expired is put back immediately.
    pub fn acquire(&self, ctx: &CallContext) -> Result<(u32, Option<Duration>)> {
        let seq = select! {
            recv(self.rx) -> seq => match seq {
                Ok(seq) => seq,
                Err(_) => return Err(Error::Closed),
            },
            recv(ctx.cancelled()) -> _ => return Err(Error::Cancelled),
            recv(ctx.expired()) -> _ => return Err(Error::Timeout),
        };

        if let Some(err) = ctx.err() {
            self.put_back(seq);
            return Err(err);
        }
        Ok((seq, ctx.remaining()))
    }

    /// Returns an unused number as is.
    fn put_back(&self, seq: u32) {
        self.push(seq);
    }

    /// Retires `seq` and admits the slot's next occupant.
    pub fn release(&self, seq: u32) {
        self.push(self.next(seq));
    }

    fn push(&self, seq: u32) {
        if let Err(TrySendError::Full(seq)) = self.tx.try_send(seq) {
            error!("sequence pool overflow, dropping seq {seq}");
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.rx.len()
    }
}
