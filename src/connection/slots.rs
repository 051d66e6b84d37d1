//! Request slot table.
//!
//! Each in-flight call owns one slot, picked by `seq % queue_size`. A slot's fields fall on two
//! sides of a synchronization boundary:
//!
//! - `seq`, `deadline` and `mode` are atomics, read without blocking on the hot path by the reader
//!   and the sweeper.
//! - The async completion lives under the slot mutex. Whoever takes it (reader, sweeper or the
//!   connection error path) also clears `deadline`, `seq` and `mode` while holding the lock, so a
//!   completion fires exactly once.
//!
//! A free slot holds the sentinel `max_seq` in `seq`.
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::{error::Result, protocol::Reply};

/// Callback invoked once with the outcome of an asynchronous call.
pub(crate) type Completion = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

/// A reply frame handed from the reader to a blocked synchronous caller.
#[derive(Debug)]
pub(crate) struct Answer {
    pub seq: u32,
    pub command: u16,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

const MODE_IDLE: u8 = 0;
const MODE_SYNC: u8 = 1;
const MODE_ASYNC: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotMode {
    Idle,
    Sync,
    Async,
}

pub(crate) struct RequestSlot {
    free: u32,
    seq: AtomicU32,
    /// Virtual clock tick after which an async call expires; 0 means never.
    deadline: AtomicU64,
    mode: AtomicU8,
    completion: Mutex<Option<Completion>>,
    reply_tx: Sender<Answer>,
    reply_rx: Receiver<Answer>,
}

impl RequestSlot {
    fn new(free: u32) -> Self {
        let (reply_tx, reply_rx) = bounded(1);
        Self {
            free,
            seq: AtomicU32::new(free),
            deadline: AtomicU64::new(0),
            mode: AtomicU8::new(MODE_IDLE),
            completion: Mutex::new(None),
            reply_tx,
            reply_rx,
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn matches(&self, seq: u32) -> bool {
        self.seq() == seq
    }

    pub fn is_free(&self) -> bool {
        self.seq() == self.free
    }

    pub fn mode(&self) -> SlotMode {
        match self.mode.load(Ordering::SeqCst) {
            MODE_SYNC => SlotMode::Sync,
            MODE_ASYNC => SlotMode::Async,
            _ => SlotMode::Idle,
        }
    }

    pub fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::SeqCst)
    }

    /// Registers a synchronous caller. The mode is published before the sequence number.
    pub fn arm_sync(&self, seq: u32) {
        self.mode.store(MODE_SYNC, Ordering::SeqCst);
        self.seq.store(seq, Ordering::SeqCst);
    }

    /// Frees a slot owned by a synchronous caller, discarding a reply that raced in.
    pub fn retire_sync(&self) {
        self.seq.store(self.free, Ordering::SeqCst);
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
        self.drain();
    }

    /// Registers an asynchronous call and its completion.
    pub fn arm_async(&self, seq: u32, deadline: u64, completion: Completion) {
        let mut guard = self.completion.lock();
        *guard = Some(completion);
        self.deadline.store(deadline, Ordering::SeqCst);
        self.mode.store(MODE_ASYNC, Ordering::SeqCst);
        self.seq.store(seq, Ordering::SeqCst);
        self.drain();
    }

    /// Takes the completion for a reply to `seq`, freeing the slot. `None` when the sweeper or the
    /// error path got there first.
    pub fn take_for_reply(&self, seq: u32) -> Option<Completion> {
        let mut guard = self.completion.lock();
        if guard.is_none() || self.seq() != seq {
            return None;
        }
        let completion = guard.take();
        self.deadline.store(0, Ordering::SeqCst);
        self.seq.store(self.free, Ordering::SeqCst);
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
        completion
    }

    /// Takes the completion of an async call whose deadline is at or before `now`.
    pub fn take_expired(&self, now: u64) -> Option<(u32, Completion)> {
        if self.is_free() || self.mode() != SlotMode::Async {
            return None;
        }
        let deadline = self.deadline();
        if deadline == 0 || now < deadline {
            return None;
        }

        let mut guard = self.completion.lock();
        if guard.is_none()
            || self
                .deadline
                .compare_exchange(deadline, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return None;
        }
        let completion = guard.take()?;
        let seq = self.seq.swap(self.free, Ordering::SeqCst);
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
        drop(guard);

        self.drain();
        Some((seq, completion))
    }

    /// Takes the completion of any registered async call, for connection teardown.
    pub fn take_pending(&self) -> Option<(u32, Completion)> {
        if self.mode() != SlotMode::Async {
            return None;
        }
        let mut guard = self.completion.lock();
        let completion = guard.take()?;
        self.deadline.store(0, Ordering::SeqCst);
        let seq = self.seq.swap(self.free, Ordering::SeqCst);
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
        Some((seq, completion))
    }

    /// Hands a reply to the synchronous caller blocked on this slot.
    pub fn deliver(&self, answer: Answer) {
        // The slot owns the receiver, so the channel never disconnects.
        let _ = self.reply_tx.send(answer);
    }

    pub fn replies(&self) -> &Receiver<Answer> {
        &self.reply_rx
    }

    /// Leaves `seq` in place but drops the owner, as an out-of-order retire would.
    #[cfg(test)]
    pub fn orphan(&self) {
        self.mode.store(MODE_IDLE, Ordering::SeqCst);
    }

    fn drain(&self) {
        while self.reply_rx.try_recv().is_ok() {}
    }
}

/// Fixed table of request slots, never reallocated.
pub(crate) struct SlotTable {
    slots: Box<[RequestSlot]>,
}

impl SlotTable {
    pub fn new(queue_size: u32, free: u32) -> Self {
        let slots = (0..queue_size).map(|_| RequestSlot::new(free)).collect();
        Self { slots }
    }

    pub fn get(&self, idx: usize) -> &RequestSlot {
        &self.slots[idx]
    }

    /// Retires every async call whose deadline is at or before `now`.
    pub fn expire(&self, now: u64) -> Vec<(u32, Completion)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.take_expired(now))
            .collect()
    }

    /// Retires every registered async call.
    pub fn take_all_pending(&self) -> Vec<(u32, Completion)> {
        self.slots
            .iter()
            .filter_map(RequestSlot::take_pending)
            .collect()
    }
}
