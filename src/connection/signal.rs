use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use parking_lot::Mutex;

/// One-shot broadcast: once fired, every current and future `recv` on [`Signal::receiver`]
/// returns immediately.
#[derive(Debug)]
pub(crate) struct Signal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Returns false if the signal had already fired.
    pub fn fire(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_fired(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
