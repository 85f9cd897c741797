//! Channel-backed reader event

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::reader::{ReaderEvent, WaitError};

/// Wakeup token passed through a one-slot channel
///
/// A full channel already holds a pending wakeup, so extra signals are
/// dropped.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl ChannelEvent {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Whether a wakeup is waiting to be consumed
    pub fn is_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Default for ChannelEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderEvent for ChannelEvent {
    fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::Disconnected),
        }
    }

    fn signal(&self) {
        let _ = self.tx.try_send(());
    }
}
