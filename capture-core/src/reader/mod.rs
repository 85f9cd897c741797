//! Reader - single-consumer access to captured records
//!
//! One task at a time may hold records. [`crate::CaptureEngine::read`]
//! marks the engine READER-ACTIVE and hands back a [`RecordBatch`] over the
//! contiguous run of records at the tail of the buffer. The records in a
//! batch are never touched by writers, so the batch is read without the
//! engine lock. Handing records back through [`RecordBatch::release`] frees
//! their space and ends the read.
//!
//! ```text
//!   reader task                        writers (task / ISR)
//!   ───────────                        ────────────────────
//!   read(threshold, timeout)
//!     peek run, too short ─► WAITING
//!     event.wait(remaining) ◄────────── record(): WAITING? signal once
//!     peek again ...
//!   batch.iter() ...
//!   batch.release(n)
//! ```
//!
//! Wakeups are coalesced: a writer that finds the reader waiting clears the
//! flag and signals once, so a burst of records costs one wakeup.

mod backends;

pub use backends::{ChannelEvent, CondvarEvent};

use std::ptr::NonNull;
use std::time::Duration;

use thiserror::Error;

use capture_protocol::{RecordIter, TaskId};

use crate::engine::CaptureEngine;
use crate::error::Result;
use crate::kernel::Kernel;

/// Failure of a blocking wait
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout expired before a signal arrived
    #[error("wait timed out")]
    Timeout,
    /// The signalling side is gone
    #[error("event source disconnected")]
    Disconnected,
}

/// Kernel event the reader blocks on
///
/// `signal` must be callable from any context, including interrupt
/// handlers, and must not block.
pub trait ReaderEvent: Send + Sync {
    /// Block until signalled or until `timeout` passes
    fn wait(&self, timeout: Duration) -> std::result::Result<(), WaitError>;

    /// Wake the waiter, or let its next wait return at once
    fn signal(&self);
}

/// Records handed to the reader
///
/// Borrows the engine, so the engine cannot be dropped while records are
/// held. Dropping a batch without releasing it ends the read and leaves the
/// records in the buffer.
pub struct RecordBatch<'a, K: Kernel> {
    engine: &'a CaptureEngine<K>,
    start: NonNull<u8>,
    len: usize,
    records: usize,
    reader: TaskId,
    finished: bool,
}

impl<'a, K: Kernel> RecordBatch<'a, K> {
    pub(crate) fn new(
        engine: &'a CaptureEngine<K>,
        start: NonNull<u8>,
        len: usize,
        records: usize,
        reader: TaskId,
    ) -> Self {
        Self {
            engine,
            start,
            len,
            records,
            reader,
            finished: false,
        }
    }

    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Task that performed the read
    pub fn reader(&self) -> TaskId {
        self.reader
    }

    /// Raw bytes of the batch
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the run was published by writers before the read and
        // cannot be freed, flushed or overwritten while READER-ACTIVE is
        // set, which lasts until this batch is released or dropped.
        unsafe { std::slice::from_raw_parts(self.start.as_ptr(), self.len) }
    }

    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter::new(self.bytes())
    }

    /// Free the `count` oldest records and end the read
    ///
    /// `count` may exceed the batch; it is clamped to the records held by
    /// the engine. Returns the number released.
    pub fn release(mut self, count: usize) -> Result<usize> {
        self.finished = true;
        self.engine.release(count)
    }
}

impl<K: Kernel> Drop for RecordBatch<'_, K> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.end_read();
        }
    }
}

impl<K: Kernel> std::fmt::Debug for RecordBatch<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBatch")
            .field("records", &self.records)
            .field("bytes", &self.len)
            .field("reader", &self.reader)
            .finish()
    }
}
