//! Record header and task-descriptor encoding

use serde::{Deserialize, Serialize};

use crate::events::{CURRENT_PRIORITY_MASK, CURRENT_PRIORITY_SHIFT, EVENT_MASK, REAL_PRIORITY_MASK};
use crate::{Name, Priority, TaskId};

/// Encoded size of [`RecordHeader`]
pub const HEADER_SIZE: usize = 20;

/// Encoded size of [`TaskRecord`]
pub const TASK_RECORD_SIZE: usize = 12;

/// Fixed header at the start of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Total record size, header included
    pub size: u32,
    /// Owning task
    pub task_id: TaskId,
    /// Event bits combined with the real and current priority
    pub events: u32,
    /// Timestamp from the engine's time source
    pub time: u64,
}

impl RecordHeader {
    /// Build a header, folding the priorities into the event word
    pub fn new(
        size: u32,
        task_id: TaskId,
        events: u32,
        real_priority: Priority,
        current_priority: Priority,
        time: u64,
    ) -> Self {
        let events = (events & EVENT_MASK)
            | (real_priority & REAL_PRIORITY_MASK)
            | ((current_priority << CURRENT_PRIORITY_SHIFT) & CURRENT_PRIORITY_MASK);
        Self { size, task_id, events, time }
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of `out`
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`HEADER_SIZE`].
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..8].copy_from_slice(&self.task_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.events.to_le_bytes());
        out[12..20].copy_from_slice(&self.time.to_le_bytes());
    }

    /// Read a header from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            task_id: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            events: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            time: u64::from_le_bytes(bytes[12..20].try_into().ok()?),
        })
    }

    /// Event bits without the priority fields
    pub fn event_bits(&self) -> u32 {
        self.events & EVENT_MASK
    }

    pub fn real_priority(&self) -> Priority {
        self.events & REAL_PRIORITY_MASK
    }

    pub fn current_priority(&self) -> Priority {
        (self.events & CURRENT_PRIORITY_MASK) >> CURRENT_PRIORITY_SHIFT
    }

    /// A record without event bits describes its task
    pub fn is_task_descriptor(&self) -> bool {
        self.event_bits() == 0
    }
}

/// Payload of a task-descriptor record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: Name,
    pub start_priority: Priority,
    pub stack_size: u32,
}

impl TaskRecord {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.name.to_le_bytes());
        out[4..8].copy_from_slice(&self.start_priority.to_le_bytes());
        out[8..12].copy_from_slice(&self.stack_size.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; TASK_RECORD_SIZE] {
        let mut out = [0u8; TASK_RECORD_SIZE];
        self.encode(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TASK_RECORD_SIZE {
            return None;
        }
        Some(Self {
            name: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            start_priority: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            stack_size: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
        })
    }
}

/// A decoded record borrowing its payload from the source bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub header: RecordHeader,
    pub payload: &'a [u8],
}

impl<'a> Record<'a> {
    /// The task descriptor carried by this record, if it is one
    pub fn task(&self) -> Option<TaskRecord> {
        if self.header.is_task_descriptor() {
            TaskRecord::decode(self.payload)
        } else {
            None
        }
    }
}

/// Walks a contiguous run of records
///
/// Iteration stops at the first header whose size is smaller than a header
/// or runs past the end of the input.
#[derive(Debug, Clone)]
pub struct RecordIter<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = RecordHeader::decode(self.bytes)?;
        let size = header.size as usize;
        if size < HEADER_SIZE || size > self.bytes.len() {
            return None;
        }
        let payload = &self.bytes[HEADER_SIZE..size];
        self.bytes = &self.bytes[size..];
        Some(Record { header, payload })
    }
}

/// Number of complete records at the start of `bytes`
pub fn count_records(bytes: &[u8]) -> usize {
    RecordIter::new(bytes).count()
}
