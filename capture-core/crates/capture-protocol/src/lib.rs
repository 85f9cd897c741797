//! Capture record wire format
//!
//! The byte layout shared by the capture engine (which writes records into
//! its ring buffer) and any consumer that reads them back out:
//!
//! ```text
//! ┌────────┬─────────┬──────────────────────────────┬────────────┬─────────┐
//! │ size   │ task id │ events | cur prio | real prio│ timestamp  │ payload │
//! │ u32 LE │ u32 LE  │ u32 LE                       │ u64 LE     │ ...     │
//! └────────┴─────────┴──────────────────────────────┴────────────┴─────────┘
//!  0        4         8                              12           20
//! ```
//!
//! `size` covers the header and the payload, so a run of records can be
//! walked without knowing anything about individual event types.

pub mod events;
pub mod name;
pub mod record;

pub use events::{event_names, event_text};
pub use name::{build_name, name_from_str, name_to_string};
pub use record::{
    count_records, Record, RecordHeader, RecordIter, TaskRecord, HEADER_SIZE, TASK_RECORD_SIZE,
};

/// Classic 32-bit object name (four packed ASCII characters, 0 = unnamed)
pub type Name = u32;

/// Kernel object identifier (0 = wildcard / unknown)
pub type TaskId = u32;

/// Task priority, lower numbers are more important
pub type Priority = u32;
