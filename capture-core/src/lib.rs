//! # Capture Core - task event capture engine
//!
//! Records what a real-time kernel's tasks do, as compact binary records in
//! a fixed ring buffer, so a monitor can see what happened around a point of
//! interest:
//!
//! - **Controls**: per (name, id) watch and trigger configuration, with 0 as
//!   a wildcard on either half
//! - **Triggers**: recording starts when a configured transition is seen and
//!   stays on until the buffer is flushed with re-arm
//! - **Filter**: once triggered, a record is kept only for watched tasks
//!   inside the priority window, lifecycle events excepted
//! - **Reader**: one consumer at a time takes contiguous runs of records,
//!   optionally blocking until enough have arrived
//!
//! ## Core Principle
//!
//! > Hooks never block and never fail. When there is no room, the record is
//! > dropped and the engine says so.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use capture_core::kernel::sim::SimKernel;
//! use capture_core::protocol::{events, name_from_str};
//! use capture_core::{CaptureEngine, ControlKey, ThreadExtension, TriggerKind, TriggerMode};
//!
//! let kernel = Arc::new(SimKernel::new());
//! let engine = CaptureEngine::new(Arc::clone(&kernel));
//! engine.open(4096, None).unwrap();
//!
//! let init = kernel.spawn(name_from_str("INIT").unwrap(), 1);
//! let worker = kernel.spawn(name_from_str("WORK").unwrap(), 20);
//!
//! // start recording when anything creates WORK
//! engine
//!     .set_trigger(
//!         ControlKey::default(),
//!         ControlKey::by_name(name_from_str("WORK").unwrap()),
//!         TriggerMode::FromAny,
//!         TriggerKind::Create,
//!     )
//!     .unwrap();
//! engine.thread_create(&init, &worker);
//! assert!(engine.is_triggered());
//!
//! let batch = engine.read(0, Duration::ZERO).unwrap();
//! let created = batch
//!     .iter()
//!     .filter(|r| r.header.event_bits() == events::CREATED)
//!     .count();
//! assert_eq!(created, 1);
//! let n = batch.len();
//! batch.release(n).unwrap();
//! ```

pub mod buffer;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod extension;
pub mod kernel;
pub mod lock;
pub mod reader;
pub mod recorder;
pub mod trigger;

pub use capture_protocol as protocol;

// Re-export main types
pub use buffer::{BufferStats, RingBuffer};
pub use config::CaptureConfig;
pub use control::{ControlInfo, ControlKey};
pub use engine::{flags, CaptureEngine, TimestampFn};
pub use error::{CaptureError, ErrorCategory, ErrorDetail, ErrorResponse, Result, StatusCode};
pub use extension::ThreadExtension;
pub use kernel::{CaptureSlot, Kernel, Thread};
pub use lock::{InterruptControl, InterruptLevel, IsrLock, NoInterrupts};
pub use reader::{ChannelEvent, CondvarEvent, ReaderEvent, RecordBatch, WaitError};
pub use trigger::{TriggerKind, TriggerMode, TriggerState};
