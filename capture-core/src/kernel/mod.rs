//! Kernel collaborator interfaces
//!
//! The engine does not own tasks. It sees them through [`Thread`], keeps its
//! per-task state in the [`CaptureSlot`] each task carries in its control
//! block, and reaches the rest of the kernel through [`Kernel`].
//!
//! ## Implementations
//!
//! - [`sim::SimKernel`]: in-memory thread table and manual clock, used by
//!   tests, benches and the `capture-sim` binary

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use capture_protocol::{Name, Priority, TaskId};

use crate::control::ControlHandle;
use crate::lock::InterruptControl;

pub mod sim;

/// Slot has been observed by a capture hook
pub const SLOT_INIT: u32 = 1 << 0;
/// The task-descriptor record has been written
pub const SLOT_RECORDED: u32 = 1 << 1;
/// A non-lifecycle event for the task has been recorded
pub const SLOT_TRACED: u32 = 1 << 2;

/// Per-task capture state stored in the task's control block
///
/// Fields are atomics so hooks can read them from any context, but every
/// write happens with the engine lock held.
#[derive(Debug, Default)]
pub struct CaptureSlot {
    control: AtomicU64,
    flags: AtomicU32,
}

impl CaptureSlot {
    pub const fn new() -> Self {
        Self {
            control: AtomicU64::new(0),
            flags: AtomicU32::new(0),
        }
    }

    /// Handle of the control entry this task is linked to
    pub fn control(&self) -> Option<ControlHandle> {
        ControlHandle::from_raw(self.control.load(Ordering::Acquire))
    }

    pub(crate) fn set_control(&self, handle: Option<ControlHandle>) {
        let raw = handle.map_or(0, ControlHandle::into_raw);
        self.control.store(raw, Ordering::Release);
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub(crate) fn insert(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn remove(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Forget everything, as when the engine closes
    pub(crate) fn reset(&self) {
        self.control.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
    }
}

/// A kernel task as seen by the capture engine
pub trait Thread: Send + Sync {
    /// Object id, never 0 for a live task
    fn id(&self) -> TaskId;

    /// Classic name, 0 when unnamed
    fn name(&self) -> Name;

    fn real_priority(&self) -> Priority;

    fn current_priority(&self) -> Priority;

    fn start_priority(&self) -> Priority;

    fn stack_size(&self) -> u32;

    /// The engine's extension slot in this task's control block
    fn capture_slot(&self) -> &CaptureSlot;
}

/// Services the engine consumes from the kernel
pub trait Kernel: InterruptControl {
    type Thread: Thread;

    /// Visit every live task
    ///
    /// Called with the engine lock held, so the visitor must not block.
    fn for_each_thread(&self, visit: &mut dyn FnMut(&Self::Thread));

    /// Monotonic uptime in nanoseconds
    fn uptime_ns(&self) -> u64;

    /// Length of a clock tick in microseconds
    fn tick_period_us(&self) -> u32;

    /// Id of the task calling into the engine
    fn executing(&self) -> TaskId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_flags() {
        let slot = CaptureSlot::new();
        assert_eq!(slot.flags(), 0);
        slot.insert(SLOT_INIT | SLOT_TRACED);
        assert!(slot.has(SLOT_TRACED));
        slot.remove(SLOT_TRACED);
        assert!(!slot.has(SLOT_TRACED));
        assert!(slot.has(SLOT_INIT));
    }

    #[test]
    fn test_slot_reset_clears_control() {
        let slot = CaptureSlot::new();
        slot.set_control(ControlHandle::from_raw(0x0000_0001_0000_0003));
        assert!(slot.control().is_some());
        slot.insert(SLOT_RECORDED);
        slot.reset();
        assert!(slot.control().is_none());
        assert_eq!(slot.flags(), 0);
    }
}
