//! Kernel hooks
//!
//! The kernel calls these on every task lifecycle transition and context
//! switch. Each hook links the tasks involved to their controls, writes a
//! descriptor the first time a task is seen, feeds the trigger and, once
//! triggered, records the matching event pair.
//!
//! | Hook              | Trigger      | Source record  | Destination record |
//! |-------------------|--------------|----------------|--------------------|
//! | `thread_create`   | `CREATE`     | `CREATED_BY`   | `CREATED`          |
//! | `thread_start`    | `START`      | `STARTED_BY`   | `STARTED`          |
//! | `thread_restart`  | `RESTART`    | `RESTARTED_BY` | `RESTARTED`        |
//! | `thread_delete`   | `DELETE`     | `DELETED_BY`   | `DELETED`          |
//! | `thread_switch`   | `SWITCH`     | `SWITCHED_OUT` | `SWITCHED_IN`      |
//! | `thread_begin`    | `BEGIN`      |                | `BEGIN`            |
//! | `thread_exitted`  | `EXITTED`    |                | `EXITTED`          |
//! | `thread_terminate`| `TERMINATED` |                | `TERMINATED`       |
//!
//! Only `thread_switch` is gated on capture being enabled. Hooks never
//! block and never fail; a full buffer sets OVERFLOW instead.

use capture_protocol::events;

use crate::engine::CaptureEngine;
use crate::kernel::{Kernel, Thread};
use crate::trigger;

/// Task lifecycle and scheduler callbacks
pub trait ThreadExtension {
    type Thread: Thread + ?Sized;

    /// `executing` created `created`
    fn thread_create(&self, executing: &Self::Thread, created: &Self::Thread);

    fn thread_start(&self, executing: &Self::Thread, started: &Self::Thread);

    fn thread_restart(&self, executing: &Self::Thread, restarted: &Self::Thread);

    /// `executing` deleted `deleted`; the deleted task is forgotten afterwards
    fn thread_delete(&self, executing: &Self::Thread, deleted: &Self::Thread);

    /// The scheduler switches from `executing` to `heir`
    fn thread_switch(&self, executing: &Self::Thread, heir: &Self::Thread);

    /// `thread` runs for the first time
    fn thread_begin(&self, thread: &Self::Thread);

    /// `thread` returned from its entry point
    fn thread_exitted(&self, thread: &Self::Thread);

    fn thread_terminate(&self, thread: &Self::Thread);
}

impl<K: Kernel> ThreadExtension for CaptureEngine<K> {
    type Thread = K::Thread;

    fn thread_create(&self, executing: &K::Thread, created: &K::Thread) {
        self.transition(
            Some(executing),
            Some(created),
            trigger::CREATE,
            events::CREATED_BY,
            events::CREATED,
            false,
        );
    }

    fn thread_start(&self, executing: &K::Thread, started: &K::Thread) {
        self.transition(
            Some(executing),
            Some(started),
            trigger::START,
            events::STARTED_BY,
            events::STARTED,
            false,
        );
    }

    fn thread_restart(&self, executing: &K::Thread, restarted: &K::Thread) {
        self.transition(
            Some(executing),
            Some(restarted),
            trigger::RESTART,
            events::RESTARTED_BY,
            events::RESTARTED,
            false,
        );
    }

    fn thread_delete(&self, executing: &K::Thread, deleted: &K::Thread) {
        self.transition(
            Some(executing),
            Some(deleted),
            trigger::DELETE,
            events::DELETED_BY,
            events::DELETED,
            false,
        );
        self.forget_task(deleted);
    }

    fn thread_switch(&self, executing: &K::Thread, heir: &K::Thread) {
        self.transition(
            Some(executing),
            Some(heir),
            trigger::SWITCH,
            events::SWITCHED_OUT,
            events::SWITCHED_IN,
            true,
        );
    }

    fn thread_begin(&self, thread: &K::Thread) {
        self.transition(None, Some(thread), trigger::BEGIN, 0, events::BEGIN, false);
    }

    fn thread_exitted(&self, thread: &K::Thread) {
        self.transition(None, Some(thread), trigger::EXITTED, 0, events::EXITTED, false);
    }

    fn thread_terminate(&self, thread: &K::Thread) {
        self.transition(None, Some(thread), trigger::TERMINATED, 0, events::TERMINATED, false);
    }
}
