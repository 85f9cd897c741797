//! Simulated kernel
//!
//! A thread table, a manually advanced clock and a settable "executing"
//! task. Nothing here calls the capture hooks by itself: the test or driver
//! decides when a task is created, switched or deleted and invokes the
//! matching [`crate::ThreadExtension`] method.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use capture_protocol::{Name, Priority, TaskId};

use super::{CaptureSlot, Kernel, Thread};
use crate::lock::{InterruptControl, InterruptLevel};

/// First id handed out, in the classic "class 1, node 1" id space
const FIRST_ID: TaskId = 0x0a01_0001;

/// A task in the simulated kernel
#[derive(Debug)]
pub struct SimThread {
    id: TaskId,
    name: Name,
    real_priority: AtomicU32,
    current_priority: AtomicU32,
    start_priority: Priority,
    stack_size: u32,
    slot: CaptureSlot,
}

impl SimThread {
    pub fn new(id: TaskId, name: Name, priority: Priority) -> Self {
        Self {
            id,
            name,
            real_priority: AtomicU32::new(priority),
            current_priority: AtomicU32::new(priority),
            start_priority: priority,
            stack_size: 4096,
            slot: CaptureSlot::new(),
        }
    }

    pub fn with_stack_size(mut self, stack_size: u32) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Change the base priority, as a priority-set directive would
    pub fn set_real_priority(&self, priority: Priority) {
        self.real_priority.store(priority, Ordering::Relaxed);
        self.current_priority.store(priority, Ordering::Relaxed);
    }

    /// Change only the effective priority, as priority inheritance would
    pub fn set_current_priority(&self, priority: Priority) {
        self.current_priority.store(priority, Ordering::Relaxed);
    }
}

impl Thread for SimThread {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> Name {
        self.name
    }

    fn real_priority(&self) -> Priority {
        self.real_priority.load(Ordering::Relaxed)
    }

    fn current_priority(&self) -> Priority {
        self.current_priority.load(Ordering::Relaxed)
    }

    fn start_priority(&self) -> Priority {
        self.start_priority
    }

    fn stack_size(&self) -> u32 {
        self.stack_size
    }

    fn capture_slot(&self) -> &CaptureSlot {
        &self.slot
    }
}

/// In-memory kernel for tests and simulation
#[derive(Debug)]
pub struct SimKernel {
    threads: Mutex<Vec<Arc<SimThread>>>,
    next_id: AtomicU32,
    clock_ns: AtomicU64,
    tick_period_us: u32,
    executing: AtomicU32,
}

impl SimKernel {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(FIRST_ID),
            clock_ns: AtomicU64::new(0),
            tick_period_us: 10_000,
            executing: AtomicU32::new(0),
        }
    }

    pub fn with_tick_period(mut self, tick_period_us: u32) -> Self {
        self.tick_period_us = tick_period_us;
        self
    }

    /// Add a task to the thread table and return it
    pub fn spawn(&self, name: Name, priority: Priority) -> Arc<SimThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(SimThread::new(id, name, priority));
        self.threads.lock().push(Arc::clone(&thread));
        thread
    }

    /// Drop a task from the thread table
    pub fn remove(&self, id: TaskId) -> Option<Arc<SimThread>> {
        let mut threads = self.threads.lock();
        let index = threads.iter().position(|t| t.id == id)?;
        Some(threads.remove(index))
    }

    pub fn thread(&self, id: TaskId) -> Option<Arc<SimThread>> {
        self.threads.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn set_executing(&self, id: TaskId) {
        self.executing.store(id, Ordering::Relaxed);
    }

    pub fn advance(&self, ns: u64) -> u64 {
        self.clock_ns.fetch_add(ns, Ordering::Relaxed) + ns
    }

    /// Advance the clock by `ticks` clock ticks
    pub fn tick(&self, ticks: u64) -> u64 {
        self.advance(ticks * u64::from(self.tick_period_us) * 1_000)
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for SimKernel {
    fn disable(&self) -> InterruptLevel {
        InterruptLevel(0)
    }

    fn restore(&self, _level: InterruptLevel) {}
}

impl Kernel for SimKernel {
    type Thread = SimThread;

    fn for_each_thread(&self, visit: &mut dyn FnMut(&SimThread)) {
        for thread in self.threads.lock().iter() {
            visit(thread);
        }
    }

    fn uptime_ns(&self) -> u64 {
        self.clock_ns.load(Ordering::Relaxed)
    }

    fn tick_period_us(&self) -> u32 {
        self.tick_period_us
    }

    fn executing(&self) -> TaskId {
        self.executing.load(Ordering::Relaxed)
    }
}
