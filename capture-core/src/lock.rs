//! Interrupt-safe critical sections
//!
//! Every mutation of the ring buffer, the control registry and the engine
//! flags happens under one [`IsrLock`]. Acquiring it first disables local
//! interrupts through the kernel's [`InterruptControl`] and then takes a
//! spinlock for the other processors. The returned [`IsrGuard`] undoes both
//! in reverse order when it goes out of scope, on every exit path.
//!
//! ```text
//! lock()  ──► disable() ──► spin::Mutex::lock() ──► IsrGuard
//! drop()  ──► unlock     ──► restore(level)
//! ```
//!
//! The guard must never be held across a blocking call.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

/// Saved interrupt state returned by [`InterruptControl::disable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptLevel(pub usize);

/// The kernel's interrupt disable/restore pair
///
/// Must be callable from both task and interrupt context.
pub trait InterruptControl: Send + Sync {
    /// Mask interrupts on the local processor, returning the previous state
    fn disable(&self) -> InterruptLevel;

    /// Restore the state returned by the matching `disable`
    fn restore(&self, level: InterruptLevel);
}

/// Hosted environments have no interrupts to mask
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    fn disable(&self) -> InterruptLevel {
        InterruptLevel(0)
    }

    fn restore(&self, _level: InterruptLevel) {}
}

/// Spinlock layered under an interrupt disable
pub struct IsrLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IsrLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Enter the critical section
    pub fn lock<'a, I>(&'a self, irq: &'a I) -> IsrGuard<'a, T, I>
    where
        I: InterruptControl + ?Sized,
    {
        let level = irq.disable();
        let guard = self.inner.lock();
        IsrGuard {
            guard: ManuallyDrop::new(guard),
            irq,
            level,
        }
    }

    /// Consume the lock, returning the protected value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Scoped critical section, see [`IsrLock::lock`]
pub struct IsrGuard<'a, T, I: InterruptControl + ?Sized> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    irq: &'a I,
    level: InterruptLevel,
}

impl<T, I: InterruptControl + ?Sized> Deref for IsrGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, I: InterruptControl + ?Sized> DerefMut for IsrGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, I: InterruptControl + ?Sized> Drop for IsrGuard<'_, T, I> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never touched again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.irq.restore(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counts nesting and remembers the order of disable/restore calls
    #[derive(Default)]
    struct RecordingIrq {
        depth: AtomicUsize,
        log: Mutex<Vec<&'static str>>,
    }

    impl InterruptControl for RecordingIrq {
        fn disable(&self) -> InterruptLevel {
            self.log.lock().unwrap().push("disable");
            InterruptLevel(self.depth.fetch_add(1, Ordering::SeqCst))
        }

        fn restore(&self, level: InterruptLevel) {
            self.log.lock().unwrap().push("restore");
            self.depth.store(level.0, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let irq = RecordingIrq::default();
        let lock = IsrLock::new(5u32);
        {
            let mut guard = lock.lock(&irq);
            *guard += 1;
            assert_eq!(irq.depth.load(Ordering::SeqCst), 1);
        }
        assert_eq!(irq.depth.load(Ordering::SeqCst), 0);
        assert_eq!(*irq.log.lock().unwrap(), vec!["disable", "restore"]);
        assert_eq!(lock.into_inner(), 6);
    }

    #[test]
    fn test_guard_restores_on_early_return() {
        fn bump(lock: &IsrLock<u32>, irq: &RecordingIrq) -> Option<u32> {
            let mut guard = lock.lock(irq);
            if *guard > 0 {
                return None;
            }
            *guard += 1;
            Some(*guard)
        }

        let irq = RecordingIrq::default();
        let lock = IsrLock::new(0u32);
        assert_eq!(bump(&lock, &irq), Some(1));
        assert_eq!(bump(&lock, &irq), None);
        assert_eq!(irq.depth.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lock_is_released_for_next_holder() {
        let lock = IsrLock::new(Vec::new());
        for i in 0..3 {
            lock.lock(&NoInterrupts).push(i);
        }
        assert_eq!(*lock.lock(&NoInterrupts), vec![0, 1, 2]);
    }
}
