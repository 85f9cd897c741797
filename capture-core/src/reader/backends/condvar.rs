//! Condition-variable reader event

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::reader::{ReaderEvent, WaitError};

/// Pending flag guarded by a mutex, with a condvar to sleep on
#[derive(Debug, Default)]
pub struct CondvarEvent {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl CondvarEvent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReaderEvent for CondvarEvent {
    fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        let mut pending = self.pending.lock();
        let result = self.cond.wait_while_for(&mut pending, |p| !*p, timeout);
        if result.timed_out() {
            return Err(WaitError::Timeout);
        }
        *pending = false;
        Ok(())
    }

    fn signal(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let event = CondvarEvent::new();
        assert_eq!(event.wait(Duration::from_millis(5)), Err(WaitError::Timeout));
    }

    #[test]
    fn test_signal_before_wait_is_kept() {
        let event = CondvarEvent::new();
        event.signal();
        event.signal();
        assert_eq!(event.wait(Duration::from_millis(5)), Ok(()));
        assert_eq!(event.wait(Duration::from_millis(5)), Err(WaitError::Timeout));
    }

    #[test]
    fn test_signal_from_other_thread() {
        let event = Arc::new(CondvarEvent::new());
        let signaller = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.signal();
        });
        assert_eq!(event.wait(Duration::from_secs(5)), Ok(()));
        handle.join().unwrap();
    }
}
