//! Recorder - writes records into the ring buffer
//!
//! Called with the engine lock held, from task or interrupt context. A
//! write either lands completely or not at all: when the buffer has no
//! room the caller gets `false` and marks the engine as overflowed. Nothing
//! here blocks, retries or grows the buffer.

use std::ptr::NonNull;

use capture_protocol::{RecordHeader, RecordIter, TaskRecord, HEADER_SIZE, TASK_RECORD_SIZE};

use crate::buffer::{BufferStats, RingBuffer};
use crate::error::Result;
use crate::kernel::Thread;

/// Record storage plus the count of records it holds
#[derive(Debug)]
pub struct Recorder {
    buffer: RingBuffer,
    count: usize,
}

impl Recorder {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            buffer: RingBuffer::new(capacity)?,
            count: 0,
        })
    }

    /// Write one record for `thread`
    ///
    /// Returns false when the buffer could not hold it.
    pub fn write<T: Thread + ?Sized>(&mut self, thread: &T, events: u32, payload: &[u8], time: u64) -> bool {
        let size = HEADER_SIZE + payload.len();
        let Ok(encoded_size) = u32::try_from(size) else {
            return false;
        };
        let Some(slot) = self.buffer.allocate(size) else {
            return false;
        };

        let header = RecordHeader::new(
            encoded_size,
            thread.id(),
            events,
            thread.real_priority(),
            thread.current_priority(),
            time,
        );
        header.encode(&mut slot[..HEADER_SIZE]);
        slot[HEADER_SIZE..].copy_from_slice(payload);
        self.count += 1;
        true
    }

    /// Write the zero-event descriptor record for `thread`
    pub fn write_task<T: Thread + ?Sized>(&mut self, thread: &T, time: u64) -> bool {
        let task = TaskRecord {
            name: thread.name(),
            start_priority: thread.start_priority(),
            stack_size: thread.stack_size(),
        };
        let payload: [u8; TASK_RECORD_SIZE] = task.to_bytes();
        self.write(thread, 0, &payload, time)
    }

    /// Free the `count` oldest records
    ///
    /// Clamped to the records held. Returns how many were released.
    pub fn release(&mut self, count: usize) -> usize {
        let target = count.min(self.count);
        let mut released = 0;

        while released < target {
            let (bytes, records) = RecordIter::new(self.buffer.peek())
                .take(target - released)
                .fold((0usize, 0usize), |(bytes, records), record| {
                    (bytes + record.header.size as usize, records + 1)
                });
            if records == 0 {
                break;
            }
            self.buffer.free(bytes);
            released += records;
        }

        self.count -= released;
        if self.count == 0 {
            self.buffer.flush();
        }
        released
    }

    /// Drop every record
    pub fn flush(&mut self) {
        self.count = 0;
        self.buffer.flush();
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn has_wrapped(&self) -> bool {
        self.buffer.has_wrapped()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub(crate) fn peek_raw(&self) -> (NonNull<u8>, usize) {
        self.buffer.peek_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::sim::SimThread;
    use capture_protocol::events::{CREATED, SWITCHED_IN};
    use capture_protocol::Record;

    fn thread(id: u32, priority: u32) -> SimThread {
        SimThread::new(id, 0x5441_534b, priority).with_stack_size(2048)
    }

    fn records(recorder: &Recorder) -> Vec<Record<'_>> {
        RecordIter::new(recorder.buffer.peek()).collect()
    }

    #[test]
    fn test_write_stamps_header() {
        let mut recorder = Recorder::new(256).unwrap();
        let t = thread(7, 12);
        t.set_current_priority(3);
        assert!(recorder.write(&t, SWITCHED_IN, &[], 500));
        assert_eq!(recorder.count(), 1);

        let recs = records(&recorder);
        let header = recs[0].header;
        assert_eq!(header.size as usize, HEADER_SIZE);
        assert_eq!(header.task_id, 7);
        assert_eq!(header.event_bits(), SWITCHED_IN);
        assert_eq!(header.real_priority(), 12);
        assert_eq!(header.current_priority(), 3);
        assert_eq!(header.time, 500);
    }

    #[test]
    fn test_write_task_descriptor() {
        let mut recorder = Recorder::new(256).unwrap();
        assert!(recorder.write_task(&thread(7, 12), 1));
        let recs = records(&recorder);
        assert_eq!(recs[0].header.size as usize, HEADER_SIZE + TASK_RECORD_SIZE);
        let task = recs[0].task().unwrap();
        assert_eq!(task.name, 0x5441_534b);
        assert_eq!(task.start_priority, 12);
        assert_eq!(task.stack_size, 2048);
    }

    #[test]
    fn test_write_fails_when_full() {
        let mut recorder = Recorder::new(HEADER_SIZE * 2).unwrap();
        let t = thread(1, 1);
        assert!(recorder.write(&t, CREATED, &[], 0));
        assert!(recorder.write(&t, CREATED, &[], 0));
        assert!(!recorder.write(&t, CREATED, &[], 0));
        assert_eq!(recorder.count(), 2);
    }

    #[test]
    fn test_release_walks_across_wrap() {
        let mut recorder = Recorder::new(HEADER_SIZE * 4).unwrap();
        let t = thread(1, 1);
        for _ in 0..4 {
            assert!(recorder.write(&t, CREATED, &[], 0));
        }
        assert_eq!(recorder.release(2), 2);
        assert!(recorder.write(&t, SWITCHED_IN, &[], 1));
        assert!(recorder.has_wrapped());

        // two before the wrap point, one after
        assert_eq!(recorder.release(3), 3);
        assert_eq!(recorder.count(), 0);
        assert!(recorder.is_empty());
        assert!(!recorder.has_wrapped());
    }

    #[test]
    fn test_release_is_clamped() {
        let mut recorder = Recorder::new(256).unwrap();
        let t = thread(1, 1);
        assert!(recorder.write(&t, CREATED, &[], 0));
        assert_eq!(recorder.release(10), 1);
        assert_eq!(recorder.release(1), 0);
    }
}
