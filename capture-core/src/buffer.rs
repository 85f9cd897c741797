//! Variable-length record ring buffer
//!
//! A fixed byte arena handing out contiguous runs in FIFO order. Records
//! never straddle the end of the arena: when the space after `head` is too
//! small but the space before `tail` is large enough, the buffer wraps. The
//! old `head` becomes the `end` of valid data and writing restarts at 0.
//!
//! ```text
//! not wrapped:   [ free | tail ... data ... head | free           ]
//! wrapped:       [ data ... head | free | tail ... data ... end | skip ]
//! ```
//!
//! The skipped bytes between `end` and the arena's capacity are waste,
//! bounded by one record per wrap. They come back once `tail` reaches `end`.
//!
//! Writers only move `head`, the reader only moves `tail`. The arena is a
//! raw allocation so that the reader can keep a view of `[tail, end)` while
//! writers fill the disjoint free region; every call that moves an offset
//! happens under the engine lock.

use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};

/// Snapshot of the buffer offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub capacity: usize,
    /// Bytes held by unreleased records
    pub used: usize,
    pub head: usize,
    pub tail: usize,
    pub end: usize,
    pub wrapped: bool,
}

/// Fixed-capacity FIFO byte arena
pub struct RingBuffer {
    arena: NonNull<u8>,
    capacity: usize,
    head: usize,
    tail: usize,
    end: usize,
    count: usize,
    wrapped: bool,
}

// SAFETY: the arena is uniquely owned by the buffer. Offsets are only moved
// through `&mut self`, which the engine only hands out under its lock.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Allocate an arena of `capacity` bytes
    ///
    /// Fails with `NoMemory` instead of aborting when the allocation cannot
    /// be satisfied.
    pub fn new(capacity: usize) -> Result<Self> {
        let mut storage: Vec<u8> = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| CaptureError::NoMemory { what: "capture buffer" })?;
        storage.resize(capacity, 0);
        let arena = NonNull::from(Box::leak(storage.into_boxed_slice())).cast::<u8>();

        Ok(Self {
            arena,
            capacity,
            head: 0,
            tail: 0,
            end: capacity,
            count: 0,
            wrapped: false,
        })
    }

    /// Reserve `size` contiguous bytes
    ///
    /// Returns `None` when no contiguous run of `size` bytes is free. That
    /// is the normal "buffer full" outcome, not an error.
    pub fn allocate(&mut self, size: usize) -> Option<&mut [u8]> {
        if size == 0 || size > self.capacity {
            return None;
        }

        let offset = if self.wrapped {
            if self.tail - self.head < size {
                return None;
            }
            self.head
        } else if self.capacity - self.head >= size {
            self.head
        } else if self.tail >= size {
            self.end = self.head;
            self.head = 0;
            self.wrapped = true;
            0
        } else {
            return None;
        };

        self.head = offset + size;
        self.count += size;

        // SAFETY: [offset, offset + size) lies inside the arena and outside
        // the live region [tail, end) / [tail, head), so no reader view
        // overlaps it.
        Some(unsafe { std::slice::from_raw_parts_mut(self.arena.as_ptr().add(offset), size) })
    }

    /// Release `size` bytes from the tail, in allocation order
    ///
    /// Requests beyond the bytes in use are clamped.
    pub fn free(&mut self, size: usize) {
        let mut size = size.min(self.count);
        self.count -= size;

        if self.wrapped {
            let run = self.end - self.tail;
            if size >= run {
                size -= run;
                self.tail = 0;
                self.end = self.capacity;
                self.wrapped = false;
            }
        }
        self.tail += size;

        if self.count == 0 {
            self.reset();
        }
    }

    /// The contiguous readable run starting at `tail`
    ///
    /// Never crosses the wrap point; after freeing this run a second call
    /// returns the data written from offset 0.
    pub fn peek(&self) -> &[u8] {
        let (ptr, len) = self.peek_raw();
        // SAFETY: the run is initialized, inside the arena, and only
        // writable again after `free`, which needs `&mut self`.
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
    }

    /// Start and length of the readable run
    ///
    /// The bytes stay valid and unchanged until they are freed or the
    /// buffer is flushed or dropped.
    pub(crate) fn peek_raw(&self) -> (NonNull<u8>, usize) {
        let run_end = if self.wrapped { self.end } else { self.head };
        // SAFETY: tail <= capacity, so the pointer stays within (or one past) the arena.
        let start = unsafe { NonNull::new_unchecked(self.arena.as_ptr().add(self.tail)) };
        (start, run_end - self.tail)
    }

    /// Drop all data
    pub fn flush(&mut self) {
        self.count = 0;
        self.reset();
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn has_wrapped(&self) -> bool {
        self.wrapped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by unreleased records
    pub fn used(&self) -> usize {
        self.count
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            capacity: self.capacity,
            used: self.count,
            head: self.head,
            tail: self.tail,
            end: self.end,
            wrapped: self.wrapped,
        }
    }

    fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.end = self.capacity;
        self.wrapped = false;
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.arena.as_ptr(), self.capacity);
        // SAFETY: the arena came from `Box::leak` of a boxed slice of this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer").field("stats", &self.stats()).finish()
    }
}
