//! Fixed-capacity FIFO queue
//!
//! [`Fifo`] is a circular buffer that never grows and never blocks. It is
//! not synchronised: all mutation takes `&mut self`, so sharing one between
//! threads means wrapping it in a lock. The receive path pairs it with a
//! `parking_lot::Mutex` and `Condvar` to provide blocking reads.
//!
//! [`BufferPool`] reuses the same ring to recycle USB transfer buffers.

use crate::error::{CandleError, Result};

/// Fixed-capacity circular buffer
#[derive(Debug, Clone)]
pub struct Fifo<T> {
    slots: Vec<Option<T>>,
    /// Index of the oldest element
    head: usize,
    len: usize,
}

impl<T> Fifo<T> {
    /// Create a FIFO holding at most `capacity` elements
    ///
    /// Fails with `InvalidParameter` when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CandleError::invalid_parameter(
                "capacity",
                0u64,
                "FIFO capacity must be at least 1",
            ));
        }
        Ok(Self::with_capacity(capacity))
    }

    /// Create a FIFO holding at most `capacity` elements
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "FIFO capacity must be at least 1");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Append an item; returns `false` and drops it when full
    pub fn push(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        let tail = self.wrap(self.head + self.len);
        self.slots[tail] = Some(item);
        self.len += 1;
        true
    }

    /// Append an item, evicting and returning the oldest one when full
    pub fn push_overwrite(&mut self, item: T) -> Option<T> {
        let evicted = if self.is_full() { self.pop() } else { None };
        let pushed = self.push(item);
        debug_assert!(pushed);
        evicted
    }

    /// Move the newest item toward the front while it sorts before its
    /// predecessor, looking back at most `depth` places
    ///
    /// Returns how many places the item moved.
    pub fn sift_back<F>(&mut self, depth: usize, mut before: F) -> usize
    where
        F: FnMut(&T, &T) -> bool,
    {
        let mut moved = 0;
        let mut pos = self.len;
        while pos > 1 && moved < depth {
            let cur = self.wrap(self.head + pos - 1);
            let prev = self.wrap(self.head + pos - 2);
            match (&self.slots[cur], &self.slots[prev]) {
                (Some(item), Some(earlier)) if before(item, earlier) => {}
                _ => break,
            }
            self.slots.swap(cur, prev);
            pos -= 1;
            moved += 1;
        }
        moved
    }

    /// Remove the oldest item
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = self.wrap(self.head + 1);
        self.len -= 1;
        item
    }

    /// Peek at the oldest item
    pub fn front(&self) -> Option<&T> {
        if self.len == 0 {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.len
    }

    /// Maximum number of stored items
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Check if no items are stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if another push would fail
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Drop every stored item
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.head = 0;
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[self.wrap(self.head + i)].as_ref())
    }

    /// Remove and yield every stored item, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.pop())
    }

    fn wrap(&self, index: usize) -> usize {
        index % self.slots.len()
    }
}

/// Pool of reusable transfer buffers
///
/// Buffers handed out by [`BufferPool::take`] are always `buffer_size` long.
/// Returned buffers beyond the pool's capacity are freed.
#[derive(Debug)]
pub struct BufferPool {
    free: Fifo<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create an empty pool retaining up to `capacity` buffers
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            free: Fifo::with_capacity(capacity.max(1)),
            buffer_size,
        }
    }

    /// Get a buffer, allocating when the pool is empty
    pub fn take(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(buf) => buf,
            None => vec![0u8; self.buffer_size],
        }
    }

    /// Return a buffer to the pool
    pub fn give(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(self.buffer_size, 0);
        // Dropped when the pool is full
        let _ = self.free.push(buf);
    }

    /// Buffers currently available for reuse
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Size of each buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
