//! Growable ring buffer backing the event loop's priority-0 fast path.
//!
//! Producers are already serialized by the loop's operate lock and the loop
//! thread is the only consumer, so the queue needs no synchronization of its
//! own. Capacity grows in place when the ring fills; it never shrinks.

const CHUNK: usize = 64;

/// A FIFO ring queue that doubles its capacity when full.
pub struct RingQueue<T> {
    buf: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingQueue<T> {
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(CHUNK);
        buf.resize_with(CHUNK, || None);
        RingQueue { buf, head: 0, len: 0 }
    }

    /// Appends an item, growing the ring if necessary.
    pub fn push(&mut self, item: T) {
        if self.len == self.buf.len() {
            self.grow();
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = Some(item);
        self.len += 1;
    }

    /// Removes and returns the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.buf[self.head].take();
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        item
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn grow(&mut self) {
        let old_cap = self.buf.len();
        let new_cap = (old_cap * 2).max(CHUNK);
        let mut buf = Vec::with_capacity(new_cap);
        buf.resize_with(new_cap, || None);
        for i in 0..self.len {
            buf[i] = self.buf[(self.head + i) % old_cap].take();
        }
        self.buf = buf;
        self.head = 0;
    }
}

impl<T> Default for RingQueue<T> {
    fn default() -> Self {
        RingQueue::new()
    }
}
