// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, growable FIFO with drop-oldest overflow semantics.
//!
//! The queue starts with a buffer of `min` slots and doubles it (up to `max`)
//! whenever it runs out of space. Once the buffer reached `max` slots, every
//! further enqueue overwrites the oldest element. Backing buffers are recycled
//! through a [`BufferPool`] that may be shared between several queues.
//!
//! ```text
//! max = 4, enqueue 1..=6
//!   [1]  ->  [1 2]  ->  [1 2 3 _]  ->  [1 2 3 4]  ->  [5 2 3 4]  ->  [5 6 3 4]
//!                                                     head=1        head=2
//! flush() == [3, 4, 5, 6]
//! ```

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Inclusive range of buffer sizes a [`RingQueue`] may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: usize,
    pub max: usize,
}
impl Range {
    /// Creates a new range. A zero `min` is raised to one, and `max` is raised
    /// to `min` when it is smaller.
    #[must_use]
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
        }
    }

    #[must_use]
    pub fn clamp(&self, value: usize) -> usize {
        value.clamp(self.min, self.max)
    }
}

/// A pool of reusable backing buffers.
#[derive(Debug)]
pub struct BufferPool<T> {
    buffers: Mutex<Vec<Vec<T>>>,
    size: usize,
}
impl<T: Default> BufferPool<T> {
    /// Creates an empty pool producing buffers of `size` slots, clamped to the
    /// range of the requesting queue, when no recycled buffer fits.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            size: size.max(1),
        }
    }

    /// Number of idle buffers currently held by the pool.
    #[must_use]
    pub fn idle(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Takes the most recently released buffer whose length lies within
    /// `sizes`. Buffers of other lengths stay pooled for the queues they fit.
    fn get_within(&self, sizes: Range) -> Vec<T> {
        let mut buffers = lock(&self.buffers);
        match buffers
            .iter()
            .rposition(|buffer| (sizes.min..=sizes.max).contains(&buffer.len()))
        {
            Some(index) => buffers.swap_remove(index),
            None => default_buffer(sizes.clamp(self.size)),
        }
    }

    fn put(&self, mut buffer: Vec<T>) {
        buffer.iter_mut().for_each(|slot| *slot = T::default());
        lock(&self.buffers).push(buffer);
    }
}

/// A thread-safe ring queue that overwrites its oldest values when full.
#[derive(Debug)]
pub struct RingQueue<T> {
    ring: Mutex<Ring<T>>,
    pool: Arc<BufferPool<T>>,
    sizes: Range,
}

#[derive(Debug)]
struct Ring<T> {
    buffer: Vec<T>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T: Default> RingQueue<T> {
    /// Creates a queue with its own private buffer pool.
    #[must_use]
    pub fn new(sizes: Range) -> Self {
        Self::with_pool(sizes, Arc::new(BufferPool::new(sizes.min)))
    }

    /// Creates a queue recycling its buffers through `pool`.
    #[must_use]
    pub fn with_pool(sizes: Range, pool: Arc<BufferPool<T>>) -> Self {
        Self {
            ring: Mutex::new(Ring {
                buffer: default_buffer(sizes.min),
                head: 0,
                tail: 0,
                count: 0,
            }),
            pool,
            sizes,
        }
    }

    #[must_use]
    pub const fn sizes(&self) -> Range {
        self.sizes
    }

    /// Appends values to the queue.
    ///
    /// Returns `false` if at least one older value had to be dropped to make
    /// room for the new ones.
    pub fn enqueue(&self, values: impl IntoIterator<Item = T>) -> bool {
        let mut ring = lock(&self.ring);
        let mut space_left = true;
        for value in values {
            space_left &= self.enqueue_locked(&mut ring, value);
        }
        space_left
    }

    /// Appends a single value, see [`RingQueue::enqueue`].
    pub fn push(&self, value: T) -> bool {
        let mut ring = lock(&self.ring);
        self.enqueue_locked(&mut ring, value)
    }

    fn enqueue_locked(&self, ring: &mut Ring<T>, value: T) -> bool {
        let mut space_left = true;
        if ring.count == ring.buffer.len() {
            if ring.buffer.len() >= self.sizes.max {
                space_left = false;
                ring.head = (ring.head + 1) % ring.buffer.len();
                ring.count -= 1;
            } else {
                self.resize_locked(ring);
            }
        }

        let tail = ring.tail;
        ring.buffer[tail] = value;
        ring.tail = (ring.tail + 1) % ring.buffer.len();
        ring.count += 1;
        space_left
    }

    fn resize_locked(&self, ring: &mut Ring<T>) {
        let mut buffer = default_buffer(self.sizes.clamp(ring.count * 2));
        let len = ring.buffer.len();
        for (i, slot) in buffer.iter_mut().take(ring.count).enumerate() {
            *slot = mem::take(&mut ring.buffer[(ring.head + i) % len]);
        }

        let previous = mem::replace(&mut ring.buffer, buffer);
        ring.head = 0;
        ring.tail = ring.count % ring.buffer.len();
        self.pool.put(previous);
    }

    /// Removes and returns the oldest value, or `T::default()` when the queue
    /// is empty. Use [`RingQueue::is_empty`] to tell the two apart.
    pub fn dequeue(&self) -> T {
        let mut ring = lock(&self.ring);
        if ring.count == 0 {
            return T::default();
        }

        let head = ring.head;
        let value = mem::take(&mut ring.buffer[head]);
        ring.head = (ring.head + 1) % ring.buffer.len();
        ring.count -= 1;
        value
    }

    /// Returns a copy of the most recently enqueued value without removing it,
    /// or `T::default()` when the queue is empty.
    pub fn reverse_peek(&self) -> T
    where
        T: Clone,
    {
        let ring = lock(&self.ring);
        if ring.count == 0 {
            return T::default();
        }
        let len = ring.buffer.len();
        ring.buffer[(ring.tail + len - 1) % len].clone()
    }

    /// Drains the queue, returning its values in FIFO order.
    ///
    /// The current buffer is swapped for one taken from the pool. The drained
    /// buffer goes back to the pool unless it is oversized for the current
    /// throughput (less than 1/8 full and larger than `min`), in which case it
    /// is simply dropped.
    pub fn flush(&self) -> Vec<T> {
        let (mut buffer, head, count) = {
            let mut ring = lock(&self.ring);
            let (head, count) = (ring.head, ring.count);
            let buffer = mem::replace(&mut ring.buffer, self.pool.get_within(self.sizes));
            ring.head = 0;
            ring.tail = 0;
            ring.count = 0;
            (buffer, head, count)
        };

        let len = buffer.len();
        let values = (0..count)
            .map(|i| mem::take(&mut buffer[(head + i) % len]))
            .collect();

        if len == self.sizes.min || count * 8 >= len {
            self.pool.put(buffer);
        }
        values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.ring).count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue reached its maximum size and every slot is used.
    #[must_use]
    pub fn is_full(&self) -> bool {
        let ring = lock(&self.ring);
        ring.count == ring.buffer.len() && ring.buffer.len() == self.sizes.max
    }

    /// Removes all values, keeping the current buffer.
    pub fn clear(&self) {
        let mut ring = lock(&self.ring);
        ring.head = 0;
        ring.tail = 0;
        ring.count = 0;
        ring.buffer.iter_mut().for_each(|slot| *slot = T::default());
    }

    /// Current size of the backing buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        lock(&self.ring).buffer.len()
    }
}

fn default_buffer<T: Default>(size: usize) -> Vec<T> {
    let mut buffer = Vec::with_capacity(size);
    buffer.resize_with(size, T::default);
    buffer
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg_attr(coverage_nightly, coverage(off))] // Test modules skew coverage metrics
#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = RingQueue::new(Range::new(1, 4));
        assert!(queue.enqueue([1, 2, 3, 4]));
        assert!(queue.is_full());

        assert!(!queue.enqueue([5, 6]));
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.flush(), vec![3, 4, 5, 6]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_one_more_at_max_reports_no_space_left() {
        let queue = RingQueue::new(Range::new(4, 4));
        assert!(queue.enqueue([1, 2, 3, 4]));
        assert!(!queue.push(5));
        assert_eq!(queue.dequeue(), 2);
    }

    #[test]
    fn test_enqueue_nothing() {
        let queue = RingQueue::<u32>::new(Range::new(2, 8));
        assert!(queue.enqueue([]));
        assert!(queue.is_empty());
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_empty_reads_return_default() {
        let queue = RingQueue::<String>::new(Range::new(2, 8));
        assert_eq!(queue.dequeue(), String::new());
        assert_eq!(queue.reverse_peek(), String::new());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_returns_enqueued_value() {
        let queue = RingQueue::new(Range::new(2, 8));
        queue.push("a".to_string());
        assert_eq!(queue.reverse_peek(), "a");
        assert_eq!(queue.dequeue(), "a");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reverse_peek_after_wrap() {
        let queue = RingQueue::new(Range::new(3, 3));
        queue.enqueue([1, 2, 3, 4]);
        assert_eq!(queue.reverse_peek(), 4);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_growth_doubles_up_to_max() {
        let queue = RingQueue::new(Range::new(2, 5));
        assert_eq!(queue.capacity(), 2);
        queue.enqueue([1, 2, 3]);
        assert_eq!(queue.capacity(), 4);
        queue.enqueue([4, 5]);
        assert_eq!(queue.capacity(), 5);
        assert!(queue.is_full());
    }

    #[test]
    fn test_growth_preserves_order_after_wrap() {
        let queue = RingQueue::new(Range::new(2, 16));
        queue.enqueue([1, 2]);
        assert_eq!(queue.dequeue(), 1);
        queue.enqueue([3, 4, 5]);
        assert_eq!(queue.flush(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_clear() {
        let queue = RingQueue::new(Range::new(2, 4));
        queue.enqueue([1, 2, 3]);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), 0);
        queue.push(7);
        assert_eq!(queue.flush(), vec![7]);
    }

    #[test]
    fn test_flush_recycles_buffers() {
        let pool = Arc::new(BufferPool::new(2));
        let queue = RingQueue::with_pool(Range::new(2, 64), Arc::clone(&pool));

        // Minimum sized buffers always return to the pool.
        queue.enqueue([1]);
        assert_eq!(queue.flush(), vec![1]);
        assert_eq!(pool.idle(), 1);

        // Grow to 64 slots, then drain it while it is almost empty: the large
        // buffer is dropped instead of being recycled.
        queue.enqueue(0..40);
        let grown_idle = pool.idle();
        for _ in 0..35 {
            queue.dequeue();
        }
        assert_eq!(queue.capacity(), 64);
        assert_eq!(queue.flush(), vec![35, 36, 37, 38, 39]);
        assert_eq!(pool.idle(), grown_idle.saturating_sub(1));
    }

    #[test]
    fn test_shared_pool_between_queues() {
        let pool = Arc::new(BufferPool::new(4));
        let first = RingQueue::with_pool(Range::new(4, 4), Arc::clone(&pool));
        let second = RingQueue::with_pool(Range::new(4, 4), Arc::clone(&pool));

        first.enqueue([1, 2]);
        second.enqueue([3]);
        assert_eq!(first.flush(), vec![1, 2]);
        assert_eq!(second.flush(), vec![3]);
        // The second flush reused the buffer released by the first one.
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_shared_pool_respects_each_queue_range() {
        let pool = Arc::new(BufferPool::new(2));
        let large = RingQueue::with_pool(Range::new(16, 64), Arc::clone(&pool));
        let small = RingQueue::with_pool(Range::new(4, 4), Arc::clone(&pool));

        large.enqueue(0..40);
        assert_eq!(large.capacity(), 64);
        assert_eq!(large.flush().len(), 40);
        assert_eq!(pool.idle(), 2);

        // Neither idle buffer fits, so the small queue allocates its own.
        assert!(small.flush().is_empty());
        assert_eq!(pool.idle(), 3);
        assert!(!small.enqueue(0..10));
        assert_eq!(small.capacity(), 4);
        assert!(small.is_full());
        assert_eq!(small.flush(), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_concurrent_enqueue() {
        let queue = Arc::new(RingQueue::new(Range::new(8, 1024)));
        std::thread::scope(|s| {
            for t in 0..4 {
                let queue = Arc::clone(&queue);
                s.spawn(move || {
                    for i in 0..100 {
                        queue.push(t * 100 + i);
                    }
                });
            }
        });
        let mut values = queue.flush();
        values.sort_unstable();
        assert_eq!(values, (0..400).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn prop_length_is_bounded_and_fifo(
            max in 1usize..32,
            values in proptest::collection::vec(any::<u16>(), 0..128),
        ) {
            let queue = RingQueue::new(Range::new(1, max));
            queue.enqueue(values.iter().copied());

            prop_assert_eq!(queue.len(), values.len().min(max));
            let expected = values[values.len().saturating_sub(max)..].to_vec();
            prop_assert_eq!(queue.flush(), expected);
            prop_assert_eq!(queue.len(), 0);
        }
    }
}
