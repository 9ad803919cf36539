use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::normalizer::NormalizedEvent;

pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Fixed-capacity FIFO shared by the receive task (producer) and polling
/// callers (consumers).
///
/// Appends and drains each take the lock once, so an append lands either
/// wholly before or wholly after any drain. When full, the oldest event is
/// evicted.
#[derive(Debug)]
pub struct EventBuffer<T = NormalizedEvent> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    events: VecDeque<T>,
    evicted: u64,
}

impl<T> EventBuffer<T> {
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
                evicted: 0,
            }),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: T) {
        let mut inner = self.inner.lock();
        while inner.events.len() >= self.capacity {
            inner.events.pop_front();
            inner.evicted += 1;
        }
        inner.events.push_back(event);
    }

    /// Append under a single lock, so a drain sees all of `events` or none.
    pub fn extend(&self, events: impl IntoIterator<Item = T>) {
        let mut inner = self.inner.lock();
        for event in events {
            if inner.events.len() >= self.capacity {
                inner.events.pop_front();
                inner.evicted += 1;
            }
            inner.events.push_back(event);
        }
    }

    /// Remove and return everything, oldest first. Never blocks on an
    /// empty buffer.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Events dropped to make room since creation.
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }
}

impl<T> Default for EventBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
