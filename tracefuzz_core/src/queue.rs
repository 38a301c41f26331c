//! Bounded blocking containers for handing trace data across threads.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Bounded FIFO queue. `put` blocks while the queue is full; `remove` waits at
/// most `timeout` and returns `None` if nothing arrived.
pub struct BlockingQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self { tx, rx }
    }

    pub fn put(&self, item: T) {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.tx.send(item);
    }

    pub fn remove(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

/// Bounded double-ended queue with blocking insertion at either end and
/// timed polling from either end.
pub struct SyncBlockingDeque<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> SyncBlockingDeque<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "deque capacity must be positive");
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_room(&self) -> MutexGuard<'_, VecDeque<T>> {
        let mut items = self.lock();
        while items.len() >= self.capacity {
            items = self
                .not_full
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
        items
    }

    pub fn put_first(&self, item: T) {
        let mut items = self.wait_for_room();
        items.push_front(item);
        self.not_empty.notify_one();
    }

    pub fn put_last(&self, item: T) {
        let mut items = self.wait_for_room();
        items.push_back(item);
        self.not_empty.notify_one();
    }

    fn poll_with(
        &self,
        timeout: Duration,
        take: impl Fn(&mut VecDeque<T>) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = take(&mut items) {
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            items = self
                .not_empty
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn poll_first(&self, timeout: Duration) -> Option<T> {
        self.poll_with(timeout, VecDeque::pop_front)
    }

    pub fn poll_last(&self, timeout: Duration) -> Option<T> {
        self.poll_with(timeout, VecDeque::pop_back)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
