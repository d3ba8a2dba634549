//! Bounded async FIFO with flush.

use std::collections::VecDeque;
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::Notify;

/// A first-in, first-out queue with optional capacity.
///
/// Producers wait in [`enqueue`](Self::enqueue) while the queue is full;
/// consumers either wait in [`dequeue`](Self::dequeue) or poll with
/// [`try_dequeue`](Self::try_dequeue). [`flush`](Self::flush) drops
/// everything buffered and wakes waiting consumers empty-handed.
pub struct Fifo<T> {
    state: StdMutex<State<T>>,
    capacity: Option<usize>,
    /// Signaled on push and flush
    items: Notify,
    /// Signaled on pop and flush
    space: Notify,
}

struct State<T> {
    queue: VecDeque<T>,
    /// Bumped by every flush so sleeping consumers can tell they were flushed
    generation: u64,
}

impl<T> Fifo<T> {
    /// Create a queue holding at most `capacity` items, or unbounded for
    /// `None`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is `Some(0)`; such a queue could never accept an
    /// item.
    pub fn new(capacity: Option<usize>) -> Self {
        assert!(capacity != Some(0), "bounded fifo requires capacity > 0");
        Self {
            state: StdMutex::new(State {
                queue: VecDeque::new(),
                generation: 0,
            }),
            capacity,
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    fn state(&self) -> StdMutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, waiting for a free slot if the queue is full.
    pub async fn enqueue(&self, item: T) {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.state();
                if self.capacity.map_or(true, |cap| state.queue.len() < cap) {
                    state.queue.push_back(item);
                    drop(state);
                    self.items.notify_one();
                    return;
                }
            }

            space.await;
        }
    }

    /// Remove the oldest item, waiting for one if the queue is empty.
    ///
    /// Returns `None` if a [`flush`](Self::flush) happened while waiting.
    pub async fn dequeue(&self) -> Option<T> {
        let generation = self.state().generation;
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Some(item);
                }
                if state.generation != generation {
                    return None;
                }
            }

            items.await;
        }
    }

    /// Remove the oldest item if there is one. Never waits.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.state().queue.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    /// Discard every buffered item and return how many there were.
    ///
    /// Consumers waiting in [`dequeue`](Self::dequeue) wake with `None`;
    /// producers waiting for space retry.
    pub fn flush(&self) -> usize {
        let discarded = {
            let mut state = self.state();
            state.generation = state.generation.wrapping_add(1);
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        self.items.notify_waiters();
        self.space.notify_waiters();
        discarded
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
