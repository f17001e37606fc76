use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::util::lock_unpoisoned;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OfferError<T> {
    Full(T),
    Closed(T),
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO with a hard capacity. Producers never block, consumers wait.
pub(crate) struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        let mut state = lock_unpoisoned(&self.state);
        if state.closed {
            return Err(OfferError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(OfferError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// closed and drained.
    pub(crate) fn take(&self) -> Option<T> {
        let mut state = lock_unpoisoned(&self.state);
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = match self.available.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub(crate) fn close(&self) {
        lock_unpoisoned(&self.state).closed = true;
        self.available.notify_all();
    }

    /// Closes the queue and hands back everything still waiting in it.
    pub(crate) fn close_and_drain(&self) -> Vec<T> {
        let drained = {
            let mut state = lock_unpoisoned(&self.state);
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.available.notify_all();
        drained
    }

    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.state).items.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.state).closed
    }
}
