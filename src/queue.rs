//! Cross-thread handoff primitives.
//!
//! - [`WorkQueue`]: unbounded FIFO with a cancellable, timed receive.
//! - [`LatestCell`]: single-slot, latest-wins value (the current camera frame).

use crate::shutdown::StopSignal;
use crossbeam_channel::{select, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of a timed receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    /// A value was dequeued.
    Item(T),
    /// Nothing arrived within the timeout.
    Empty,
    /// The stop signal fired, or every sender is gone.
    Cancelled,
}

/// Producer side of a [`WorkQueue`]. Cheap to clone.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue a value. Returns `false` if the consumer has gone away.
    pub fn push(&self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// Consumer side of an unbounded multi-producer FIFO.
#[derive(Debug)]
pub struct WorkQueue<T> {
    rx: Receiver<T>,
}

impl<T> WorkQueue<T> {
    /// Create a queue and its first sender.
    pub fn unbounded() -> (QueueSender<T>, WorkQueue<T>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (QueueSender { tx }, WorkQueue { rx })
    }

    /// Wait up to `timeout` for the next value.
    ///
    /// Returns [`Recv::Cancelled`] as soon as `stop` fires, even mid-wait. Values still
    /// queued at that point are left in place.
    pub fn recv(&self, timeout: Duration, stop: &StopSignal) -> Recv<T> {
        if stop.is_cancelled() {
            return Recv::Cancelled;
        }
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(value) => Recv::Item(value),
                Err(_) => Recv::Cancelled,
            },
            recv(stop.wake()) -> _ => Recv::Cancelled,
            default(timeout) => Recv::Empty,
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Discard everything currently queued, returning how many values were dropped.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Number of values waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Latest-wins shared slot. Readers never block on a missing value.
#[derive(Debug)]
pub struct LatestCell<T> {
    slot: Arc<Mutex<Option<Arc<T>>>>,
}

impl<T> Clone for LatestCell<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for LatestCell<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> LatestCell<T> {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored value.
    pub fn store(&self, value: impl Into<Arc<T>>) {
        let mut guard = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(value.into());
    }

    /// The most recent value, if any has been stored.
    pub fn latest(&self) -> Option<Arc<T>> {
        match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
