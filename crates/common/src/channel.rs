//! Bounded schedule queue between callback context and the cooperative task
//!
//! The producer side is handed to code that runs inside host-controller
//! callbacks: scheduling never blocks and never allocates, and when the queue
//! is full the item is dropped and counted. The consumer side is drained by
//! the cooperative task at its next safe point.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Producer handle (callback context)
pub struct Scheduler<T> {
    tx: Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> Scheduler<T> {
    /// Enqueue an item without blocking
    ///
    /// Returns `false` when the queue is full or the runner is gone; the item
    /// is dropped in that case.
    #[must_use]
    pub fn try_schedule(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Schedule queue full, item dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Schedule queue closed, item dropped");
                false
            }
        }
    }

    /// Number of items dropped because the queue was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

/// Consumer handle (cooperative task)
pub struct ScheduleRunner<T> {
    rx: Receiver<T>,
}

impl<T> ScheduleRunner<T> {
    /// Take the next queued item without blocking
    pub fn try_next(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Number of items currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a schedule queue holding at most `depth` items
///
/// A depth of zero is raised to one.
pub fn create_schedule_queue<T>(depth: usize) -> (Scheduler<T>, ScheduleRunner<T>) {
    let (tx, rx) = bounded(depth.max(1));

    (
        Scheduler {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        ScheduleRunner { rx },
    )
}
