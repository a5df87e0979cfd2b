//! Admission control: bounds the number of active connection workers.
//!
//! A connection that finds every slot taken waits in a bounded queue for up
//! to the queue timeout. Beyond either bound it is rejected, and the caller
//! owes the client a busy reply.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("wait queue is full")]
    QueueFull,
    #[error("timed out waiting for a worker slot")]
    TimedOut,
    #[error("admission is closed")]
    Closed,
}

/// Ticket for one active worker. Dropping it frees the slot, which also
/// covers workers that panic.
#[derive(Debug)]
pub struct WorkerSlot {
    active: Arc<watch::Sender<usize>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerSlot {
    // runs before the permit is returned, so the count never exceeds max_threads
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    active: Arc<watch::Sender<usize>>,
    max_threads: usize,
    max_queue: usize,
    queued: AtomicUsize,
}

/// Decrements the queue length on drop.
struct QueueTicket<'a>(&'a AtomicUsize);

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionController {
    #[must_use]
    pub fn new(max_threads: usize, max_queue: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_threads)),
            active: Arc::new(watch::Sender::new(0)),
            max_threads,
            max_queue,
            queued: AtomicUsize::new(0),
        }
    }

    /// Take a worker slot, waiting up to `timeout` in the queue if none is free.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` when the queue is full, the wait times out, or
    /// admission was closed by shutdown.
    pub async fn acquire(&self, timeout: Duration) -> Result<WorkerSlot, Rejected> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => return Ok(self.occupy(permit)),
            Err(TryAcquireError::Closed) => return Err(Rejected::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let _ticket = self.enqueue()?;
        match tokio::time::timeout(timeout, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(self.occupy(permit)),
            Ok(Err(_)) => Err(Rejected::Closed),
            Err(_) => Err(Rejected::TimedOut),
        }
    }

    fn occupy(&self, permit: OwnedSemaphorePermit) -> WorkerSlot {
        self.active.send_modify(|n| *n += 1);
        WorkerSlot {
            active: Arc::clone(&self.active),
            _permit: permit,
        }
    }

    fn enqueue(&self) -> Result<QueueTicket<'_>, Rejected> {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_queue).then_some(n + 1)
            })
            .map_err(|_| Rejected::QueueFull)?;
        Ok(QueueTicket(&self.queued))
    }

    /// Workers currently holding a slot.
    #[must_use]
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Connections waiting for a slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Resolve once every slot has been released. Holds no permits while
    /// waiting, so queued connections can still be admitted.
    pub async fn wait_idle(&self) {
        let mut active = self.active.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = active.wait_for(|n| *n == 0).await;
    }

    /// Reject every current and future waiter.
    pub fn close(&self) {
        self.slots.close();
    }
}
