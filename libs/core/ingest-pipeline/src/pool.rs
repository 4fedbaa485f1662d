//! Bounded worker pool shared by all consumers
//!
//! The pool hands out semaphore permits; a consumer reserves permits before
//! it receives, so it never pulls more messages than there are free slots.
//! Each dispatched message holds its permit in an [`InFlightGuard`] until it
//! reaches a terminal state (or its task is aborted).

use crate::message::ProcessingOutcome;
use crate::metrics::PipelineMetrics;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::error;

/// Fixed-size pool of processing slots.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    metrics: PipelineMetrics,
}

impl WorkerPool {
    pub fn new(capacity: usize, metrics: PipelineMetrics) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently reserved or in flight.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for at least one free slot, then take as many more as are
    /// immediately free, up to `max`.
    ///
    /// Returns `None` once the pool is closed.
    pub async fn reserve(&self, max: usize) -> Option<Reservation> {
        let first = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        let mut permits = vec![first];

        while permits.len() < max {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        Some(Reservation { permits })
    }

    /// Turn a reserved slot into an in-flight message.
    pub fn track(&self, permit: OwnedSemaphorePermit) -> InFlightGuard {
        self.metrics.dispatched();
        InFlightGuard {
            _permit: permit,
            metrics: self.metrics.clone(),
        }
    }

    /// Stop handing out slots. Pending `reserve` calls return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Slots reserved ahead of a receive call. Unused slots return to the pool
/// on drop.
#[derive(Debug)]
pub struct Reservation {
    permits: Vec<OwnedSemaphorePermit>,
}

impl Reservation {
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }

    pub fn take(&mut self) -> Option<OwnedSemaphorePermit> {
        self.permits.pop()
    }
}

/// Holds one pool slot for the lifetime of a message's processing.
#[derive(Debug)]
pub struct InFlightGuard {
    _permit: OwnedSemaphorePermit,
    metrics: PipelineMetrics,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.completed();
    }
}

type PendingIds = Arc<Mutex<HashMap<u64, String>>>;

/// Removes a task's message id from the pending map when the task ends,
/// whether it completed or was aborted.
struct PendingSlot {
    pending: PendingIds,
    slot: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.slot);
    }
}

/// Result of draining [`InFlightTasks`].
#[derive(Debug, Default)]
pub struct DrainReport {
    pub completed: Vec<ProcessingOutcome>,
    /// Message ids still in flight at the deadline
    pub abandoned: Vec<String>,
}

/// Processing tasks spawned by one consumer.
#[derive(Default)]
pub struct InFlightTasks {
    tasks: JoinSet<ProcessingOutcome>,
    pending: PendingIds,
    next_slot: u64,
}

impl InFlightTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn `processing` for `message_id`, holding `guard` until it ends.
    pub fn spawn<F>(&mut self, message_id: String, guard: InFlightGuard, processing: F)
    where
        F: Future<Output = ProcessingOutcome> + Send + 'static,
    {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot, message_id);

        let pending = PendingSlot {
            pending: Arc::clone(&self.pending),
            slot,
        };
        self.tasks.spawn(async move {
            let _pending = pending;
            let _guard = guard;
            processing.await
        });
    }

    /// Collect outcomes of tasks that already finished, without waiting.
    pub fn reap(&mut self) -> Vec<ProcessingOutcome> {
        let mut outcomes = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            outcomes.extend(Self::unpack(result));
        }
        outcomes
    }

    /// Wait for every task to finish.
    pub async fn join_all(&mut self) -> Vec<ProcessingOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.tasks.join_next().await {
            outcomes.extend(Self::unpack(result));
        }
        outcomes
    }

    /// Wait for tasks until `deadline`, then abort whatever is left.
    pub async fn drain(&mut self, deadline: Instant) -> DrainReport {
        let mut report = DrainReport::default();

        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(result)) => report.completed.extend(Self::unpack(result)),
                Ok(None) => break,
                Err(_) => {
                    // Snapshot before reaping so a task finishing in between
                    // lands in `completed` rather than nowhere.
                    let mut abandoned = self.pending_ids();
                    let finished = self.reap();
                    abandoned.retain(|id| !finished.iter().any(|o| &o.message_id == id));
                    report.completed.extend(finished);
                    report.abandoned = abandoned;
                    self.tasks.shutdown().await;
                    break;
                }
            }
        }

        report
    }

    /// Message ids of tasks that have not finished yet.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn unpack(
        result: Result<ProcessingOutcome, tokio::task::JoinError>,
    ) -> Option<ProcessingOutcome> {
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                error!(error = %e, "Processing task panicked");
                None
            }
        }
    }
}
