//! Queue consumer
//!
//! Wraps a [`QueueClient`] with the pipeline's receive, delete and
//! visibility semantics, and runs the long-poll receive loop that feeds the
//! shared [`WorkerPool`].

use crate::error::{ErrorKind, PipelineResult};
use crate::message::{Message, ProcessingOutcome, ReceiptToken};
use crate::metrics::PipelineMetrics;
use crate::pool::{InFlightTasks, WorkerPool};
use crate::processor::MessageProcessor;
use crate::queue::QueueClient;
use crate::retry::RetryPolicy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Backoff after the first failed receive call, doubled per consecutive failure.
const RECEIVE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const MAX_RECEIVE_BACKOFF: Duration = Duration::from_secs(30);

/// Resolves once shutdown is requested or the sender is dropped.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Tally of one consumer's work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub received: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub receive_errors: u64,
    /// Message ids still in flight when the drain deadline passed
    pub abandoned: Vec<String>,
}

impl ConsumerReport {
    fn record(&mut self, outcomes: impl IntoIterator<Item = ProcessingOutcome>) {
        for outcome in outcomes {
            if outcome.success() {
                self.acknowledged += 1;
            } else {
                self.failed += 1;
            }
        }
    }
}

/// Consumer over one source queue.
pub struct QueueConsumer {
    client: Arc<dyn QueueClient>,
    batch_size: usize,
    poll_timeout: Duration,
    delete_retry: RetryPolicy,
    receive_backoff: RetryPolicy,
    metrics: PipelineMetrics,
}

impl QueueConsumer {
    pub fn new(client: Arc<dyn QueueClient>, metrics: PipelineMetrics) -> Self {
        Self {
            client,
            batch_size: 10,
            poll_timeout: Duration::from_secs(20),
            delete_retry: RetryPolicy::default(),
            receive_backoff: RetryPolicy::new(u32::MAX, RECEIVE_BACKOFF_BASE, MAX_RECEIVE_BACKOFF),
            metrics,
        }
    }

    /// Maximum messages per receive call
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Long-poll wait per receive call
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Local retry policy for deletes
    pub fn with_delete_retry(mut self, policy: RetryPolicy) -> Self {
        self.delete_retry = policy;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Receive up to `max_messages`, blocking at most the poll timeout.
    ///
    /// An empty batch means the wait elapsed with nothing to deliver.
    pub async fn receive_batch(&self, max_messages: usize) -> PipelineResult<Vec<Message>> {
        let max_messages = max_messages.clamp(1, self.batch_size);
        let mut batch = self.client.receive(max_messages, self.poll_timeout).await?;

        if batch.len() > max_messages {
            // Surplus messages were never dispatched; the queue redelivers
            // them once their visibility lapses.
            warn!(
                requested = max_messages,
                received = batch.len(),
                "Queue returned more messages than requested, releasing surplus"
            );
            batch.truncate(max_messages);
        }

        if !batch.is_empty() {
            debug!(count = batch.len(), backend = self.client.name(), "Received batch");
            self.metrics.messages_received(batch.len());
        }
        Ok(batch)
    }

    /// Best-effort visibility extension. Failures are logged and counted;
    /// the error is handed back only so the caller can notice an expired
    /// receipt.
    pub async fn extend_visibility(
        &self,
        receipt: &ReceiptToken,
        duration: Duration,
    ) -> PipelineResult<()> {
        let result = self.client.extend_visibility(receipt, duration).await;
        match &result {
            Ok(()) => debug!(
                extend_secs = duration.as_secs(),
                "Extended message visibility"
            ),
            Err(e) => {
                self.metrics.visibility_extension_failed();
                warn!(
                    error = %e,
                    error_kind = %e.kind(),
                    "Failed to extend message visibility"
                );
            }
        }
        result
    }

    /// Delete (acknowledge) a message.
    ///
    /// Transient failures are retried locally up to the delete attempt
    /// ceiling; after that the error is logged and returned, and the message
    /// is left for redelivery.
    pub async fn delete_message(&self, receipt: &ReceiptToken) -> PipelineResult<()> {
        let result = self
            .delete_retry
            .run(
                "queue.delete",
                || self.client.delete(receipt),
                |_, _| self.metrics.retried("queue.delete"),
            )
            .await;

        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::ReceiptExpired => warn!(
                    error = %e,
                    "Receipt expired before delete, message will be redelivered"
                ),
                _ => error!(
                    error = %e,
                    error_kind = %e.kind(),
                    attempts = self.delete_retry.max_attempts,
                    "Failed to delete message, giving up"
                ),
            }
        }
        result
    }

    /// Run the receive loop until `shutdown` flips to `true` (or its sender
    /// is dropped).
    ///
    /// Receives only as many messages as the pool has free slots, waiting
    /// for a slot when the pool is full. Receive failures back off
    /// exponentially and never end the loop. On shutdown, in-flight messages
    /// get until `grace` to finish; the rest are aborted and reported as
    /// abandoned.
    pub async fn run(
        self: Arc<Self>,
        consumer_index: usize,
        processor: Arc<MessageProcessor>,
        pool: Arc<WorkerPool>,
        mut shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> ConsumerReport {
        info!(
            consumer = consumer_index,
            backend = self.client.name(),
            batch_size = self.batch_size,
            poll_timeout_secs = self.poll_timeout.as_secs(),
            "Starting queue consumer"
        );

        let mut report = ConsumerReport::default();
        let mut tasks = InFlightTasks::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            report.record(tasks.reap());

            let reservation = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                reservation = pool.reserve(self.batch_size) => reservation,
            };
            let Some(mut reservation) = reservation else {
                warn!(consumer = consumer_index, "Worker pool closed, stopping consumer");
                break;
            };

            // A shutdown during the long poll drops the pending receive; any
            // message it would have returned stays on the queue.
            let received = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                received = self.receive_batch(reservation.len()) => received,
            };

            match received {
                Ok(batch) => {
                    if consecutive_errors > 0 {
                        info!(
                            consumer = consumer_index,
                            consecutive_errors = consecutive_errors,
                            "Queue recovered"
                        );
                        consecutive_errors = 0;
                    }
                    report.received += batch.len() as u64;

                    for message in batch {
                        let Some(permit) = reservation.take() else {
                            break;
                        };
                        processor.spawn(message, pool.track(permit), &mut tasks);
                    }
                }
                Err(e) => {
                    drop(reservation);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    report.receive_errors += 1;
                    self.metrics.receive_error();

                    let backoff = self.receive_backoff.delay_for_retry(consecutive_errors - 1);
                    warn!(
                        consumer = consumer_index,
                        error = %e,
                        error_kind = %e.kind(),
                        consecutive_errors = consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Receive failed, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(
            consumer = consumer_index,
            in_flight = tasks.len(),
            grace_secs = grace.as_secs(),
            "Shutdown requested, draining in-flight messages"
        );

        let drained = tasks.drain(Instant::now() + grace).await;
        report.record(drained.completed);

        if !drained.abandoned.is_empty() {
            self.metrics.abandoned(drained.abandoned.len());
            for message_id in &drained.abandoned {
                warn!(
                    consumer = consumer_index,
                    message_id = %message_id,
                    "Abandoned in-flight message at shutdown deadline"
                );
            }
        }
        report.abandoned = drained.abandoned;

        info!(
            consumer = consumer_index,
            received = report.received,
            acknowledged = report.acknowledged,
            failed = report.failed,
            abandoned = report.abandoned.len(),
            "Queue consumer stopped"
        );
        report
    }

    /// Receive a single batch, process it on the pool and wait for every
    /// message to reach a terminal state.
    pub async fn run_once(
        &self,
        processor: Arc<MessageProcessor>,
        pool: Arc<WorkerPool>,
    ) -> PipelineResult<ConsumerReport> {
        let mut report = ConsumerReport::default();
        let Some(mut reservation) = pool.reserve(self.batch_size).await else {
            return Ok(report);
        };

        let batch = self.receive_batch(reservation.len()).await?;
        report.received = batch.len() as u64;

        let mut tasks = InFlightTasks::new();
        for message in batch {
            let Some(permit) = reservation.take() else {
                break;
            };
            processor.spawn(message, pool.track(permit), &mut tasks);
        }
        drop(reservation);

        report.record(tasks.join_all().await);
        Ok(report)
    }
}
