//! Per-message processing
//!
//! Drives one delivery attempt through
//! `Received -> Stored -> Notified -> Acknowledged`, stopping at `Failed` on
//! the first step that errors. The message is only deleted from the queue
//! after both the write and the notification succeeded; a failed message is
//! left for the queue to redeliver.

use crate::consumer::QueueConsumer;
use crate::error::{ErrorKind, PipelineError};
use crate::message::{Message, NotificationEvent, ProcessingOutcome, ProcessingState, ReceiptToken};
use crate::metrics::PipelineMetrics;
use crate::notification::NotificationPublisher;
use crate::pool::{InFlightGuard, InFlightTasks};
use crate::storage::StorageWriter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Orchestrates store, notify and acknowledge for each message.
pub struct MessageProcessor {
    storage: StorageWriter,
    notifier: NotificationPublisher,
    consumer: Arc<QueueConsumer>,
    metrics: PipelineMetrics,
    visibility_timeout: Option<Duration>,
}

impl MessageProcessor {
    pub fn new(
        storage: StorageWriter,
        notifier: NotificationPublisher,
        consumer: Arc<QueueConsumer>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            storage,
            notifier,
            consumer,
            metrics,
            visibility_timeout: None,
        }
    }

    /// Extend the receipt's visibility by `timeout` every `timeout / 2` while
    /// a message is being processed.
    pub fn with_visibility_heartbeat(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Process one delivery attempt to a terminal state.
    ///
    /// Never returns an error: failures are classified into the outcome and
    /// logged, and never affect other messages.
    pub async fn process(&self, message: Message) -> ProcessingOutcome {
        let span = info_span!(
            "process_message",
            message_id = %message.id,
            receive_count = message.receive_count
        );

        async {
            let started = Instant::now();
            debug!(
                bytes = message.body.len(),
                redelivery = message.is_redelivery(),
                state = %ProcessingState::Received,
                "Processing message"
            );

            let steps = self.run_steps(&message);
            let outcome = match self.visibility_timeout {
                Some(timeout) => self.with_heartbeat(&message.receipt, timeout, steps).await,
                None => steps.await,
            };

            self.metrics.message_duration(started.elapsed());
            outcome
        }
        .instrument(span)
        .await
    }

    /// Dispatch `message` onto `tasks`, holding `guard` until it finishes.
    pub fn spawn(self: &Arc<Self>, message: Message, guard: InFlightGuard, tasks: &mut InFlightTasks) {
        let processor = Arc::clone(self);
        let message_id = message.id.clone();
        tasks.spawn(message_id, guard, async move { processor.process(message).await });
    }

    async fn run_steps(&self, message: &Message) -> ProcessingOutcome {
        let key = message.storage_key();

        if let Err(e) = self.storage.write(&key, message.body.clone()).await {
            return self.fail(message, ProcessingState::Received, "store", e);
        }
        self.metrics.transition(ProcessingState::Stored);
        info!(storage_key = %key, state = %ProcessingState::Stored, "Message stored");

        let event = NotificationEvent::stored(message.id.clone(), key);
        if let Err(e) = self.notifier.publish(&event).await {
            return self.fail(message, ProcessingState::Stored, "notify", e);
        }
        self.metrics.transition(ProcessingState::Notified);
        info!(state = %ProcessingState::Notified, "Notification published");

        if let Err(e) = self.consumer.delete_message(&message.receipt).await {
            return self.fail(message, ProcessingState::Notified, "delete", e);
        }
        self.metrics.transition(ProcessingState::Acknowledged);
        info!(state = %ProcessingState::Acknowledged, "Message acknowledged");

        ProcessingOutcome::acknowledged(message.id.clone())
    }

    async fn with_heartbeat<F>(&self, receipt: &ReceiptToken, timeout: Duration, steps: F) -> ProcessingOutcome
    where
        F: Future<Output = ProcessingOutcome>,
    {
        let period = timeout / 2;
        if period.is_zero() {
            return steps.await;
        }

        // Extensions run concurrently with the steps, never in between them.
        let heartbeat = self.heartbeat(receipt, timeout, period);
        tokio::pin!(steps);
        tokio::pin!(heartbeat);

        tokio::select! {
            outcome = &mut steps => outcome,
            () = &mut heartbeat => steps.await,
        }
    }

    /// Extend visibility every `period` until the receipt is reported expired.
    async fn heartbeat(&self, receipt: &ReceiptToken, timeout: Duration, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.consumer.extend_visibility(receipt, timeout).await {
                if e.kind() == ErrorKind::ReceiptExpired {
                    warn!(
                        error = %e,
                        "Receipt expired during processing, stopping visibility heartbeat"
                    );
                    return;
                }
            }
        }
    }

    fn fail(
        &self,
        message: &Message,
        reached: ProcessingState,
        step: &'static str,
        err: PipelineError,
    ) -> ProcessingOutcome {
        let kind = err.kind();
        self.metrics.failed(step, kind);

        match kind {
            ErrorKind::ReceiptExpired => warn!(
                step = step,
                reached = %reached,
                error = %err,
                outcome = %kind.failure_label(),
                "Receipt expired, abandoning message for redelivery"
            ),
            ErrorKind::Transient => warn!(
                step = step,
                reached = %reached,
                error = %err,
                error_kind = %kind,
                outcome = %kind.failure_label(),
                "Message failed after retries, leaving it on the queue"
            ),
            ErrorKind::Permanent => error!(
                step = step,
                reached = %reached,
                error = %err,
                error_kind = %kind,
                outcome = %kind.failure_label(),
                "Message failed permanently, leaving it on the queue"
            ),
        }

        ProcessingOutcome::failed(message.id.clone(), reached, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineResult;
    use crate::notification::MockPublisher;
    use crate::queue::{MockQueueClient, QueueClient};
    use crate::retry::RetryPolicy;
    use crate::storage::MockObjectStore;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn build(
        store: MockObjectStore,
        publisher: MockPublisher,
        queue: MockQueueClient,
    ) -> MessageProcessor {
        let metrics = PipelineMetrics::new("test");
        let retry = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(20));
        let consumer = Arc::new(
            QueueConsumer::new(Arc::new(queue), metrics.clone()).with_delete_retry(retry.clone()),
        );
        MessageProcessor::new(
            StorageWriter::new(Arc::new(store), retry.clone(), metrics.clone()),
            NotificationPublisher::new(Arc::new(publisher), "events", retry, metrics.clone()),
            consumer,
            metrics,
        )
    }

    fn named<T>(mut mock: T, set: impl FnOnce(&mut T)) -> T {
        set(&mut mock);
        mock
    }

    fn store() -> MockObjectStore {
        named(MockObjectStore::new(), |m| {
            m.expect_name().return_const("mock");
        })
    }

    fn publisher() -> MockPublisher {
        named(MockPublisher::new(), |m| {
            m.expect_name().return_const("mock");
        })
    }

    fn queue() -> MockQueueClient {
        named(MockQueueClient::new(), |m| {
            m.expect_name().return_const("mock");
        })
    }

    fn message_42() -> Message {
        Message::new("42", "hello", ReceiptToken::new("receipt-42"))
    }

    #[tokio::test]
    async fn test_store_notify_delete_in_order() {
        let mut seq = Sequence::new();
        let mut store = store();
        let mut publisher = publisher();
        let mut queue = queue();

        store
            .expect_put()
            .withf(|key, body| key.as_str() == "message-42.txt" && body[..] == b"hello"[..])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        publisher
            .expect_publish()
            .withf(|_, payload| {
                payload["sourceMessageId"] == "42" && payload["storageKey"] == "message-42.txt"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        queue
            .expect_delete()
            .with(eq(ReceiptToken::new("receipt-42")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let outcome = build(store, publisher, queue).process(message_42()).await;

        assert_eq!(outcome, ProcessingOutcome::acknowledged("42"));
    }

    #[tokio::test]
    async fn test_permanent_storage_failure_skips_notify_and_delete() {
        let mut store = store();
        let mut publisher = publisher();
        let mut queue = queue();

        store
            .expect_put()
            .times(1)
            .returning(|_, _| Err(PipelineError::permanent("AccessDenied")));
        publisher.expect_publish().never();
        queue.expect_delete().never();

        let outcome = build(store, publisher, queue).process(message_42()).await;

        assert_eq!(outcome.state, ProcessingState::Failed);
        assert_eq!(outcome.reached, ProcessingState::Received);
        assert_eq!(outcome.error, Some(ErrorKind::Permanent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_failure_leaves_message_undeleted() {
        let mut store = store();
        let mut publisher = publisher();
        let mut queue = queue();

        store.expect_put().times(1).returning(|_, _| Ok(()));
        publisher
            .expect_publish()
            .times(2)
            .returning(|_, _| Err(PipelineError::transient("Throttling")));
        queue.expect_delete().never();

        let outcome = build(store, publisher, queue).process(message_42()).await;

        assert_eq!(outcome.reached, ProcessingState::Stored);
        assert_eq!(outcome.error, Some(ErrorKind::Transient));
        assert_eq!(outcome.label(), "failed:transient");
    }

    #[tokio::test]
    async fn test_expired_receipt_on_delete_fails_message() {
        let mut store = store();
        let mut publisher = publisher();
        let mut queue = queue();

        store.expect_put().returning(|_, _| Ok(()));
        publisher.expect_publish().returning(|_, _| Ok(()));
        queue
            .expect_delete()
            .times(1)
            .returning(|_| Err(PipelineError::receipt_expired("ReceiptHandleIsInvalid")));

        let outcome = build(store, publisher, queue).process(message_42()).await;

        assert_eq!(outcome.reached, ProcessingState::Notified);
        assert_eq!(outcome.error, Some(ErrorKind::ReceiptExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_visibility_during_slow_steps() {
        let mut queue = queue();

        queue
            .expect_extend_visibility()
            .with(eq(ReceiptToken::new("receipt-42")), eq(Duration::from_secs(30)))
            .times(2)
            .returning(|_, _| Ok(()));

        let processor = build(store(), publisher(), queue)
            .with_visibility_heartbeat(Duration::from_secs(30));

        let steps = async {
            tokio::time::sleep(Duration::from_secs(40)).await;
            ProcessingOutcome::acknowledged("42")
        };
        let outcome = processor
            .with_heartbeat(&ReceiptToken::new("receipt-42"), Duration::from_secs(30), steps)
            .await;

        // Ticks at 15s and 30s, finished at 40s
        assert!(outcome.success());
    }

    /// Queue whose visibility extensions take `extend_latency` to answer.
    struct SlowExtensionQueue {
        extend_latency: Duration,
    }

    #[async_trait::async_trait]
    impl QueueClient for SlowExtensionQueue {
        async fn receive(&self, _: usize, _: Duration) -> PipelineResult<Vec<Message>> {
            Ok(vec![])
        }

        async fn delete(&self, _: &ReceiptToken) -> PipelineResult<()> {
            Ok(())
        }

        async fn extend_visibility(&self, _: &ReceiptToken, _: Duration) -> PipelineResult<()> {
            tokio::time::sleep(self.extend_latency).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow-extension"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_extension_does_not_delay_steps() {
        let metrics = PipelineMetrics::new("test");
        let retry = RetryPolicy::no_retry();
        let consumer = Arc::new(QueueConsumer::new(
            Arc::new(SlowExtensionQueue {
                extend_latency: Duration::from_secs(20),
            }),
            metrics.clone(),
        ));
        let processor = MessageProcessor::new(
            StorageWriter::new(Arc::new(store()), retry.clone(), metrics.clone()),
            NotificationPublisher::new(Arc::new(publisher()), "events", retry, metrics.clone()),
            consumer,
            metrics,
        );

        let started = Instant::now();
        let steps = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            ProcessingOutcome::acknowledged("42")
        };
        let outcome = processor
            .with_heartbeat(&ReceiptToken::new("receipt-42"), Duration::from_secs(4), steps)
            .await;

        assert!(outcome.success());
        // First extension starts at 2s and is still pending when the steps finish
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_receipt_stops_heartbeat() {
        let mut queue = queue();
        queue
            .expect_extend_visibility()
            .times(1)
            .returning(|_, _| Err(PipelineError::receipt_expired("ReceiptHandleIsInvalid")));

        let processor = build(store(), publisher(), queue);

        let steps = async {
            tokio::time::sleep(Duration::from_secs(40)).await;
            ProcessingOutcome::acknowledged("42")
        };
        let outcome = processor
            .with_heartbeat(&ReceiptToken::new("receipt-42"), Duration::from_secs(30), steps)
            .await;

        // Only the 15s tick reaches the queue; steps still run to their end
        assert!(outcome.success());
    }

    #[test]
    fn test_zero_visibility_disables_heartbeat() {
        let processor = build(store(), publisher(), queue())
            .with_visibility_heartbeat(Duration::ZERO);
        assert!(processor.visibility_timeout.is_none());
    }
}
