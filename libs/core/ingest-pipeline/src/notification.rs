//! Fan-out notifications
//!
//! [`Publisher`] is the raw topic capability; [`NotificationPublisher`]
//! serializes a [`NotificationEvent`] and publishes it to the configured
//! topic under the shared retry policy.

use crate::error::PipelineResult;
use crate::message::NotificationEvent;
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Notification capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a structured payload to `topic`.
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> PipelineResult<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Publishes delivery events to one topic.
#[derive(Clone)]
pub struct NotificationPublisher {
    publisher: Arc<dyn Publisher>,
    topic: String,
    retry: RetryPolicy,
    metrics: PipelineMetrics,
}

impl NotificationPublisher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topic: impl Into<String>,
        retry: RetryPolicy,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            retry,
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[instrument(
        skip(self, event),
        fields(message_id = %event.source_message_id, topic = %self.topic)
    )]
    pub async fn publish(&self, event: &NotificationEvent) -> PipelineResult<()> {
        let payload = serde_json::to_value(event)?;

        self.retry
            .run(
                "notification.publish",
                || self.publisher.publish(&self.topic, &payload),
                |_, _| self.metrics.retried("notification.publish"),
            )
            .await?;

        debug!(backend = self.publisher.name(), "Notification published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PipelineError};
    use crate::message::StorageKey;
    use std::time::Duration;

    fn notifier(publisher: MockPublisher, attempts: u32) -> NotificationPublisher {
        NotificationPublisher::new(
            Arc::new(publisher),
            "arn:aws:sns:us-east-1:000000000000:ingest-events",
            RetryPolicy::new(attempts, Duration::from_millis(10), Duration::from_millis(50)),
            PipelineMetrics::new("test"),
        )
    }

    #[tokio::test]
    async fn test_publishes_event_json_to_topic() {
        let mut publisher = MockPublisher::new();
        publisher.expect_name().return_const("mock");
        publisher
            .expect_publish()
            .withf(|topic, payload| {
                topic.ends_with(":ingest-events")
                    && payload["sourceMessageId"] == "42"
                    && payload["storageKey"] == "message-42.txt"
                    && payload["status"] == "Success"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let event = NotificationEvent::stored("42", StorageKey::for_message("42"));
        assert!(notifier(publisher, 3).publish(&event).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_uses_same_policy() {
        let mut publisher = MockPublisher::new();
        publisher.expect_name().return_const("mock");
        publisher
            .expect_publish()
            .times(3)
            .returning(|_, _| Err(PipelineError::transient("Throttling")));

        let event = NotificationEvent::stored("1", StorageKey::for_message("1"));
        let err = notifier(publisher, 3).publish(&event).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let mut publisher = MockPublisher::new();
        publisher.expect_name().return_const("mock");
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(PipelineError::permanent("AuthorizationError")));

        let event = NotificationEvent::stored("1", StorageKey::for_message("1"));
        let err = notifier(publisher, 3).publish(&event).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
